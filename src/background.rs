//! Background selection for a batch.
//!
//! A page image supplied by the caller is used as is. Otherwise page 1 of the
//! uploaded PDF is rasterized by the first external tool that is installed and
//! succeeds. When nothing works the batch simply renders without a background.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::error::Error;
use crate::model::BackgroundSource;

pub const NO_RASTERIZER_WARNING: &str =
    "No PDF to image conversion tool available. PDF background may not be included.";

#[derive(Clone, Debug)]
pub struct RasterOptions {
    pub dpi: u32,
    pub jpeg_quality: u8,
    pub timeout: Duration,
}

impl Default for RasterOptions {
    fn default() -> Self {
        Self {
            dpi: 200,
            jpeg_quality: 85,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Renders page 1 of a PDF to a JPEG file inside `out_dir`.
pub trait Rasterizer {
    fn name(&self) -> &str;
    fn is_available(&self) -> bool;
    fn rasterize(&self, pdf: &Path, out_dir: &Path, opts: &RasterOptions) -> Result<PathBuf, Error>;
}

/// Probes `PATH` with `which` (`where` on Windows).
pub fn command_exists(command: &str) -> bool {
    let locator = if cfg!(windows) { "where" } else { "which" };
    Command::new(locator)
        .arg(command)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .map(|out| out.status.success() && !out.stdout.is_empty())
        .unwrap_or(false)
}

fn run_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<(), Error> {
    let program = cmd.get_program().to_string_lossy().into_owned();
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            if status.success() {
                return Ok(());
            }
            return Err(Error::Rasterize(format!("{program} exited with {status}")));
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Rasterize(format!(
                "{program} timed out after {}s",
                timeout.as_secs()
            )));
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn unique_stem() -> String {
    format!("{}_page1", Uuid::new_v4().simple())
}

/// Ghostscript's `jpeg` device.
pub struct Ghostscript;

impl Rasterizer for Ghostscript {
    fn name(&self) -> &str {
        "gs"
    }

    fn is_available(&self) -> bool {
        command_exists("gs")
    }

    fn rasterize(&self, pdf: &Path, out_dir: &Path, opts: &RasterOptions) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(out_dir)?;
        let out = out_dir.join(format!("{}.jpg", unique_stem()));
        let mut cmd = Command::new("gs");
        cmd.args(["-dNOPAUSE", "-dBATCH", "-sDEVICE=jpeg"])
            .arg(format!("-dJPEGQ={}", opts.jpeg_quality))
            .arg(format!("-r{}", opts.dpi))
            .args(["-dFirstPage=1", "-dLastPage=1"])
            .arg(format!("-sOutputFile={}", out.display()))
            .arg(pdf);
        run_with_timeout(&mut cmd, opts.timeout)?;
        if out.is_file() {
            Ok(out)
        } else {
            Err(Error::Rasterize("gs produced no output file".into()))
        }
    }
}

/// Poppler's `pdftoppm`.
pub struct Pdftoppm;

impl Rasterizer for Pdftoppm {
    fn name(&self) -> &str {
        "pdftoppm"
    }

    fn is_available(&self) -> bool {
        command_exists("pdftoppm")
    }

    fn rasterize(&self, pdf: &Path, out_dir: &Path, opts: &RasterOptions) -> Result<PathBuf, Error> {
        std::fs::create_dir_all(out_dir)?;
        let stem = unique_stem();
        let prefix = out_dir.join(&stem);
        let mut cmd = Command::new("pdftoppm");
        cmd.args(["-jpeg", "-jpegopt"])
            .arg(format!("quality={}", opts.jpeg_quality))
            .args(["-f", "1", "-l", "1", "-r"])
            .arg(opts.dpi.to_string())
            .arg(pdf)
            .arg(&prefix);
        run_with_timeout(&mut cmd, opts.timeout)?;

        // The page suffix is zero-padded to the document's page count: -1, -01, ...
        let produced = std::fs::read_dir(out_dir)?
            .flatten()
            .map(|e| e.path())
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&format!("{stem}-")) && n.ends_with(".jpg"))
            })
            .ok_or_else(|| Error::Rasterize("pdftoppm produced no output file".into()))?;

        let out = prefix.with_extension("jpg");
        std::fs::rename(&produced, &out)?;
        Ok(out)
    }
}

pub fn default_rasterizers() -> Vec<Box<dyn Rasterizer>> {
    vec![Box::new(Ghostscript), Box::new(Pdftoppm)]
}

pub struct BackgroundResolver {
    rasterizers: Vec<Box<dyn Rasterizer>>,
    cache_dir: PathBuf,
    options: RasterOptions,
}

impl BackgroundResolver {
    pub fn new(cache_dir: impl Into<PathBuf>, options: RasterOptions) -> Self {
        Self::with_rasterizers(cache_dir, options, default_rasterizers())
    }

    pub fn with_rasterizers(
        cache_dir: impl Into<PathBuf>,
        options: RasterOptions,
        rasterizers: Vec<Box<dyn Rasterizer>>,
    ) -> Self {
        Self {
            rasterizers,
            cache_dir: cache_dir.into(),
            options,
        }
    }

    pub fn resolve(&self, source_pdf: Option<&Path>, page_image: Option<&str>) -> BackgroundSource {
        if let Some(payload) = page_image.map(str::trim).filter(|p| !p.is_empty()) {
            log::debug!("Using caller supplied page image ({} bytes)", payload.len());
            return BackgroundSource::EmbeddedImage(payload.to_string());
        }

        let Some(pdf) = source_pdf else {
            return BackgroundSource::None;
        };
        if !pdf.is_file() {
            log::warn!("Source document not found: {}, rendering without background", pdf.display());
            return BackgroundSource::None;
        }

        for rasterizer in &self.rasterizers {
            if !rasterizer.is_available() {
                log::debug!("Rasterizer {} not installed", rasterizer.name());
                continue;
            }
            let started = Instant::now();
            match rasterizer.rasterize(pdf, &self.cache_dir, &self.options) {
                Ok(path) => {
                    log::info!(
                        "Rasterized {} with {} in {:.1}ms",
                        pdf.display(),
                        rasterizer.name(),
                        started.elapsed().as_secs_f64() * 1000.0
                    );
                    return BackgroundSource::RasterizedFile(path);
                }
                Err(e) => log::warn!("{} failed on {}: {e}", rasterizer.name(), pdf.display()),
            }
        }

        log::warn!("{NO_RASTERIZER_WARNING}");
        BackgroundSource::None
    }
}
