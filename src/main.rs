use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::{Args, Parser, Subcommand};
use mailmerge_pdf::{
    BatchGenerator, BatchRequest, ColumnMapping, Error, FailurePolicy, RenderConfig, Settings, Template,
    import_rows, markup, store_source_document,
};

#[derive(Parser)]
#[command(name = "mailmerge-pdf", about = "Fill PDF templates from spreadsheet rows")]
struct Cli {
    /// Storage root (overrides MAILMERGE_STORAGE_DIR)
    #[arg(long, global = true)]
    storage_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List the column headers of a spreadsheet
    Columns {
        data: PathBuf,
        /// Print headers and rows as JSON
        #[arg(long)]
        json: bool,
    },
    /// Store a PDF to use as a template background
    Upload { pdf: PathBuf },
    /// Render one PDF per data row
    Generate {
        #[command(flatten)]
        input: MergeInput,
        /// Output directory for the PDFs
        #[arg(long, short, default_value = ".")]
        out: PathBuf,
        /// Keep going when a row fails to render
        #[arg(long)]
        skip_failed_rows: bool,
        /// Print the batch report as JSON instead of writing files
        #[arg(long)]
        json: bool,
        /// Raster image resolution cap
        #[arg(long, default_value_t = 200)]
        image_dpi: u32,
        /// Do not fetch http(s) images
        #[arg(long)]
        no_remote_images: bool,
        /// Directory image fields may read local files from
        #[arg(long)]
        image_root: Option<PathBuf>,
        /// Only use the built-in PDF fonts
        #[arg(long)]
        no_system_fonts: bool,
    },
    /// Write the HTML markup for one row
    Preview {
        #[command(flatten)]
        input: MergeInput,
        /// 1-based row to preview
        #[arg(long, default_value_t = 1)]
        row: usize,
        /// Output HTML file
        #[arg(long, short, default_value = "preview.html")]
        out: PathBuf,
    },
}

#[derive(Args)]
struct MergeInput {
    /// Template JSON
    #[arg(long)]
    template: PathBuf,
    /// Rows: .xlsx, .csv or .json
    #[arg(long)]
    data: PathBuf,
    /// Column mapping JSON
    #[arg(long)]
    mapping: PathBuf,
    /// PDF whose first page is used as background
    #[arg(long)]
    source_pdf: Option<PathBuf>,
    /// Pre-rendered background image (binary, data URI or base64 text)
    #[arg(long)]
    page_image: Option<PathBuf>,
}

impl MergeInput {
    fn load(&self) -> Result<BatchRequest, Error> {
        let template: Template = serde_json::from_slice(&std::fs::read(&self.template)?)?;
        let mapping: ColumnMapping = serde_json::from_slice(&std::fs::read(&self.mapping)?)?;
        let sheet = import_rows(&self.data)?;
        let page_image = self.page_image.as_deref().map(read_page_image).transpose()?;
        Ok(BatchRequest {
            template,
            rows: sheet.rows,
            mapping,
            source_document: self.source_pdf.clone(),
            page_image,
        })
    }
}

fn read_page_image(path: &Path) -> Result<String, Error> {
    let bytes = std::fs::read(path)?;
    if bytes.starts_with(b"data:") {
        return Ok(String::from_utf8_lossy(&bytes).trim().to_string());
    }
    if image::guess_format(&bytes).is_ok() {
        return Ok(STANDARD.encode(&bytes));
    }
    Ok(String::from_utf8_lossy(&bytes).trim().to_string())
}

fn run(cli: Cli) -> Result<(), Error> {
    let mut settings = Settings::from_env();
    if let Some(dir) = cli.storage_dir {
        settings = settings.with_storage_dir(dir);
    }

    match cli.command {
        Command::Columns { data, json } => {
            let sheet = import_rows(&data)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sheet)?);
            } else {
                for column in &sheet.columns {
                    println!("{column}");
                }
                eprintln!("{} row(s)", sheet.rows.len());
            }
        }
        Command::Upload { pdf } => {
            let stored = store_source_document(&pdf, &settings)?;
            println!("{}", serde_json::to_string_pretty(&stored)?);
        }
        Command::Generate {
            input,
            out,
            skip_failed_rows,
            json,
            image_dpi,
            no_remote_images,
            image_root,
            no_system_fonts,
        } => {
            let request = input.load()?;
            let config = RenderConfig {
                image_dpi,
                remote_images: !no_remote_images,
                image_root,
                system_fonts: !no_system_fonts,
                ..Default::default()
            };
            let policy = if skip_failed_rows {
                FailurePolicy::SkipFailedRows
            } else {
                FailurePolicy::AbortBatch
            };
            let report = BatchGenerator::from_settings(&settings, config)
                .with_policy(policy)
                .generate(&request)?;

            if json {
                println!("{}", serde_json::to_string(&report)?);
            } else {
                std::fs::create_dir_all(&out)?;
                for doc in &report.pdfs {
                    let bytes = STANDARD
                        .decode(&doc.base64)
                        .map_err(|e| Error::Render(format!("{}: {e}", doc.filename)))?;
                    std::fs::write(out.join(&doc.filename), bytes)?;
                }
                for failure in &report.failures {
                    eprintln!("Row {} failed: {}", failure.index, failure.reason);
                }
                println!("{} ({} file(s) in {})", report.message, report.pdfs.len(), out.display());
            }
            if !report.success {
                std::process::exit(2);
            }
        }
        Command::Preview { input, row, out } => {
            let request = input.load()?;
            let Some(data) = row.checked_sub(1).and_then(|i| request.rows.get(i)) else {
                return Err(Error::Import(format!(
                    "row {row} out of range, sheet has {} row(s)",
                    request.rows.len()
                )));
            };
            let resolver = mailmerge_pdf::BackgroundResolver::new(settings.cache_dir(), settings.raster_options());
            let background =
                resolver.resolve(request.source_document.as_deref(), request.page_image.as_deref());
            let page = RenderConfig::default().page;
            let html = markup::project(&request.template, data, &request.mapping, &background, page).to_html();
            std::fs::write(&out, html)?;
            println!("{}", out.display());
        }
    }
    Ok(())
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
