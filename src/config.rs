//! Environment driven settings.

use std::path::PathBuf;
use std::time::Duration;

pub const STORAGE_DIR_ENV: &str = "MAILMERGE_STORAGE_DIR";
pub const PUBLIC_URL_ENV: &str = "MAILMERGE_PUBLIC_URL";
pub const CACHE_DIR_ENV: &str = "MAILMERGE_CACHE_DIR";
pub const RASTERIZE_TIMEOUT_ENV: &str = "MAILMERGE_RASTERIZE_TIMEOUT_SECS";
/// Extra font directories, `:` separated (`;` on Windows).
pub const FONTS_ENV: &str = "MAILMERGE_FONTS";

/// Uploaded source documents and rasterized backgrounds live here.
pub const TEMPLATE_SUBDIR: &str = "pdf-templates";

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub storage_dir: PathBuf,
    pub public_url_prefix: String,
    cache_dir: Option<PathBuf>,
    pub rasterize_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("storage"),
            public_url_prefix: "/storage".to_string(),
            cache_dir: None,
            rasterize_timeout: Duration::from_secs(120),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any key lookup. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();

        let rasterize_timeout = match get(RASTERIZE_TIMEOUT_ENV) {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    log::warn!("Ignoring {RASTERIZE_TIMEOUT_ENV}={raw}, expected a positive number of seconds");
                    defaults.rasterize_timeout
                }
            },
            None => defaults.rasterize_timeout,
        };

        Settings {
            storage_dir: get(STORAGE_DIR_ENV).map(PathBuf::from).unwrap_or(defaults.storage_dir),
            public_url_prefix: get(PUBLIC_URL_ENV)
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(defaults.public_url_prefix),
            cache_dir: get(CACHE_DIR_ENV).map(PathBuf::from),
            rasterize_timeout,
        }
    }

    pub fn with_storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage_dir = dir.into();
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Where rasterized backgrounds are written.
    pub fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.storage_dir.join(TEMPLATE_SUBDIR))
    }

    pub fn raster_options(&self) -> crate::background::RasterOptions {
        crate::background::RasterOptions {
            timeout: self.rasterize_timeout,
            ..Default::default()
        }
    }
}
