//! Template driven PDF mail merge.
//!
//! Rows come from a spreadsheet ([`import_rows`]), fields come from a
//! [`Template`], and [`BatchGenerator`] renders one PDF per row on top of an
//! optional background taken from page 1 of an uploaded PDF.

pub mod background;
pub mod batch;
pub mod config;
mod error;
mod fonts;
mod images;
pub mod import;
pub mod markup;
pub mod model;
pub mod pdf;
pub mod units;
pub mod upload;

pub use background::{BackgroundResolver, RasterOptions, Rasterizer};
pub use batch::{BatchGenerator, BatchReport, BatchRequest, BatchState, FailurePolicy};
pub use config::Settings;
pub use error::Error;
pub use import::{ImportedSheet, import_rows};
pub use model::{CellValue, ColumnMapping, GeneratedDocument, Row, Template};
pub use pdf::{RenderConfig, Renderer};
pub use upload::{StoredDocument, store_source_document};

/// Runs a batch with the default failure policy and rasterizers.
pub fn generate_documents(
    request: &BatchRequest,
    settings: &Settings,
    config: RenderConfig,
) -> Result<BatchReport, Error> {
    BatchGenerator::from_settings(settings, config).generate(request)
}
