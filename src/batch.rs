//! One template, many rows, one PDF per row.

use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;

use crate::background::BackgroundResolver;
use crate::config::Settings;
use crate::error::Error;
use crate::markup;
use crate::model::{BackgroundSource, ColumnMapping, GeneratedDocument, Row, Template};
use crate::pdf::{RenderConfig, Renderer};

pub const MSG_SUCCESS: &str = "PDFs generated successfully";
pub const MSG_NOTHING_GENERATED: &str = "No PDFs were generated. Please check your template and data.";
pub const MSG_INVALID_OUTPUT: &str = "PDFs were generated but are invalid. Please check your template and data.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    ValidatingInput,
    BackgroundResolved,
    RenderingRows,
    Completed,
    Failed,
}

/// What happens when a single row fails to render.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// The whole batch fails and nothing is returned.
    #[default]
    AbortBatch,
    /// The row is recorded in [`BatchReport::failures`] and the batch goes on.
    SkipFailedRows,
}

#[derive(Clone, Debug, Default)]
pub struct BatchRequest {
    pub template: Template,
    pub rows: Vec<Row>,
    pub mapping: ColumnMapping,
    /// Uploaded PDF whose first page becomes the background.
    pub source_document: Option<PathBuf>,
    /// Pre-rendered page image (data URI or base64). Wins over `source_document`.
    pub page_image: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RowFailure {
    pub index: usize,
    pub reason: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchReport {
    pub success: bool,
    pub message: String,
    pub pdfs: Vec<GeneratedDocument>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<RowFailure>,
}

impl BatchReport {
    fn soft_failure(message: &str, failures: Vec<RowFailure>) -> Self {
        BatchReport {
            success: false,
            message: message.to_string(),
            pdfs: Vec::new(),
            failures,
        }
    }
}

/// `NNNNNN.pdf`, unique within a batch of at most a million rows.
pub fn filename_for(base_micros: u64, index: usize) -> String {
    format!("{:06}.pdf", (base_micros + index as u64) % 1_000_000)
}

fn wall_clock_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

fn check_dimension(what: &str, value: f32, page: usize, field: usize) -> Result<(), Error> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(Error::InvalidTemplate(format!(
            "page {page} field {field}: {what} must be a finite, non-negative number, got {value}"
        )))
    }
}

/// Structural checks done before any expensive work.
pub fn validate_template(template: &Template) -> Result<(), Error> {
    if template.pages.is_empty() {
        return Err(Error::InvalidTemplate("template must have at least one page".into()));
    }
    for (p, page) in template.pages.iter().enumerate() {
        for (f, field) in page.fields.iter().enumerate() {
            let (p, f) = (p + 1, f + 1);
            check_dimension("x", field.x, p, f)?;
            check_dimension("y", field.y, p, f)?;
            check_dimension("width", field.width, p, f)?;
            check_dimension("height", field.height, p, f)?;
            let size = field.style.font_size_pt;
            if !(size.is_finite() && size > 0.0) {
                return Err(Error::InvalidTemplate(format!(
                    "page {p} field {f}: font size must be positive, got {size}"
                )));
            }
        }
    }
    Ok(())
}

pub struct BatchGenerator {
    resolver: BackgroundResolver,
    renderer: Renderer,
    policy: FailurePolicy,
    state: BatchState,
}

impl BatchGenerator {
    pub fn new(resolver: BackgroundResolver, config: RenderConfig) -> Self {
        Self {
            resolver,
            renderer: Renderer::new(config),
            policy: FailurePolicy::default(),
            state: BatchState::Idle,
        }
    }

    pub fn from_settings(settings: &Settings, config: RenderConfig) -> Self {
        let resolver = BackgroundResolver::new(settings.cache_dir(), settings.raster_options());
        Self::new(resolver, config)
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> BatchState {
        self.state
    }

    fn transition(&mut self, next: BatchState) {
        log::debug!("Batch state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: Error) -> Error {
        self.transition(BatchState::Failed);
        err
    }

    pub fn generate(&mut self, request: &BatchRequest) -> Result<BatchReport, Error> {
        self.state = BatchState::Idle;
        let started = Instant::now();

        if request.rows.is_empty() {
            log::warn!("No rows supplied, nothing to generate");
            self.transition(BatchState::Completed);
            return Ok(BatchReport::soft_failure(MSG_NOTHING_GENERATED, Vec::new()));
        }

        self.transition(BatchState::ValidatingInput);
        if let Err(e) = validate_template(&request.template) {
            return Err(self.fail(e));
        }
        log::debug!(
            "Template {:?}: {} page(s), {} field(s), {} row(s), {} mapped column(s)",
            request.template.name,
            request.template.pages.len(),
            request.template.pages.iter().map(|p| p.fields.len()).sum::<usize>(),
            request.rows.len(),
            request.mapping.len()
        );

        let background = self
            .resolver
            .resolve(request.source_document.as_deref(), request.page_image.as_deref());
        self.transition(BatchState::BackgroundResolved);

        self.transition(BatchState::RenderingRows);
        self.renderer.clear_image_cache();
        let base_micros = wall_clock_micros();
        let mut documents = Vec::with_capacity(request.rows.len());
        let mut failures = Vec::new();

        for (i, row) in request.rows.iter().enumerate() {
            let row_started = Instant::now();
            match self.render_row(request, row, &background) {
                Ok(bytes) => {
                    log::debug!(
                        "Row {} rendered, {} bytes in {:.1}ms",
                        i + 1,
                        bytes.len(),
                        row_started.elapsed().as_secs_f64() * 1000.0
                    );
                    documents.push(GeneratedDocument {
                        filename: filename_for(base_micros, i),
                        index: i + 1,
                        base64: STANDARD.encode(&bytes),
                    });
                }
                Err(e) => match self.policy {
                    FailurePolicy::AbortBatch => {
                        return Err(self.fail(Error::Batch {
                            row: i + 1,
                            reason: e.to_string(),
                        }));
                    }
                    FailurePolicy::SkipFailedRows => {
                        log::warn!("Skipping row {}: {e}", i + 1);
                        failures.push(RowFailure {
                            index: i + 1,
                            reason: e.to_string(),
                        });
                    }
                },
            }
        }

        self.renderer.clear_image_cache();
        let rendered = documents.len();
        documents.retain(|d| !d.base64.is_empty());
        if documents.len() < rendered {
            log::warn!("Dropped {} document(s) with an empty payload", rendered - documents.len());
        }
        self.transition(BatchState::Completed);

        if documents.is_empty() {
            let message = if rendered == 0 { MSG_NOTHING_GENERATED } else { MSG_INVALID_OUTPUT };
            log::warn!("{message}");
            return Ok(BatchReport::soft_failure(message, failures));
        }

        let payload: usize = documents.iter().map(|d| d.base64.len()).sum();
        log::info!(
            "Generated {} PDF(s) for {} row(s), {:.2} MB, in {:.1}ms",
            documents.len(),
            request.rows.len(),
            payload as f64 / 1024.0 / 1024.0,
            started.elapsed().as_secs_f64() * 1000.0
        );

        Ok(BatchReport {
            success: true,
            message: MSG_SUCCESS.to_string(),
            pdfs: documents,
            failures,
        })
    }

    fn render_row(
        &self,
        request: &BatchRequest,
        row: &Row,
        background: &BackgroundSource,
    ) -> Result<Vec<u8>, Error> {
        let page = self.renderer.config().page;
        let markup = markup::project(&request.template, row, &request.mapping, background, page);
        self.renderer.render(&markup, page.width_mm, page.height_mm)
    }
}
