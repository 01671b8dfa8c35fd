//! Storage of uploaded source documents.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;
use uuid::Uuid;

use crate::config::{Settings, TEMPLATE_SUBDIR};
use crate::error::Error;
use crate::units::PageSize;

/// Page size in millimeters.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PageDimensions {
    pub width: f32,
    pub height: f32,
}

impl From<PageSize> for PageDimensions {
    fn from(page: PageSize) -> Self {
        PageDimensions {
            width: page.width_mm,
            height: page.height_mm,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StoredDocument {
    pub file_path: PathBuf,
    pub file_url: String,
    pub dimensions: PageDimensions,
}

fn looks_like_pdf(path: &Path) -> Result<bool, Error> {
    use std::io::Read;
    let mut magic = [0u8; 5];
    let mut file = std::fs::File::open(path)?;
    let n = file.read(&mut magic)?;
    Ok(n == magic.len() && &magic == b"%PDF-")
}

/// Copies `source` into `<storage>/pdf-templates/<uuid>_<unix>.pdf`.
///
/// The reported dimensions are always A4; the document itself is not inspected.
pub fn store_source_document(source: &Path, settings: &Settings) -> Result<StoredDocument, Error> {
    if !looks_like_pdf(source)? {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} is not a PDF document", source.display()),
        )));
    }

    let dir = settings.storage_dir.join(TEMPLATE_SUBDIR);
    std::fs::create_dir_all(&dir)?;

    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let filename = format!("{}_{unix}.pdf", Uuid::new_v4().simple());
    let file_path = dir.join(&filename);
    std::fs::copy(source, &file_path)?;
    log::info!("Stored {} as {}", source.display(), file_path.display());

    Ok(StoredDocument {
        file_url: format!("{}/{TEMPLATE_SUBDIR}/{filename}", settings.public_url_prefix),
        file_path,
        dimensions: PageSize::A4.into(),
    })
}
