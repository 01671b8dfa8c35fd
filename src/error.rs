use std::fmt;

#[derive(Debug)]
pub enum Error {
    Import(String),
    Zip(zip::result::ZipError),
    Xml(roxmltree::Error),
    Csv(csv::Error),
    Json(serde_json::Error),
    InvalidTemplate(String),
    Rasterize(String),
    Render(String),
    Image(String),
    Batch { row: usize, reason: String },
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Import(reason) => write!(f, "cannot import tabular data: {reason}"),
            Error::Zip(e) => write!(f, "ZIP error: {e}"),
            Error::Xml(e) => write!(f, "XML error: {e}"),
            Error::Csv(e) => write!(f, "CSV error: {e}"),
            Error::Json(e) => write!(f, "JSON error: {e}"),
            Error::InvalidTemplate(reason) => write!(f, "invalid template: {reason}"),
            Error::Rasterize(reason) => write!(f, "rasterization failed: {reason}"),
            Error::Render(reason) => write!(f, "render error: {reason}"),
            Error::Image(reason) => write!(f, "image error: {reason}"),
            Error::Batch { row, reason } => {
                write!(f, "batch aborted at row {row}: {reason}")
            }
            Error::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Zip(e) => Some(e),
            Error::Xml(e) => Some(e),
            Error::Csv(e) => Some(e),
            Error::Json(e) => Some(e),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Error::Zip(e)
    }
}

impl From<roxmltree::Error> for Error {
    fn from(e: roxmltree::Error) -> Self {
        Error::Xml(e)
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Csv(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<image::ImageError> for Error {
    fn from(e: image::ImageError) -> Self {
        Error::Image(e.to_string())
    }
}
