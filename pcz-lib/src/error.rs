use std::{fmt, io};

#[derive(Debug)]
pub enum PczError {
    InvalidInput(String),
    DegenerateGeometry(String),
    UnsupportedAttribute(String),
    CorruptContainer(String),
    ZstdCompress(String),
    IoError(io::Error),
}

impl fmt::Display for PczError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PczError::InvalidInput(e) => {
                write!(f, "Invalid input point cloud: {}", e)
            }
            PczError::DegenerateGeometry(e) => {
                write!(f, "Degenerate geometry: {}", e)
            }
            PczError::UnsupportedAttribute(e) => {
                write!(f, "Unsupported attribute: {}", e)
            }
            PczError::CorruptContainer(e) => {
                write!(f, "Corrupt container: {}", e)
            }
            PczError::ZstdCompress(e) => {
                write!(f, "Zstandard compression failed: {}", e)
            }
            PczError::IoError(e) => {
                write!(f, "An I/O error occurred: {}", e)
            }
        }
    }
}

impl std::error::Error for PczError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PczError::IoError(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PczError {
    fn from(e: io::Error) -> Self {
        PczError::IoError(e)
    }
}
