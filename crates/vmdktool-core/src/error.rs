//! Error types for the vmdktool core library.

use std::path::PathBuf;

/// The main error type for VMDK operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error with optional path context.
    #[error("I/O error{}: {source}", path.as_ref().map(|p| format!(" at '{}'", p.display())).unwrap_or_default())]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    /// Error parsing the descriptor text.
    #[error("descriptor error: {message}")]
    Descriptor { message: String },

    /// Malformed on-disk structure (header, grain directory, grain table, extent layout).
    #[error("invalid image structure: {message}")]
    Structural { message: String },

    /// Operation invoked before the disk or its extent data files were opened.
    #[error("not open: {message}")]
    NotOpen { message: String },

    /// Invalid extent index or seek target.
    #[error("out of bounds: {message}")]
    Bounds { message: String },

    /// Format variant this reader does not handle.
    #[error("unsupported: {message}")]
    Unsupported { message: String },
}

/// A specialized Result type for VMDK operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Descriptor or on-disk structure is invalid; fatal to open.
    Structural,
    /// Wrong lifecycle state; retry after the missing open step.
    NotOpen,
    /// Backing-store failure.
    Io,
    /// Invalid index or position; state unchanged.
    Bounds,
    /// Outside the supported format variants.
    Unsupported,
}

impl Error {
    /// Create an I/O error with path context.
    pub fn io(source: std::io::Error, path: impl Into<PathBuf>) -> Self {
        Self::Io {
            source,
            path: Some(path.into()),
        }
    }

    /// Create an I/O error without path context.
    pub fn io_simple(source: std::io::Error) -> Self {
        Self::Io { source, path: None }
    }

    /// Create a descriptor parse error.
    pub fn descriptor(message: impl Into<String>) -> Self {
        Self::Descriptor {
            message: message.into(),
        }
    }

    /// Create a structural error.
    pub fn structural(message: impl Into<String>) -> Self {
        Self::Structural {
            message: message.into(),
        }
    }

    /// Create a not-open error.
    pub fn not_open(message: impl Into<String>) -> Self {
        Self::NotOpen {
            message: message.into(),
        }
    }

    /// Create a bounds error.
    pub fn bounds(message: impl Into<String>) -> Self {
        Self::Bounds {
            message: message.into(),
        }
    }

    /// Create an unsupported-format error.
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io { .. } => ErrorKind::Io,
            Error::Descriptor { .. } | Error::Structural { .. } => ErrorKind::Structural,
            Error::NotOpen { .. } => ErrorKind::NotOpen,
            Error::Bounds { .. } => ErrorKind::Bounds,
            Error::Unsupported { .. } => ErrorKind::Unsupported,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(source: std::io::Error) -> Self {
        Self::io_simple(source)
    }
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io { source, .. } => source,
            Error::Bounds { .. } => std::io::Error::new(std::io::ErrorKind::InvalidInput, err),
            Error::Unsupported { .. } => std::io::Error::new(std::io::ErrorKind::Unsupported, err),
            _ => std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        }
    }
}
