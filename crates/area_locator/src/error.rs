use std::path::PathBuf;

/// Everything that can go wrong while turning an area photo into a footprint.
#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    /// No candidate scale produced a correlation above the confidence floor.
    /// Callers are expected to fall back to the full city footprint.
    #[error("no confident match for the area image at any candidate scale")]
    NoMatchFound,

    #[error("malformed geometry: {0}")]
    MalformedGeometry(String),

    #[error("unreadable image {what}: {source}")]
    UnreadableImage {
        what: String,
        #[source]
        source: image::ImageError,
    },

    /// The user-supplied area photo could not be decoded.
    #[error("area photo is not a readable image: {0}")]
    InvalidPhoto(#[source] image::ImageError),

    #[error("unknown city '{0}'")]
    UnknownCity(String),

    #[error("projection failed: {0}")]
    Projection(String),

    #[error("I/O error on '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LocateError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedGeometry(msg.into())
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// True when the caller should retry with the default, uncropped geometry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NoMatchFound)
    }
}
