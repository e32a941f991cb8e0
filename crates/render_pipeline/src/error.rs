use std::path::PathBuf;
use std::process::ExitStatus;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to build CPU pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),

    #[error("CPU pool task panicked")]
    Panicked,

    #[error("CPU pool dropped the task before it completed")]
    Closed,
}

/// Why a render job ended in the `Failed` state.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("failed to start render command: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("render command exited with {0}")]
    Exit(ExitStatus),

    #[error("render output '{}' was not produced", .0.display())]
    MissingOutput(PathBuf),

    #[error("unreadable image '{}': {source}", path.display())]
    UnreadableImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("failed to write preview '{}': {source}", path.display())]
    PreviewWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl RenderError {
    /// The renderer itself misbehaved, as opposed to a local post-processing step.
    pub fn is_subprocess_failure(&self) -> bool {
        matches!(self, Self::Spawn(_) | Self::Exit(_) | Self::MissingOutput(_))
    }
}
