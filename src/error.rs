use thiserror::Error;

/// Failure reported by a getter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("request failed with status {status}: {message}")]
    Status {
        status:  u16,
        code:    Option<String>,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::NotFound(_) => Some(404),
            Self::Status { status, .. } => Some(*status),
            Self::Transport(_) => None,
        }
    }

    #[inline]
    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }
}

/// What a caller waiting on a view operation may get back.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ViewError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The request was superseded by a params/options change, a refresh, or a dispose.
    #[error("request aborted")]
    Aborted,

    #[error("view is disposed")]
    Disposed,
}

pub type Result<T, E = ViewError> = std::result::Result<T, E>;
