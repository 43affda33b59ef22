use thiserror::Error;

/// Why a page could not be turned into an image.
///
/// Cloneable so that every waiter on a shared in-flight load observes the
/// same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("page has no key yet")]
    MissingKey,

    #[error("network error: {0}")]
    Network(String),

    #[error("could not extract an image URL: {0}")]
    Parse(String),

    #[error("image load timed out")]
    Timeout,

    #[error("image decode error: {0}")]
    Decode(String),

    /// A load task died without producing a result.
    #[error("internal error: {0}")]
    Internal(String),

    /// Superseded by a newer navigation. Never shown to the user.
    #[error("superseded by a newer navigation")]
    Cancelled,
}

impl ErrorKind {
    /// Short label for the status line.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::MissingKey => "missing key",
            ErrorKind::Network(_) => "network",
            ErrorKind::Parse(_) => "parse",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Decode(_) => "decode",
            ErrorKind::Internal(_) => "internal",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl From<reqwest::Error> for ErrorKind {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            ErrorKind::Timeout
        } else {
            ErrorKind::Network(e.to_string())
        }
    }
}

impl From<image::ImageError> for ErrorKind {
    fn from(e: image::ImageError) -> Self {
        ErrorKind::Decode(e.to_string())
    }
}

/// A navigation intent that was not accepted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    #[error("page {page} is outside 1..={total}")]
    OutOfRange { page: usize, total: usize },

    #[error("reader session is closed")]
    SessionClosed,
}
