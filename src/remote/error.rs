use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// 401/403. Never retried; polling halts until the credential is replaced.
    #[error("authentication rejected (HTTP {status})")]
    Authentication { status: u16 },
    #[error("remote request failed: {0}")]
    Transient(String),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("request rejected (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },
}

impl RemoteError {
    pub fn is_auth(&self) -> bool {
        matches!(self, RemoteError::Authentication { .. })
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Malformed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Authentication,
    Retryable,
    Rejected,
}

pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        401 | 403 => StatusClass::Authentication,
        429 | 500..=599 => StatusClass::Retryable,
        _ => StatusClass::Rejected,
    }
}
