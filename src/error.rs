//! Closed error taxonomy for the Control Surface and the components behind it.

use thiserror::Error;

/// Stable, typed error returned by every Control Surface operation.
///
/// Variants map 1:1 onto the closed error-code set: `not_found`,
/// `invalid_state`, `conflict`, `bad_request`, `unauthorized`, `timeout`,
/// `unavailable`, `internal`.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),

    /// An Event Log record failed its checksum on read (§4.1). A dependency
    /// failure, not a caller mistake — wire code `unavailable`.
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
}

impl CoreError {
    /// The stable wire code for this error, from the closed §7 set.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::NotFound(_) => "not_found",
            CoreError::InvalidState(_) => "invalid_state",
            CoreError::Conflict(_) => "conflict",
            CoreError::BadRequest(_) => "bad_request",
            CoreError::Unauthorized(_) => "unauthorized",
            CoreError::Timeout(_) => "timeout",
            CoreError::Unavailable(_) => "unavailable",
            CoreError::Internal(_) => "internal",
            CoreError::CorruptRecord(_) => "unavailable",
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Unavailable(format!("io error: {e}"))
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("serialization error: {e}"))
    }
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Extension trait for internal `anyhow`-based plumbing that never crosses
/// the Control Surface boundary.
pub trait ResultExt<T> {
    fn context_op(self, operation: &str) -> anyhow::Result<T>;
}

impl<T, E> ResultExt<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context_op(self, operation: &str) -> anyhow::Result<T> {
        use anyhow::Context;
        self.context(format!("failed to {operation}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::NotFound("x".into()).code(), "not_found");
        assert_eq!(CoreError::InvalidState("x".into()).code(), "invalid_state");
        assert_eq!(CoreError::Conflict("x".into()).code(), "conflict");
        assert_eq!(CoreError::BadRequest("x".into()).code(), "bad_request");
        assert_eq!(CoreError::Unauthorized("x".into()).code(), "unauthorized");
        assert_eq!(CoreError::Timeout("x".into()).code(), "timeout");
        assert_eq!(CoreError::Unavailable("x".into()).code(), "unavailable");
        assert_eq!(CoreError::Internal("x".into()).code(), "internal");
        assert_eq!(CoreError::CorruptRecord("x".into()).code(), "unavailable");
    }
}
