/// Shared error type used across all SerialAgent crates.
///
/// Variants map onto the error taxonomy every component in this workspace
/// reports against: `NotFound`/`InvalidArgument`/`CapacityExceeded` are
/// returned directly by stores, `Persistence`/`QueueUnavailable` wrap a
/// collaborator failure with operation context, and `Timeout`/`Cancelled`
/// are surfaced from anything awaiting on a `CancellationToken` or a deadline.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("persistence failed: {0}")]
    Persistence(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a lower-level error with operation context, preserving it as
    /// the display text of a `Persistence` error. Used at collaborator
    /// boundaries ("failed to store reference", "failed to enqueue message").
    pub fn persistence(context: &str, source: impl std::fmt::Display) -> Self {
        Error::Persistence(format!("{context}: {source}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn persistence_wraps_context_and_source() {
        let err = Error::persistence("failed to store reference", "disk full");
        assert_eq!(
            err.to_string(),
            "persistence failed: failed to store reference: disk full"
        );
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
