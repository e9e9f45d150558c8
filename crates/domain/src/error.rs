/// Shared error type used across all Lumilio crates.
///
/// Variants map to the failure classes the runtime distinguishes:
/// invalid input is surfaced and never retried, transient dependency
/// failures are retried with backoff, and fatal conditions terminate
/// the run they occur in.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("model {model}: {message}")]
    Model { model: String, message: String },

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("queue: {0}")]
    Queue(String),

    #[error("watch: {0}")]
    Watch(String),

    #[error("checkpoint: {0}")]
    Checkpoint(String),

    #[error("iteration limit reached ({0})")]
    IterationLimit(u32),

    #[error("cancelled")]
    Cancelled,

    #[error("config: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a bounded retry with backoff is worth attempting.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Http(_)
                | Error::Timeout(_)
                | Error::Queue(_)
                | Error::Watch(_)
                | Error::Model { .. }
        )
    }

    /// Short machine-readable kind, used in terminal `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::InvalidInput(_) => "invalid_input",
            Error::NotFound(_) => "not_found",
            Error::Model { .. } => "model",
            Error::Http(_) => "http",
            Error::Timeout(_) => "timeout",
            Error::Queue(_) => "queue",
            Error::Watch(_) => "watch",
            Error::Checkpoint(_) => "checkpoint",
            Error::IterationLimit(_) => "iteration_limit",
            Error::Cancelled => "cancelled",
            Error::Config(_) => "config",
            Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(Error::Timeout("model call".into()).is_transient());
        assert!(Error::Queue("insert failed".into()).is_transient());
        assert!(Error::Watch("socket closed".into()).is_transient());
        assert!(!Error::InvalidInput("bad args".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
        assert!(!Error::IterationLimit(20).is_transient());
    }

    #[test]
    fn kind_is_stable() {
        assert_eq!(Error::Cancelled.kind(), "cancelled");
        assert_eq!(Error::IterationLimit(3).kind(), "iteration_limit");
        assert_eq!(
            Error::Model {
                model: "gpt-4o".into(),
                message: "boom".into()
            }
            .kind(),
            "model"
        );
    }
}
