use std::error::Error as StdError;
use std::time::Duration;

use thiserror::Error;

use crate::task::TaskStatus;

/// Transom's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Transom's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs. Variants map to the pipeline's failure
/// taxonomy so stages and the retry envelope can classify without string matching.
#[derive(Debug, Error)]
pub enum Error {
    /// Empty or malformed input: URLs, out-of-range parameters, bad configuration.
    #[error("invalid input: {0}")]
    Validation(String),

    /// An external media tool (ffmpeg, ffprobe, yt-dlp) exited nonzero or timed out.
    #[error("{tool} failed: {message}")]
    Tool { tool: &'static str, message: String },

    /// Object-store operation failed (after internal retries, where applicable).
    #[error("object store error: {0}")]
    Storage(String),

    /// Transcription endpoint transport failure or non-2xx response other than 429.
    /// Retryable inside the transcriber's backoff envelope.
    #[error("transcription api error: {0}")]
    Api(String),

    /// The transcription endpoint answered 429. Retryable, honoring the
    /// server-provided backoff.
    #[error("rate limited, retry after {}s", retry_after.as_secs())]
    RateLimited { retry_after: Duration },

    /// The transcription endpoint answered 2xx with a body we could not use.
    /// Not retryable: the server is healthy, the payload is the problem.
    #[error("unexpected transcription response: {0}")]
    BadResponse(String),

    /// One or more chunks failed transcription. The per-chunk outcomes are
    /// preserved on the task.
    #[error("{failed} of {total} chunks failed transcription")]
    ChunksFailed { failed: usize, total: usize },

    /// A stage requested a move the state machine forbids. Fatal for the task.
    #[error("illegal status transition from {from} to {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Whether the transcriber's backoff envelope should retry this error.
    ///
    /// Only rate-limit signals and API transport/status failures qualify;
    /// everything else falls through to the stage immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Api(_) | Self::RateLimited { .. })
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(Error::Api("503 from upstream".into()).is_retryable());
        assert!(
            Error::RateLimited {
                retry_after: Duration::from_secs(5)
            }
            .is_retryable()
        );

        assert!(!Error::Validation("empty url".into()).is_retryable());
        assert!(!Error::BadResponse("not json".into()).is_retryable());
        assert!(
            !Error::Tool {
                tool: "ffmpeg",
                message: "exit 1".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn display_includes_context() {
        let err = Error::InvalidTransition {
            from: TaskStatus::Pending,
            to: TaskStatus::Merging,
        };
        assert_eq!(
            err.to_string(),
            "illegal status transition from pending to merging"
        );

        let err = Error::ChunksFailed {
            failed: 2,
            total: 5,
        };
        assert_eq!(err.to_string(), "2 of 5 chunks failed transcription");
    }
}
