//! Error types shared across the orchestrator, backends, channel and store.

use thiserror::Error;

use crate::job::JobId;

/// Result type for lando operations.
pub type Result<T> = std::result::Result<T, LandoError>;

/// Errors raised by an execution backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The backend rejected the request for lack of capacity (quota, no valid
    /// host, no flavor large enough). Callers may retry with other parameters.
    #[error("insufficient capacity for {resource}: {message}")]
    Capacity { resource: String, message: String },

    /// A resource with this name already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// The named resource does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    /// The declarative spec cannot be expressed on this backend.
    #[error("invalid resource spec: {0}")]
    InvalidSpec(String),

    /// Any other failed backend call.
    #[error("backend request failed: {0}")]
    Request(String),

    /// The backend event stream terminated.
    #[error("backend event stream closed")]
    StreamClosed,
}

impl BackendError {
    pub fn is_capacity(&self) -> bool {
        matches!(self, BackendError::Capacity { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, BackendError::AlreadyExists { .. })
    }
}

/// Errors raised by the job record store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),

    #[error("job record store unavailable: {0}")]
    Unavailable(String),
}

/// Errors raised by a message channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel closed")]
    Closed,

    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unknown delivery tag {0}")]
    UnknownDelivery(u64),
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top level error for lando operations.
#[derive(Debug, Error)]
pub enum LandoError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The watcher could not re-establish its event stream.
    #[error("event stream reconnect failed after {attempts} attempts: {source}")]
    WatchExhausted {
        attempts: u32,
        #[source]
        source: BackendError,
    },
}

impl LandoError {
    /// Operational errors terminate the consuming process; everything else is
    /// absorbed into the job record.
    pub fn is_operational(&self) -> bool {
        matches!(
            self,
            LandoError::Store(_)
                | LandoError::Channel(_)
                | LandoError::Config(_)
                | LandoError::WatchExhausted { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_errors_are_distinguishable() {
        let err = BackendError::Capacity {
            resource: "run-workflow-1-jpb".into(),
            message: "no valid host".into(),
        };
        assert!(err.is_capacity());
        assert!(!BackendError::Request("boom".into()).is_capacity());
    }

    #[test]
    fn store_errors_are_operational() {
        let err: LandoError = StoreError::Unavailable("down".into()).into();
        assert!(err.is_operational());

        let err: LandoError = BackendError::Request("boom".into()).into();
        assert!(!err.is_operational());
    }
}
