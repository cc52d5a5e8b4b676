//! SDS server configuration.

use crate::registry::DEFAULT_PUSH_QUEUE_CAPACITY;
use std::path::{Path, PathBuf};

/// Environment variable holding the SDS socket path.
pub const SDS_UDS_PATH_ENV: &str = "SDS_UDS_PATH";

/// Socket path used when none is configured.
pub const DEFAULT_UDS_PATH: &str = "/var/run/sds/uds_path";

/// Options for [`SdsServer::start`](crate::SdsServer::start).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdsOptions {
    /// Unix domain socket the server listens on.
    pub uds_path: PathBuf,

    /// Pushes that may be queued per session before it is evicted.
    pub push_queue_capacity: usize,
}

impl Default for SdsOptions {
    fn default() -> Self {
        Self::new(DEFAULT_UDS_PATH)
    }
}

impl SdsOptions {
    /// Creates options listening on `uds_path`.
    pub fn new(uds_path: impl AsRef<Path>) -> Self {
        Self {
            uds_path: uds_path.as_ref().to_path_buf(),
            push_queue_capacity: DEFAULT_PUSH_QUEUE_CAPACITY,
        }
    }

    /// Reads the socket path from `SDS_UDS_PATH`, falling back to
    /// [`DEFAULT_UDS_PATH`] when it is unset or empty.
    pub fn from_env() -> Self {
        match std::env::var_os(SDS_UDS_PATH_ENV) {
            Some(path) if !path.is_empty() => Self::new(PathBuf::from(path)),
            _ => Self::default(),
        }
    }

    /// Sets the per-session push queue capacity.
    #[must_use]
    pub fn with_push_queue_capacity(mut self, capacity: usize) -> Self {
        self.push_queue_capacity = capacity;
        self
    }
}
