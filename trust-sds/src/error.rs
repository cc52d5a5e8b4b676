//! Error types for the SDS server and the secret store contract.

use std::path::PathBuf;
use thiserror::Error;

/// Errors produced while starting or stopping an [`SdsServer`](crate::SdsServer).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SdsError {
    /// The Unix socket could not be prepared or bound.
    #[error("failed to bind SDS socket {}: {source}", path.display())]
    Bind {
        /// Socket path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Other I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The gRPC transport failed while serving.
    #[error("gRPC transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// No Tokio runtime is available to run the server.
    #[error("no tokio runtime: {0}")]
    Runtime(String),

    /// The background server task ended abnormally.
    #[error("server task failed: {0}")]
    Task(String),
}

/// Errors decoding the resources of a discovery response.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EnvelopeError {
    /// A resource is not an SDS secret.
    #[error("unexpected resource type {0}")]
    UnexpectedType(String),

    /// A secret resource failed to decode.
    #[error("failed to decode secret: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Errors a [`SecretStore`](crate::SecretStore) may return.
///
/// Each variant maps onto the gRPC status returned to the proxy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SecretStoreError {
    /// The credential token was rejected. Maps to `UNAUTHENTICATED`.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    /// No secret exists for the requested identity. Maps to `NOT_FOUND`.
    #[error("secret not found: {0}")]
    NotFound(String),

    /// The store failed for any other reason. Maps to `INTERNAL`.
    #[error("secret store failure: {0}")]
    Internal(String),
}

impl From<SecretStoreError> for tonic::Status {
    fn from(e: SecretStoreError) -> Self {
        match e {
            SecretStoreError::Unauthenticated(msg) => tonic::Status::unauthenticated(msg),
            SecretStoreError::NotFound(msg) => tonic::Status::not_found(msg),
            SecretStoreError::Internal(msg) => tonic::Status::internal(msg),
        }
    }
}
