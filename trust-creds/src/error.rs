use std::path::PathBuf;

/// Result type used by this crate.
pub type Result<T> = std::result::Result<T, CredentialsError>;

/// Errors returned by `trust-creds`.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CredentialsError {
    /// A credential file could not be read.
    #[error("failed reading {}: {source}", path.display())]
    ReadFile {
        /// File that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The file contains no PEM certificate.
    #[error("no certificates found in {}", path.display())]
    NoCertificates {
        /// File that was parsed.
        path: PathBuf,
    },

    /// The file contains no PEM private key.
    #[error("no private key found in {}", path.display())]
    NoPrivateKey {
        /// File that was parsed.
        path: PathBuf,
    },

    /// The file is not well-formed PEM.
    #[error("invalid PEM in {}: {reason}", path.display())]
    InvalidPem {
        /// File that was parsed.
        path: PathBuf,
        /// Parser diagnostic.
        reason: String,
    },

    /// The private key does not belong to the leaf certificate.
    #[error("certificate {} does not match private key {}", cert.display(), key.display())]
    KeyMismatch {
        /// Certificate chain file.
        cert: PathBuf,
        /// Private key file.
        key: PathBuf,
    },

    /// No CA certificate from the bundle could be appended to the trust pool.
    #[error("failed to append any CA certificate from {} to the trust pool", path.display())]
    NoTrustAnchors {
        /// CA bundle file.
        path: PathBuf,
    },

    /// The private key could not be turned into a signing key.
    #[error("failed building certified key: {0}")]
    CertifiedKey(String),

    /// The file watcher failed or reported an error event.
    #[error("file watch error: {0}")]
    Watch(String),

    /// No Tokio runtime is available to run the watch loop.
    #[error("no tokio runtime available: {0}")]
    Runtime(String),

    /// The watcher was dropped and no further updates will be delivered.
    #[error("certificate watcher closed")]
    Closed,

    /// Failed to build a rustls certificate verifier.
    #[error("rustls verifier builder error: {0}")]
    VerifierBuilder(String),

    /// A rustls error occurred.
    #[error("rustls error: {0}")]
    Rustls(#[from] rustls::Error),
}

impl From<notify::Error> for CredentialsError {
    fn from(err: notify::Error) -> Self {
        CredentialsError::Watch(err.to_string())
    }
}
