//! Locations of the credential files watched by a [`CertificateWatcher`].
//!
//! [`CertificateWatcher`]: crate::CertificateWatcher

use std::path::{Path, PathBuf};

/// Default directory holding the credential files.
pub const DEFAULT_CERT_DIR: &str = "/etc/certs";

/// Default name of the certificate chain file.
pub const DEFAULT_CERTIFICATE_FILE: &str = "cert-chain.pem";

/// Default name of the private key file.
pub const DEFAULT_KEY_FILE: &str = "key.pem";

/// Default name of the CA certificate bundle file.
pub const DEFAULT_CA_CERTIFICATE_FILE: &str = "root-cert.pem";

/// Paths of the certificate chain, private key and CA bundle files.
///
/// The certificate and key files are watched for changes; the CA bundle is read
/// once at startup.
///
/// # Examples
///
/// ```
/// use trust_creds::CredentialPaths;
///
/// let paths = CredentialPaths::from_dir("/var/lib/certs")
///     .with_ca_certificate_file("/etc/ssl/mesh-ca.pem");
///
/// assert_eq!(paths.key_file().to_str(), Some("/var/lib/certs/key.pem"));
/// assert_eq!(paths.ca_certificate_file().to_str(), Some("/etc/ssl/mesh-ca.pem"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialPaths {
    certificate_file: PathBuf,
    key_file: PathBuf,
    ca_certificate_file: PathBuf,
}

impl CredentialPaths {
    /// Creates paths from three explicit file locations.
    pub fn new(
        certificate_file: impl Into<PathBuf>,
        key_file: impl Into<PathBuf>,
        ca_certificate_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            certificate_file: certificate_file.into(),
            key_file: key_file.into(),
            ca_certificate_file: ca_certificate_file.into(),
        }
    }

    /// Resolves the default file names (`cert-chain.pem`, `key.pem`,
    /// `root-cert.pem`) inside `dir`.
    pub fn from_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self::new(
            dir.join(DEFAULT_CERTIFICATE_FILE),
            dir.join(DEFAULT_KEY_FILE),
            dir.join(DEFAULT_CA_CERTIFICATE_FILE),
        )
    }

    /// Overrides the certificate chain file.
    #[must_use]
    pub fn with_certificate_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.certificate_file = path.into();
        self
    }

    /// Overrides the private key file.
    #[must_use]
    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = path.into();
        self
    }

    /// Overrides the CA bundle file.
    #[must_use]
    pub fn with_ca_certificate_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_certificate_file = path.into();
        self
    }

    /// Certificate chain file.
    pub fn certificate_file(&self) -> &Path {
        &self.certificate_file
    }

    /// Private key file.
    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    /// CA bundle file.
    pub fn ca_certificate_file(&self) -> &Path {
        &self.ca_certificate_file
    }
}

impl Default for CredentialPaths {
    fn default() -> Self {
        Self::from_dir(DEFAULT_CERT_DIR)
    }
}
