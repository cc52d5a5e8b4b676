//! Stateless loading of PEM credentials into rustls material.
//!
//! Every function here fails closed: a file that is missing, malformed, or whose
//! key does not match its certificate yields an error and never a partially
//! constructed value.

use crate::crypto;
use crate::error::{CredentialsError, Result};
use log::debug;
use rustls::pki_types::pem::{self, PemObject};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, RootCertStore};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// A certificate chain and its matching private key, ready for a TLS handshake.
///
/// A `Keypair` is immutable; rotation replaces the whole value. The PEM it was
/// parsed from is kept alongside, so consumers can hand out exactly the pair that
/// was validated.
#[derive(Clone)]
pub struct Keypair {
    certified_key: Arc<CertifiedKey>,
    cert_pem: Arc<[u8]>,
    key_pem: Arc<[u8]>,
}

impl Keypair {
    /// DER certificates, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// DER leaf certificate.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.certified_key.cert.first()
    }

    /// The rustls representation handed to TLS handshakes.
    pub fn certified_key(&self) -> Arc<CertifiedKey> {
        Arc::clone(&self.certified_key)
    }

    /// Content of the certificate file this keypair was loaded from.
    pub fn cert_chain_pem(&self) -> &[u8] {
        &self.cert_pem
    }

    /// Content of the key file this keypair was loaded from.
    pub fn private_key_pem(&self) -> &[u8] {
        &self.key_pem
    }
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("cert_chain_len", &self.certified_key.cert.len())
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// The set of CA certificates used to verify peers.
///
/// Loaded once at startup and never mutated.
#[derive(Clone, Debug)]
pub struct TrustPool {
    roots: Arc<RootCertStore>,
}

impl TrustPool {
    /// Root store for rustls verifiers.
    pub fn roots(&self) -> Arc<RootCertStore> {
        Arc::clone(&self.roots)
    }

    /// Number of trust anchors in the pool.
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Always `false` for a pool returned by [`load_trust_pool`].
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }
}

/// Loads a certificate chain and private key from two PEM files as a matched pair.
///
/// ## Errors
///
/// Returns an error if either file cannot be read or parsed, if the certificate
/// file holds no certificate, the key file holds no private key, or the key does
/// not belong to the leaf certificate.
pub fn load_keypair(cert_file: &Path, key_file: &Path) -> Result<Keypair> {
    let cert_pem = read(cert_file)?;
    let key_pem = read(key_file)?;

    let cert_chain = parse_cert_chain(&cert_pem, cert_file)?;
    let private_key = parse_private_key(&key_pem, key_file)?;

    let certified_key = build_certified_key(cert_chain, private_key, cert_file, key_file)?;
    Ok(Keypair {
        certified_key,
        cert_pem: cert_pem.into(),
        key_pem: key_pem.into(),
    })
}

/// Loads a PEM CA bundle into a trust pool.
///
/// ## Errors
///
/// Returns an error if the file cannot be read, is not valid PEM, or if none of its
/// certificates can be appended to the pool.
pub fn load_trust_pool(ca_file: &Path) -> Result<TrustPool> {
    let ca_pem = read(ca_file)?;

    let certs = match parse_cert_chain(&ca_pem, ca_file) {
        Ok(certs) => certs,
        Err(CredentialsError::NoCertificates { path }) => {
            return Err(CredentialsError::NoTrustAnchors { path })
        }
        Err(e) => return Err(e),
    };

    let mut store = RootCertStore::empty();
    let (added, ignored) = store.add_parsable_certificates(certs);
    debug!(
        "loaded CA bundle {}: added={added}, ignored={ignored}",
        ca_file.display()
    );

    if store.is_empty() {
        return Err(CredentialsError::NoTrustAnchors {
            path: ca_file.to_path_buf(),
        });
    }

    Ok(TrustPool {
        roots: Arc::new(store),
    })
}

fn read(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| CredentialsError::ReadFile {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_cert_chain(pem: &[u8], origin: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<std::result::Result<Vec<_>, pem::Error>>()
        .map_err(|e| CredentialsError::InvalidPem {
            path: origin.to_path_buf(),
            reason: format!("{e:?}"),
        })?;

    if certs.is_empty() {
        return Err(CredentialsError::NoCertificates {
            path: origin.to_path_buf(),
        });
    }
    Ok(certs)
}

fn parse_private_key(pem: &[u8], origin: &Path) -> Result<PrivateKeyDer<'static>> {
    PrivateKeyDer::from_pem_slice(pem).map_err(|e| match e {
        pem::Error::NoItemsFound => CredentialsError::NoPrivateKey {
            path: origin.to_path_buf(),
        },
        other => CredentialsError::InvalidPem {
            path: origin.to_path_buf(),
            reason: format!("{other:?}"),
        },
    })
}

fn build_certified_key(
    cert_chain: Vec<CertificateDer<'static>>,
    private_key: PrivateKeyDer<'static>,
    cert_file: &Path,
    key_file: &Path,
) -> Result<Arc<CertifiedKey>> {
    let provider = crypto::provider();
    let signing_key = provider
        .key_provider
        .load_private_key(private_key)
        .map_err(|e| CredentialsError::CertifiedKey(format!("{e:?}")))?;

    let certified_key = CertifiedKey::new(cert_chain, signing_key);

    // Providers that cannot derive a public key report `Unknown`; only a proven
    // mismatch is rejected.
    match certified_key.keys_match() {
        Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
            Ok(Arc::new(certified_key))
        }
        Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
            Err(CredentialsError::KeyMismatch {
                cert: cert_file.to_path_buf(),
                key: key_file.to_path_buf(),
            })
        }
        Err(e) => Err(CredentialsError::Rustls(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestPki;

    #[test]
    fn load_keypair_ok() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let issued = pki.issue("localhost");
        let paths = pki.write(dir.path(), &issued);

        let keypair = load_keypair(paths.certificate_file(), paths.key_file()).unwrap();

        assert_eq!(keypair.cert_chain().len(), 1);
        assert_eq!(keypair.leaf().unwrap().as_ref(), issued.cert_der.as_slice());
        assert_eq!(keypair.cert_chain_pem(), issued.cert_pem.as_bytes());
        assert_eq!(keypair.private_key_pem(), issued.key_pem.as_bytes());
        assert!(!format!("{keypair:?}").contains("PRIVATE KEY"));
    }

    #[test]
    fn load_keypair_missing_key_file() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = pki.write(dir.path(), &pki.issue("localhost"));
        std::fs::remove_file(paths.key_file()).unwrap();

        let err = load_keypair(paths.certificate_file(), paths.key_file()).unwrap_err();
        assert!(matches!(err, CredentialsError::ReadFile { .. }));
    }

    #[test]
    fn load_keypair_rejects_mismatched_key() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = pki.write(dir.path(), &pki.issue("localhost"));
        let other = pki.issue("other");
        std::fs::write(paths.key_file(), &other.key_pem).unwrap();

        let err = load_keypair(paths.certificate_file(), paths.key_file()).unwrap_err();
        assert!(matches!(err, CredentialsError::KeyMismatch { .. }));
    }

    #[test]
    fn load_keypair_rejects_cert_file_without_certificates() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let issued = pki.issue("localhost");
        let paths = pki.write(dir.path(), &issued);
        std::fs::write(paths.certificate_file(), "not a certificate\n").unwrap();

        let err = load_keypair(paths.certificate_file(), paths.key_file()).unwrap_err();
        assert!(matches!(err, CredentialsError::NoCertificates { .. }));
    }

    #[test]
    fn load_keypair_rejects_key_file_without_key() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let issued = pki.issue("localhost");
        let paths = pki.write(dir.path(), &issued);
        std::fs::write(paths.key_file(), &issued.cert_pem).unwrap();

        let err = load_keypair(paths.certificate_file(), paths.key_file()).unwrap_err();
        assert!(matches!(err, CredentialsError::NoPrivateKey { .. }));
    }

    #[test]
    fn load_trust_pool_ok() {
        let pki = TestPki::new();
        let dir = tempfile::tempdir().unwrap();
        let paths = pki.write(dir.path(), &pki.issue("localhost"));

        let pool = load_trust_pool(paths.ca_certificate_file()).unwrap();
        assert_eq!(pool.len(), 1);
        assert!(!pool.is_empty());
    }

    #[test]
    fn load_trust_pool_without_certificates_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("root-cert.pem");
        std::fs::write(&ca, "").unwrap();

        let err = load_trust_pool(&ca).unwrap_err();
        assert!(matches!(err, CredentialsError::NoTrustAnchors { .. }));
    }

    #[test]
    fn load_trust_pool_with_garbage_certificate_fails() {
        let dir = tempfile::tempdir().unwrap();
        let ca = dir.path().join("root-cert.pem");
        std::fs::write(
            &ca,
            "-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n",
        )
        .unwrap();

        let err = load_trust_pool(&ca).unwrap_err();
        assert!(matches!(err, CredentialsError::NoTrustAnchors { .. }));
    }

    #[test]
    fn load_trust_pool_missing_file() {
        let err = load_trust_pool(Path::new("/nonexistent/root-cert.pem")).unwrap_err();
        assert!(matches!(err, CredentialsError::ReadFile { .. }));
    }
}
