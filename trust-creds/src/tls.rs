//! `rustls` configurations that present the watcher's current keypair.

use crate::error::{CredentialsError, Result};
use crate::watcher::CertificateWatcher;
use rustls::client::{ResolvesClientCert, Resumption};
use rustls::server::{ClientHello, NoServerSessionStorage, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig, SignatureScheme};
use std::sync::Arc;

/// Resolves the certificate to present from a [`CertificateWatcher`] on every
/// handshake.
///
/// Usable on both sides of a connection.
#[derive(Clone, Debug)]
pub struct KeypairResolver {
    watcher: CertificateWatcher,
}

impl KeypairResolver {
    /// Creates a resolver over `watcher`.
    pub fn new(watcher: CertificateWatcher) -> Self {
        Self { watcher }
    }
}

impl ResolvesServerCert for KeypairResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.watcher.get().certified_key())
    }
}

impl ResolvesClientCert for KeypairResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.watcher.get().certified_key())
    }

    fn has_certs(&self) -> bool {
        true
    }
}

/// Builds a mutual-TLS [`rustls::ServerConfig`] backed by `watcher`.
///
/// The resulting configuration:
///
/// * presents the watcher's current keypair, re-resolved per handshake
/// * requires client certificates chaining to the watcher's CA bundle
/// * never resumes sessions, so every handshake is a full one and observes a
///   rotated keypair
///
/// ## Errors
///
/// Returns an error if the client verifier cannot be built from the CA bundle
/// or the crypto provider supports no safe protocol version.
pub fn server_config(watcher: &CertificateWatcher) -> Result<ServerConfig> {
    let provider = crate::crypto::provider();

    let verifier =
        WebPkiClientVerifier::builder_with_provider(watcher.trust_pool().roots(), provider.clone())
            .build()
            .map_err(|e| CredentialsError::VerifierBuilder(e.to_string()))?;

    let mut cfg = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_client_cert_verifier(verifier)
        .with_cert_resolver(Arc::new(KeypairResolver::new(watcher.clone())));

    // A resumed session skips certificate resolution.
    cfg.session_storage = Arc::new(NoServerSessionStorage {});
    cfg.send_tls13_tickets = 0;

    Ok(cfg)
}

/// Builds a [`rustls::ClientConfig`] backed by `watcher`.
///
/// Servers are verified against the watcher's CA bundle, and the current keypair
/// is offered when a server requests a client certificate. Session resumption is
/// disabled so a rotated keypair is offered on the next connection.
///
/// ## Errors
///
/// Returns an error if the crypto provider supports no safe protocol version.
pub fn client_config(watcher: &CertificateWatcher) -> Result<ClientConfig> {
    let mut cfg = ClientConfig::builder_with_provider(crate::crypto::provider())
        .with_safe_default_protocol_versions()?
        .with_root_certificates(watcher.trust_pool().roots())
        .with_client_cert_resolver(Arc::new(KeypairResolver::new(watcher.clone())));
    cfg.resumption = Resumption::disabled();

    Ok(cfg)
}
