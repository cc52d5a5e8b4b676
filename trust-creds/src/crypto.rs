use rustls::crypto::CryptoProvider;
use std::sync::{Arc, OnceLock};

/// Installs this crate's crypto provider as the process default unless the
/// application already installed one.
pub(crate) fn ensure_crypto_provider_installed() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let _ = crypto_provider().install_default();
    });
}

/// Returns the process-default provider, installing ours first if needed.
pub(crate) fn provider() -> Arc<CryptoProvider> {
    ensure_crypto_provider_installed();
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(crypto_provider()))
}

#[cfg(feature = "ring")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

#[cfg(feature = "aws-lc-rs")]
fn crypto_provider() -> CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}
