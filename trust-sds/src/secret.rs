use bytes::Bytes;
use std::fmt;
use time::OffsetDateTime;

/// Secret material for one workload identity.
///
/// An item with an empty certificate chain *and* an empty private key is the
/// revocation sentinel: pushing it closes the proxy's stream.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretItem {
    /// SPIFFE-style identity, used as the secret's resource name.
    pub identity: String,

    /// Certificate chain, passed to the proxy verbatim.
    pub certificate_chain: Bytes,

    /// Private key, passed to the proxy verbatim.
    pub private_key: Bytes,

    /// Version reported to the proxy. When empty, `created_at` is used instead.
    pub version: String,

    /// When this material was produced.
    pub created_at: OffsetDateTime,
}

impl SecretItem {
    /// Creates an item stamped with the current time and no explicit version.
    pub fn new(
        identity: impl Into<String>,
        certificate_chain: impl Into<Bytes>,
        private_key: impl Into<Bytes>,
    ) -> Self {
        Self {
            identity: identity.into(),
            certificate_chain: certificate_chain.into(),
            private_key: private_key.into(),
            version: String::new(),
            created_at: OffsetDateTime::now_utc(),
        }
    }

    /// Sets an explicit version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Returns `true` for the revocation sentinel.
    pub fn is_empty(&self) -> bool {
        self.certificate_chain.is_empty() && self.private_key.is_empty()
    }
}

impl fmt::Debug for SecretItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretItem")
            .field("identity", &self.identity)
            .field("certificate_chain_len", &self.certificate_chain.len())
            .field("private_key", &"<redacted>")
            .field("version", &self.version)
            .field("created_at", &self.created_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_only_when_chain_and_key_are_empty() {
        assert!(SecretItem::new("spiffe://a/b", Bytes::new(), Bytes::new()).is_empty());
        assert!(!SecretItem::new("spiffe://a/b", vec![1u8], Bytes::new()).is_empty());
        assert!(!SecretItem::new("spiffe://a/b", Bytes::new(), vec![2u8]).is_empty());
    }

    #[test]
    fn debug_redacts_private_key() {
        let item = SecretItem::new("spiffe://a/b", vec![1u8], b"very secret".to_vec());
        let out = format!("{item:?}");
        assert!(out.contains("<redacted>"));
        assert!(!out.contains("very secret"));
    }
}
