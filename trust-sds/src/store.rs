use crate::error::SecretStoreError;
use crate::secret::SecretItem;

/// Source of secret material for the SDS server.
///
/// Implementations decide how secrets are minted and cached, and are
/// responsible for validating `token`.
#[tonic::async_trait]
pub trait SecretStore: Send + Sync + 'static {
    /// Returns the secret for `identity` on behalf of the proxy `node_id`.
    ///
    /// ## Errors
    ///
    /// * [`SecretStoreError::Unauthenticated`] if `token` is not accepted,
    /// * [`SecretStoreError::NotFound`] if no secret exists for `identity`,
    /// * [`SecretStoreError::Internal`] for any other failure.
    async fn get_secret(
        &self,
        node_id: &str,
        identity: &str,
        token: &str,
    ) -> Result<SecretItem, SecretStoreError>;
}
