//! Translation between [`SecretItem`]s and discovery envelopes.

use crate::error::EnvelopeError;
use crate::pb::envoy::config::core::v3::{data_source, DataSource};
use crate::pb::envoy::extensions::transport_sockets::tls::v3::{secret, Secret, TlsCertificate};
use crate::pb::envoy::service::discovery::v3::DiscoveryResponse;
use crate::secret::SecretItem;
use bytes::Bytes;
use prost::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use time::format_description::well_known::Rfc3339;

/// Type URL of SDS secret resources.
pub const SECRET_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

static NONCE: AtomicU64 = AtomicU64::new(1);

/// Builds the discovery response carrying `item` as its single resource.
///
/// Certificate and key bytes are passed through untouched.
pub fn secret_response(item: &SecretItem) -> DiscoveryResponse {
    let secret = Secret {
        name: item.identity.clone(),
        r#type: Some(secret::Type::TlsCertificate(TlsCertificate {
            certificate_chain: Some(inline_bytes(item.certificate_chain.clone())),
            private_key: Some(inline_bytes(item.private_key.clone())),
        })),
    };

    DiscoveryResponse {
        version_info: version_info(item),
        resources: vec![prost_types::Any {
            type_url: SECRET_TYPE_URL.to_string(),
            value: secret.encode_to_vec(),
        }],
        canary: false,
        type_url: SECRET_TYPE_URL.to_string(),
        nonce: next_nonce(),
    }
}

/// Decodes the secret resources of `response`.
///
/// ## Errors
///
/// Returns an error if a resource is not an SDS secret or does not decode.
pub fn decode_secrets(response: &DiscoveryResponse) -> Result<Vec<Secret>, EnvelopeError> {
    response
        .resources
        .iter()
        .map(|any| {
            if any.type_url != SECRET_TYPE_URL {
                return Err(EnvelopeError::UnexpectedType(any.type_url.clone()));
            }
            Ok(Secret::decode(any.value.as_slice())?)
        })
        .collect()
}

fn inline_bytes(bytes: Bytes) -> DataSource {
    DataSource {
        specifier: Some(data_source::Specifier::InlineBytes(bytes)),
    }
}

fn version_info(item: &SecretItem) -> String {
    if !item.version.is_empty() {
        return item.version.clone();
    }
    item.created_at
        .format(&Rfc3339)
        .unwrap_or_else(|_| item.created_at.unix_timestamp().to_string())
}

fn next_nonce() -> String {
    format!("{:016x}", NONCE.fetch_add(1, Ordering::Relaxed))
}
