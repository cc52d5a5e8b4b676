#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # trust-sds
//!
//! A Secret Discovery Service (SDS) server that hands X.509 identity material to
//! workload proxies over a local Unix socket, speaking the envoy v3
//! `SecretDiscoveryService` API.
//!
//! Secrets come from a caller-supplied [`SecretStore`]. Proxies may fetch a secret
//! once (`FetchSecrets`) or open a stream (`StreamSecrets`); a streaming proxy
//! keeps a session in the [`SessionRegistry`] so a rotated secret can be pushed to
//! it with [`SdsServer::notify_proxy`] without waiting for it to ask again.
//! Pushing `None` revokes: the proxy's stream ends.
//!
//! Certificate and key bytes are passed to the proxy exactly as the store
//! produced them.

mod secret;
mod server;
mod store;

pub mod envelope;
pub mod error;
pub mod options;
pub mod pb;
pub mod registry;
pub mod service;

pub use envelope::{decode_secrets, secret_response, SECRET_TYPE_URL};
pub use error::{EnvelopeError, SdsError, SecretStoreError};
pub use options::{SdsOptions, DEFAULT_UDS_PATH, SDS_UDS_PATH_ENV};
pub use registry::{NotifyOutcome, Registration, SessionRegistry, DEFAULT_PUSH_QUEUE_CAPACITY};
pub use secret::SecretItem;
pub use server::SdsServer;
pub use service::{SdsService, CREDENTIAL_TOKEN_HEADER};
pub use store::SecretStore;
