#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

//! # trust-creds
//!
//! `trust-creds` keeps the transport credentials of a long-running process fresh
//! without restarting it.
//!
//! A [`CertificateWatcher`] loads a PEM certificate chain, its private key and a CA
//! trust bundle from the filesystem, serves the current keypair to any number of
//! concurrent readers, and swaps in a new keypair when the certificate or key file
//! changes on disk. A broken rewrite never replaces the keypair being served: the
//! last known-good pair stays in effect until a valid pair is loaded.
//!
//! [`server_config`] and [`client_config`] build [`rustls`] configurations backed
//! by a watcher, so **new TLS handshakes automatically present the rotated
//! keypair** while in-flight connections are left untouched.
//!
//! ```no_run
//! use tokio_util::sync::CancellationToken;
//! use trust_creds::{server_config, CertificateWatcher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let stop = CancellationToken::new();
//! let watcher = CertificateWatcher::watch_folder(stop.clone(), "/etc/certs")?;
//!
//! let tls = server_config(&watcher)?;
//! # let _ = tls;
//!
//! // Later: stop watching and release the file watches.
//! stop.cancel();
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature flags
//!
//! Exactly **one** `rustls` crypto provider must be enabled:
//!
//! * `ring` (default)
//! * `aws-lc-rs`

#[cfg(all(feature = "ring", feature = "aws-lc-rs"))]
compile_error!("Enable only one crypto provider feature: `ring` or `aws-lc-rs`.");

#[cfg(not(any(feature = "ring", feature = "aws-lc-rs")))]
compile_error!("Enable one crypto provider feature: `ring` (default) or `aws-lc-rs`.");

mod crypto;
mod error;

pub mod filewatcher;
pub mod loader;
pub mod paths;
pub mod tls;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{CredentialsError, Result};
pub use filewatcher::{FileEvent, FileEventKind, FileWatcher, NotifyFileWatcher, PathWatch};
pub use loader::{load_keypair, load_trust_pool, Keypair, TrustPool};
pub use paths::CredentialPaths;
pub use tls::{client_config, server_config, KeypairResolver};
pub use watcher::{CertificateWatcher, KeypairUpdates};
