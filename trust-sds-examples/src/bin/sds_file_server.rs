//! Serves the keypair found in a certificate directory to proxies over SDS, and
//! pushes it to every connected proxy whenever the files rotate.
//!
//! Usage: `sds_file_server [CERT_DIR]` (default `/etc/certs`). The socket path is
//! taken from `SDS_UDS_PATH`; if `SDS_TOKEN` is set, proxies must present it.

use bytes::Bytes;
use log::info;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use trust_creds::paths::DEFAULT_CERT_DIR;
use trust_creds::{CertificateWatcher, KeypairUpdates};
use trust_sds::{
    SdsOptions, SdsServer, SecretItem, SecretStore, SecretStoreError, SessionRegistry,
};

/// Secret store handing out the watched keypair, as PEM, for any identity.
///
/// Only keypairs the watcher validated are served; a half-written rotation that
/// the watcher rejected never reaches a proxy.
struct WatchedSecretStore {
    watcher: CertificateWatcher,
    generation: KeypairUpdates,
    token: Option<String>,
    // Identity last requested by each node, used when pushing rotations.
    identities: Mutex<HashMap<String, String>>,
}

impl WatchedSecretStore {
    fn new(watcher: CertificateWatcher, token: Option<String>) -> Self {
        Self {
            generation: watcher.updated(),
            watcher,
            token,
            identities: Mutex::default(),
        }
    }

    fn item(&self, identity: &str) -> SecretItem {
        let generation = self.generation.last();
        let keypair = self.watcher.get();
        SecretItem::new(
            identity,
            Bytes::copy_from_slice(keypair.cert_chain_pem()),
            Bytes::copy_from_slice(keypair.private_key_pem()),
        )
        .with_version(generation.to_string())
    }

    fn identity_for(&self, node_id: &str) -> Option<String> {
        self.identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(node_id)
            .cloned()
    }

    /// Drops identities of nodes without an open stream.
    fn forget_disconnected(&self, registry: &SessionRegistry) {
        self.identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|node_id, _| registry.contains(node_id));
    }
}

#[tonic::async_trait]
impl SecretStore for WatchedSecretStore {
    async fn get_secret(
        &self,
        node_id: &str,
        identity: &str,
        token: &str,
    ) -> Result<SecretItem, SecretStoreError> {
        match &self.token {
            Some(expected) if expected != token => {
                return Err(SecretStoreError::Unauthenticated(
                    "credential token rejected".to_string(),
                ));
            }
            None if token.is_empty() => {
                return Err(SecretStoreError::Unauthenticated(
                    "empty credential token".to_string(),
                ));
            }
            _ => {}
        }

        self.identities
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node_id.to_string(), identity.to_string());

        Ok(self.item(identity))
    }
}

/// Pushes the current keypair to every streaming node.
fn push_current(store: &WatchedSecretStore, server: &SdsServer, generation: u64) {
    store.forget_disconnected(server.registry());

    for node_id in server.registry().node_ids() {
        let Some(identity) = store.identity_for(&node_id) else {
            continue;
        };
        let outcome = server.notify_proxy(&node_id, Some(store.item(&identity)));
        info!("pushed keypair generation {generation} to {node_id}: {outcome:?}");
    }
}

async fn push_rotations(
    mut updates: KeypairUpdates,
    store: Arc<WatchedSecretStore>,
    server: Arc<SdsServer>,
) {
    while let Ok(generation) = updates.changed().await {
        push_current(&store, &server, generation);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let cert_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CERT_DIR.to_string());

    let stop = CancellationToken::new();
    let watcher = CertificateWatcher::watch_folder(stop.clone(), &cert_dir)?;

    let token = std::env::var("SDS_TOKEN").ok().filter(|t| !t.is_empty());
    let store = Arc::new(WatchedSecretStore::new(watcher.clone(), token));

    let server = Arc::new(SdsServer::start(
        SdsOptions::from_env(),
        Arc::clone(&store) as Arc<dyn SecretStore>,
    )?);
    eprintln!(
        "SDS server listening on {} (certificates from {cert_dir})",
        server.uds_path().display()
    );

    let rotations = tokio::spawn(push_rotations(
        watcher.updated(),
        store,
        Arc::clone(&server),
    ));

    let _ = tokio::signal::ctrl_c().await;

    stop.cancel();
    server.stop().await?;
    rotations.abort();
    Ok(())
}
