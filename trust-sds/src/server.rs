use crate::error::SdsError;
use crate::options::SdsOptions;
use crate::registry::{NotifyOutcome, SessionRegistry};
use crate::secret::SecretItem;
use crate::service::SdsService;
use crate::store::SecretStore;
use log::{debug, error, info};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

type ServeTask = JoinHandle<Result<(), tonic::transport::Error>>;

/// A Secret Discovery Service listening on a Unix domain socket.
///
/// Proxies connect to the socket and fetch or stream secrets from the
/// [`SecretStore`]. Secrets can be pushed to streaming proxies at any time with
/// [`SdsServer::notify_proxy`].
///
/// ## Example
///
/// ```no_run
/// use std::sync::Arc;
/// use trust_sds::{SdsOptions, SdsServer, SecretItem, SecretStore, SecretStoreError};
///
/// struct Store;
///
/// #[tonic::async_trait]
/// impl SecretStore for Store {
///     async fn get_secret(
///         &self,
///         _node_id: &str,
///         identity: &str,
///         _token: &str,
///     ) -> Result<SecretItem, SecretStoreError> {
///         Err(SecretStoreError::NotFound(identity.to_string()))
///     }
/// }
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let server = SdsServer::start(SdsOptions::from_env(), Arc::new(Store))?;
///
/// // A rotation was detected somewhere else:
/// let item = SecretItem::new("spiffe://cluster.local/ns/bar/sa/foo", vec![1u8], vec![2u8]);
/// server.notify_proxy("sidecar~10.0.0.1~foo.bar~bar.svc.cluster.local", Some(item));
///
/// server.stop().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct SdsServer {
    uds_path: PathBuf,
    registry: SessionRegistry,
    shutdown: CancellationToken,
    task: Mutex<Option<ServeTask>>,
}

impl SdsServer {
    /// Binds `options.uds_path` and starts serving in the background.
    ///
    /// A stale socket file at the path is removed first and missing parent
    /// directories are created. Must be called from within a Tokio runtime.
    ///
    /// ## Errors
    ///
    /// Returns [`SdsError::Bind`] if the socket cannot be prepared or bound, and
    /// [`SdsError::Runtime`] outside a Tokio runtime.
    pub fn start(options: SdsOptions, store: Arc<dyn SecretStore>) -> Result<Self, SdsError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SdsError::Runtime(e.to_string()))?;

        let uds_path = options.uds_path;
        let bind_err = |source: io::Error| SdsError::Bind {
            path: uds_path.clone(),
            source,
        };

        if let Some(dir) = uds_path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(bind_err)?;
        }
        remove_socket(&uds_path).map_err(bind_err)?;

        let listener = UnixListener::bind(&uds_path).map_err(bind_err)?;
        let incoming = UnixListenerStream::new(listener);

        let registry = SessionRegistry::new(options.push_queue_capacity);
        let shutdown = CancellationToken::new();
        let service = SdsService::new(store, registry.clone(), shutdown.clone());

        let signal = shutdown.clone();
        let task = runtime.spawn(async move {
            Server::builder()
                .add_service(service.into_server())
                .serve_with_incoming_shutdown(incoming, signal.cancelled_owned())
                .await
        });

        info!("SDS server listening on {}", uds_path.display());

        Ok(Self {
            uds_path,
            registry,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Pushes `item` to the proxy streaming as `node_id`.
    ///
    /// `None`, or an item with empty certificate chain and key, closes that
    /// proxy's stream. Never waits on the proxy; see [`NotifyOutcome`].
    pub fn notify_proxy(&self, node_id: &str, item: Option<SecretItem>) -> NotifyOutcome {
        self.registry.notify(node_id, item)
    }

    /// The registry of open streams.
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// The socket path the server listens on.
    pub fn uds_path(&self) -> &Path {
        &self.uds_path
    }

    /// Closes every open stream, stops the transport and removes the socket.
    ///
    /// Calling it again is a no-op.
    ///
    /// ## Errors
    ///
    /// Returns an error if the transport failed while serving or the server
    /// task ended abnormally.
    pub async fn stop(&self) -> Result<(), SdsError> {
        self.shutdown.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(task) = task else {
            return Ok(());
        };

        let served = task.await.map_err(|e| SdsError::Task(e.to_string()));
        self.registry.clear();

        if let Err(e) = remove_socket(&self.uds_path) {
            error!("failed to remove SDS socket {}: {e}", self.uds_path.display());
        }
        info!("SDS server on {} stopped", self.uds_path.display());

        served??;
        Ok(())
    }
}

impl Drop for SdsServer {
    fn drop(&mut self) {
        // Best-effort: the serve task winds down on its own.
        self.shutdown.cancel();
    }
}

fn remove_socket(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("removed socket file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
