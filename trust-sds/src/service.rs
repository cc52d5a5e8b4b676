//! The `SecretDiscoveryService` gRPC implementation.
//!
//! Both RPCs read the credential token from the `authorization` metadata entry,
//! the identity from the first requested resource name and the node id from the
//! request's node. Streams additionally hold a session in the
//! [`SessionRegistry`] so secrets can be pushed to them later.

use crate::envelope::secret_response;
use crate::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use crate::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use crate::registry::{Registration, SessionRegistry};
use crate::secret::SecretItem;
use crate::store::SecretStore;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

/// Metadata key carrying the proxy's credential token.
pub const CREDENTIAL_TOKEN_HEADER: &str = "authorization";

// Responses buffered per stream before the session loop waits on the peer.
const RESPONSE_BUFFER: usize = 4;

type ResponseSender = mpsc::Sender<Result<DiscoveryResponse, Status>>;

/// Serves secrets from a [`SecretStore`] and keeps push sessions for streams.
#[derive(Clone)]
pub struct SdsService {
    store: Arc<dyn SecretStore>,
    registry: SessionRegistry,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SdsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SdsService")
            .field("store", &"<dyn SecretStore>")
            .field("registry", &self.registry)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl SdsService {
    /// Creates a service registering stream sessions in `registry`.
    ///
    /// Cancelling `shutdown` ends every open stream.
    pub fn new(
        store: Arc<dyn SecretStore>,
        registry: SessionRegistry,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            shutdown,
        }
    }

    /// Wraps the service for registration with a tonic server.
    pub fn into_server(self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self)
    }

    async fn resolve(
        &self,
        node_id: &str,
        identity: &str,
        token: &str,
    ) -> Result<DiscoveryResponse, Status> {
        let item = fetch(self.store.as_ref(), node_id, identity, token).await?;
        Ok(secret_response(&item))
    }
}

async fn fetch(
    store: &dyn SecretStore,
    node_id: &str,
    identity: &str,
    token: &str,
) -> Result<SecretItem, Status> {
    store
        .get_secret(node_id, identity, token)
        .await
        .map_err(|e| {
            warn!("secret store failed for node {node_id}, identity {identity}: {e}");
            Status::from(e)
        })
}

fn credential_token<T>(request: &Request<T>) -> Result<String, Status> {
    let value = request
        .metadata()
        .get(CREDENTIAL_TOKEN_HEADER)
        .ok_or_else(|| Status::unauthenticated("missing credential token"))?;
    value
        .to_str()
        .map(str::to_string)
        .map_err(|_| Status::unauthenticated("credential token is not valid ASCII"))
}

fn node_id(request: &DiscoveryRequest) -> Result<&str, Status> {
    let node = request
        .node
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("discovery request has no node"))?;
    if node.id.is_empty() {
        return Err(Status::invalid_argument("discovery request has an empty node id"));
    }
    Ok(&node.id)
}

fn identity(request: &DiscoveryRequest) -> Result<&str, Status> {
    match request.resource_names.first() {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(Status::invalid_argument("discovery request names no resource")),
    }
}

#[tonic::async_trait]
impl SecretDiscoveryService for SdsService {
    type StreamSecretsStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

    async fn stream_secrets(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> Result<Response<Self::StreamSecretsStream>, Status> {
        let token = credential_token(&request)?;
        let mut inbound = request.into_inner();

        let first = tokio::select! {
            msg = inbound.message() => msg?,
            () = self.shutdown.cancelled() => {
                return Err(Status::unavailable("SDS server is shutting down"));
            }
        };
        let first =
            first.ok_or_else(|| Status::invalid_argument("stream closed before first request"))?;

        let node_id = node_id(&first)?.to_string();
        let identity = identity(&first)?.to_string();

        // No session exists unless the initial secret resolves.
        let initial = self.resolve(&node_id, &identity, &token).await?;
        let registration = self.registry.register(&node_id);

        let (tx, rx) = mpsc::channel(RESPONSE_BUFFER);
        let last_nonce = initial.nonce.clone();
        // The channel is fresh, so this cannot wait.
        if tx.send(Ok(initial)).await.is_err() {
            self.registry.unregister(&node_id, registration.session_id);
            return Err(Status::internal("response channel closed"));
        }

        info!("SDS stream opened for node {node_id}, identity {identity}");

        let session = StreamSession {
            node_id,
            identity,
            token,
            last_nonce,
            store: Arc::clone(&self.store),
            registry: self.registry.clone(),
            shutdown: self.shutdown.clone(),
        };
        tokio::spawn(session.run(inbound, registration, tx));

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn fetch_secrets(
        &self,
        request: Request<DiscoveryRequest>,
    ) -> Result<Response<DiscoveryResponse>, Status> {
        let token = credential_token(&request)?;
        let request = request.into_inner();
        let node_id = node_id(&request)?;
        let identity = identity(&request)?;

        let response = self.resolve(node_id, identity, &token).await?;
        debug!("SDS fetch served for node {node_id}, identity {identity}");
        Ok(Response::new(response))
    }
}

/// Why a session loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Peer,
    Push,
    Shutdown,
    Error,
}

/// State of one open stream after its initial response.
struct StreamSession {
    node_id: String,
    identity: String,
    token: String,
    last_nonce: String,
    store: Arc<dyn SecretStore>,
    registry: SessionRegistry,
    shutdown: CancellationToken,
}

impl StreamSession {
    async fn run(
        mut self,
        mut inbound: Streaming<DiscoveryRequest>,
        registration: Registration,
        tx: ResponseSender,
    ) {
        let Registration {
            session_id,
            mut mailbox,
        } = registration;

        let reason = loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break Termination::Shutdown,

                () = tx.closed() => break Termination::Peer,

                msg = inbound.message() => match msg {
                    Ok(Some(request)) => {
                        if let Err(reason) = self.on_request(request, &tx).await {
                            break reason;
                        }
                    }
                    Ok(None) => break Termination::Peer,
                    Err(status) => {
                        debug!("SDS stream for node {} failed: {status}", self.node_id);
                        break Termination::Peer;
                    }
                },

                item = mailbox.recv() => match item {
                    Some(item) => {
                        let response = secret_response(&item);
                        if let Err(reason) = self.send(&tx, response).await {
                            break reason;
                        }
                        debug!(
                            "delivered pushed secret {} to node {}",
                            item.identity, self.node_id
                        );
                    }
                    // Revoked, evicted, replaced by a reconnect, or cleared at shutdown.
                    None => break Termination::Push,
                },
            }
        };

        self.registry.unregister(&self.node_id, session_id);
        info!("SDS stream for node {} closed ({reason:?})", self.node_id);
        // Dropping `tx` ends the response stream with an OK status.
    }

    /// Handles a request after the initial one.
    async fn on_request(
        &mut self,
        request: DiscoveryRequest,
        tx: &ResponseSender,
    ) -> Result<(), Termination> {
        if !request.response_nonce.is_empty() {
            if request.response_nonce != self.last_nonce {
                debug!(
                    "ignoring stale nonce {} from node {}",
                    request.response_nonce, self.node_id
                );
            } else if let Some(detail) = &request.error_detail {
                warn!(
                    "node {} rejected secret (nonce {}): code {}, {}",
                    self.node_id, request.response_nonce, detail.code, detail.message
                );
            } else {
                debug!(
                    "node {} acknowledged nonce {}",
                    self.node_id, request.response_nonce
                );
            }
            return Ok(());
        }

        if let Ok(identity) = identity(&request) {
            self.identity = identity.to_string();
        }

        match fetch(self.store.as_ref(), &self.node_id, &self.identity, &self.token).await {
            Ok(item) => self.send(tx, secret_response(&item)).await,
            Err(status) => {
                let _ = tx.send(Err(status)).await;
                Err(Termination::Error)
            }
        }
    }

    async fn send(
        &mut self,
        tx: &ResponseSender,
        response: DiscoveryResponse,
    ) -> Result<(), Termination> {
        let nonce = response.nonce.clone();
        tokio::select! {
            res = tx.send(Ok(response)) => {
                res.map_err(|_| Termination::Peer)?;
                self.last_nonce = nonce;
                Ok(())
            }
            () = self.shutdown.cancelled() => Err(Termination::Shutdown),
        }
    }
}
