// outpost-server/src/server.rs
// ============================================================================
// Module: Outpost Server
// Description: Server assembly: state wiring, routers, and the run loop.
// Purpose: Build all subsystems from configuration and serve agents + API.
// Dependencies: axum, outpost-comms, outpost-config, outpost-core, tokio
// ============================================================================

//! ## Overview
//! The server wires the data store, blob store, cipher layer, flow engine,
//! hunt dispatcher, approval checker, and handler registry into one shared
//! state, then serves three surfaces: the agent poll endpoint, the signed
//! binary distribution endpoints, and the operator API. Flow-processing
//! workers run as plain threads beside the async listener.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::ConnectInfo;
use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use rand::RngCore;
use rand::rngs::OsRng;
use thiserror::Error;

use outpost_comms::Communicator;
use outpost_comms::PrivateKey;
use outpost_comms::PublicKey;
use outpost_config::ApiConfig;
use outpost_config::OutpostConfig;
use outpost_config::StoreConfig;
use outpost_core::ApprovalChecker;
use outpost_core::BinaryKind;
use outpost_core::BlobStore;
use outpost_core::DataStore;
use outpost_core::FlowEngine;
use outpost_core::FlowRegistry;
use outpost_core::HuntDispatcher;
use outpost_core::InMemoryBlobStore;
use outpost_core::InMemoryDataStore;
use outpost_core::SignedBinaryId;
use outpost_core::StaticUserCatalog;
use outpost_core::SystemClock;
use outpost_core::interfaces::Clock;
use outpost_core::interfaces::IdGenerator;
use outpost_store_sqlite::SqliteOutpostStore;

use crate::api::api_router;
use crate::audit::AuditSink;
use crate::audit::StderrAuditSink;
use crate::auth::ApiAuth;
use crate::frontend::FrontEnd;
use crate::frontend::PollError;
use crate::frontend::StorePeerKeys;
use crate::handlers::HandlerRegistry;
use crate::telemetry::CountingMetrics;
use crate::telemetry::ServerMetrics;
use crate::workers::WorkerPool;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Server build and run errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be applied.
    #[error("server config error: {0}")]
    Config(String),
    /// Key material could not be loaded.
    #[error("server key error: {0}")]
    Key(String),
    /// The store backend could not be opened.
    #[error("server store error: {0}")]
    Store(String),
    /// The listener could not be bound.
    #[error("server bind error: {0}")]
    Bind(String),
}

// ============================================================================
// SECTION: Identifier Source
// ============================================================================

/// CSPRNG-backed identifier source for production use.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn next_id(&self) -> u64 {
        loop {
            let id = OsRng.next_u64();
            if id != 0 {
                return id;
            }
        }
    }
}

// ============================================================================
// SECTION: Server State
// ============================================================================

/// Shared state behind every handler.
pub struct ServerState {
    /// Data store backend.
    pub store: Arc<dyn DataStore>,
    /// Blob store backend.
    pub blobs: Arc<dyn BlobStore>,
    /// Flow engine.
    pub engine: Arc<FlowEngine>,
    /// Hunt dispatcher.
    pub dispatcher: Arc<HuntDispatcher>,
    /// Approval checker.
    pub approvals: Arc<ApprovalChecker>,
    /// Agent poll front end.
    pub frontend: Arc<FrontEnd>,
    /// API authenticator.
    pub auth: Arc<ApiAuth>,
    /// Audit sink.
    pub audit: Arc<dyn AuditSink>,
    /// Metrics sink.
    pub metrics: Arc<dyn ServerMetrics>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
    /// Server public key PEM served to agents.
    pub server_public_key_pem: String,
    /// Code-signing public key, when binary delivery is enabled.
    pub signing_public_key: Option<PublicKey>,
    /// API limits.
    pub api_config: ApiConfig,
    /// Default per-flow CPU budget in seconds.
    pub default_cpu_limit_seconds: f64,
    /// Default per-flow network budget in bytes.
    pub default_network_bytes_limit: u64,
}

/// Fully assembled server.
pub struct OutpostServer {
    /// Shared handler state.
    state: Arc<ServerState>,
    /// Validated configuration.
    config: OutpostConfig,
}

impl OutpostServer {
    /// Builds the server from validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError`] when keys or the store cannot be opened.
    pub fn from_config(config: OutpostConfig) -> Result<Self, ServerError> {
        let key_pem = std::fs::read_to_string(&config.server.private_key_path)
            .map_err(|err| ServerError::Key(err.to_string()))?;
        let private_key =
            PrivateKey::from_pem(&key_pem).map_err(|err| ServerError::Key(err.to_string()))?;
        let server_public_key_pem = private_key
            .public_key()
            .to_pem()
            .map_err(|err| ServerError::Key(err.to_string()))?;

        let signing_public_key = match &config.server.signing_public_key_path {
            Some(path) => {
                let pem = std::fs::read_to_string(path)
                    .map_err(|err| ServerError::Key(err.to_string()))?;
                Some(PublicKey::from_pem(&pem).map_err(|err| ServerError::Key(err.to_string()))?)
            }
            None => None,
        };

        let (store, blobs): (Arc<dyn DataStore>, Arc<dyn BlobStore>) = match &config.store {
            StoreConfig::Memory => {
                (Arc::new(InMemoryDataStore::new()), Arc::new(InMemoryBlobStore::new()))
            }
            StoreConfig::Sqlite { sqlite } => {
                let store = SqliteOutpostStore::open(sqlite)
                    .map_err(|err| ServerError::Store(err.to_string()))?;
                (Arc::new(store.clone()), Arc::new(store))
            }
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let ids: Arc<dyn IdGenerator> = Arc::new(RandomIdGenerator);
        let metrics: Arc<dyn ServerMetrics> = Arc::new(CountingMetrics::new());
        let audit: Arc<dyn AuditSink> = Arc::new(StderrAuditSink);

        let communicator = Arc::new(Communicator::new(
            config.server.server_name.clone(),
            private_key,
            Arc::new(StorePeerKeys::new(Arc::clone(&store))),
        ));

        let registry = Arc::new(FlowRegistry::builtin());
        let engine = Arc::new(FlowEngine::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&registry),
            config.engine_config(),
        ));
        let dispatcher = Arc::new(HuntDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&engine),
            config.hunt_config(),
        ));
        let approvals = Arc::new(ApprovalChecker::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::new(StaticUserCatalog::new(config.user_catalog_entries())),
            config.approval_config(),
        ));
        let handler_registry = Arc::new(HandlerRegistry::standard(
            Arc::clone(&store),
            Arc::clone(&clock),
            Arc::clone(&dispatcher),
            Arc::clone(&audit),
        ));
        let frontend = Arc::new(FrontEnd::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::clone(&engine),
            Arc::clone(&dispatcher),
            Arc::clone(&handler_registry),
            communicator,
            Arc::clone(&clock),
            Arc::clone(&ids),
            Arc::clone(&metrics),
            config.frontend,
        ));

        let auth = Arc::new(ApiAuth::new(config.auth.users.iter().map(|user| {
            (user.username.as_str().into(), user.token.clone(), user.user_type.into())
        })));

        let state = Arc::new(ServerState {
            store,
            blobs,
            engine,
            dispatcher,
            approvals,
            frontend,
            auth,
            audit,
            metrics,
            clock,
            server_public_key_pem,
            signing_public_key,
            api_config: config.api,
            default_cpu_limit_seconds: config.engine.default_cpu_limit_seconds,
            default_network_bytes_limit: config.engine.default_network_bytes_limit,
        });
        Ok(Self { state, config })
    }

    /// Returns the shared state, mainly for tests.
    #[must_use]
    pub fn state(&self) -> Arc<ServerState> {
        Arc::clone(&self.state)
    }

    /// Builds the full router.
    #[must_use]
    pub fn router(&self) -> Router {
        Self::router_for(Arc::clone(&self.state))
    }

    /// Builds the full router over the given state.
    #[must_use]
    pub fn router_for(state: Arc<ServerState>) -> Router {
        Router::new()
            .route("/control", post(control))
            .route("/server.pem", get(server_pem))
            .route("/binaries/{kind}/{*path}", get(download_binary))
            .nest("/api/v1", api_router())
            .with_state(state)
    }

    /// Spawns workers and serves until interrupted.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] when the listener cannot be bound.
    pub async fn run(self) -> Result<(), ServerError> {
        let registry = HandlerRegistry::standard(
            Arc::clone(&self.state.store),
            Arc::clone(&self.state.clock),
            Arc::clone(&self.state.dispatcher),
            Arc::clone(&self.state.audit),
        );
        let workers = WorkerPool::spawn(
            Arc::clone(&self.state.engine),
            Arc::clone(&self.state.dispatcher),
            Arc::clone(&self.state.store),
            Arc::clone(&self.state.clock),
            Arc::new(registry),
            Arc::clone(&self.state.metrics),
            Arc::clone(&self.state.audit),
            self.config.engine.workers,
            Duration::from_millis(self.config.engine.poll_interval_ms),
        );

        let listener = tokio::net::TcpListener::bind(self.config.server.bind_addr)
            .await
            .map_err(|err| ServerError::Bind(err.to_string()))?;
        let router = Self::router_for(Arc::clone(&self.state));
        let serve = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        });
        let result = serve.await.map_err(|err| ServerError::Bind(err.to_string()));
        workers.stop();
        result
    }
}

// ============================================================================
// SECTION: Agent Handlers
// ============================================================================

/// Serves one agent poll on `/control`.
async fn control(
    State(state): State<Arc<ServerState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Bytes,
) -> Response {
    let frontend = Arc::clone(&state.frontend);
    let peer_ip = peer.ip().to_string();
    let result =
        tokio::task::spawn_blocking(move || frontend.handle_poll(&body, &peer_ip)).await;
    match result {
        Ok(Ok(reply)) => {
            ([(CONTENT_TYPE, "application/binary")], reply).into_response()
        }
        Ok(Err(PollError::EnrollmentRequired)) => StatusCode::NOT_ACCEPTABLE.into_response(),
        Ok(Err(PollError::Reject(_))) | Err(_) => {
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serves the server public key.
async fn server_pem(State(state): State<Arc<ServerState>>) -> Response {
    ([(CONTENT_TYPE, "application/x-pem-file")], state.server_public_key_pem.clone())
        .into_response()
}

/// Streams the concatenation of a signed binary's blobs.
async fn download_binary(
    State(state): State<Arc<ServerState>>,
    Path((kind, path)): Path<(String, String)>,
) -> Response {
    let Ok(kind) = kind.parse::<BinaryKind>() else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let id = SignedBinaryId { binary_kind: kind, path };
    let references = match state.store.read_signed_binary_references(&id) {
        Ok(references) => references,
        Err(_) => return StatusCode::NOT_FOUND.into_response(),
    };
    let ids: Vec<_> = references.blobs.iter().map(|blob| blob.blob_id).collect();
    match state.blobs.read_blobs(&ids) {
        Ok(chunks) => {
            let mut body = Vec::new();
            for chunk in chunks {
                body.extend_from_slice(&chunk);
            }
            ([(CONTENT_TYPE, "application/octet-stream")], body).into_response()
        }
        Err(_) => StatusCode::NOT_FOUND.into_response(),
    }
}
