use crate::bridge::{PromptParams, Relay, RelayStream, WorkerPool};
use crate::config::RelayConfig;
use crate::hot::{HotContentSource, HotFeed, StaticHotContent};
use crate::identity::{
    IdentityResolver, SessionTable, parse_user_id, resolve_identity, user_id_from_json,
};
use crate::lifecycle::{Connection, ConnectionRegistry, LifecyclePolicy, RelayKind};
use crate::protocol::{ChatRequest, HealthResponse, StreamQuery, StreamRequest, ThinkMode};
use crate::upstream::{CompletionClient, HttpCompletionClient};
use axum::Json;
use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, Response};
use axum::routing::get;
use std::error::Error;
use std::sync::Arc;
use tracing::info;

pub struct ServerState {
    relay: Relay,
    hot: HotFeed,
    identity: Arc<dyn IdentityResolver>,
    connections: Arc<ConnectionRegistry>,
    completion_policy: LifecyclePolicy,
    hot_policy: LifecyclePolicy,
}

impl ServerState {
    pub fn new(
        relay: Relay,
        hot: HotFeed,
        identity: Arc<dyn IdentityResolver>,
        completion_policy: LifecyclePolicy,
        hot_policy: LifecyclePolicy,
    ) -> Self {
        Self {
            relay,
            hot,
            identity,
            connections: ConnectionRegistry::new(),
            completion_policy,
            hot_policy,
        }
    }

    /// Hands `events` to a fresh connection and returns its response. The
    /// connection is driven on its own task until it releases itself.
    fn attach(&self, kind: RelayKind, events: RelayStream) -> Response<Body> {
        let policy = match kind {
            RelayKind::Completion => self.completion_policy,
            RelayKind::HotContent => self.hot_policy,
        };
        let (connection, response) = Connection::accept(&self.connections, kind, policy);
        tokio::spawn(connection.run(events));
        response
    }
}

type ServerResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

pub async fn run(config: RelayConfig) -> ServerResult<()> {
    let workers = Arc::new(WorkerPool::new(config.workers)?);

    let client: Arc<dyn CompletionClient> = Arc::new(HttpCompletionClient::new(
        &config.upstream_url,
        config.api_key.clone(),
        config.model.clone(),
    ));
    let relay = Relay::new(client, Arc::clone(&workers), config.channel_capacity);

    let source: Arc<dyn HotContentSource> = match &config.hot_content {
        Some(path) => {
            info!(path = %path.display(), "loading hot content");
            Arc::new(StaticHotContent::from_file(path)?)
        }
        None => Arc::new(StaticHotContent::default()),
    };
    let hot = HotFeed::new(source, workers, config.hot_interval, config.channel_capacity);

    let sessions = match &config.sessions {
        Some(path) => {
            let table = SessionTable::from_file(path)?;
            info!(path = %path.display(), sessions = table.len(), "loaded login sessions");
            table
        }
        None => {
            info!("no session file configured, only explicit userId identifies callers");
            SessionTable::default()
        }
    };

    let state = Arc::new(ServerState::new(
        relay,
        hot,
        Arc::new(sessions),
        config.completion,
        config.hot,
    ));

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen).await?;
    info!(addr = %config.listen, upstream = %config.upstream_url, model = %config.model, "chat relay listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

pub fn create_router(state: Arc<ServerState>) -> axum::Router {
    axum::Router::new()
        .route(
            "/chat/stream/flux",
            get(stream_chat).post(stream_chat_with_thinking),
        )
        .route("/qa/hot/sse", get(stream_hot_content))
        .route("/health", get(health))
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutting down");
}

async fn stream_chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    query: Result<Query<StreamQuery>, QueryRejection>,
) -> Response<Body> {
    let Query(query) = match query {
        Ok(query) => query,
        Err(rejection) => {
            let events = state
                .relay
                .rejected(&format!("invalid query: {}", rejection.body_text()));
            return state.attach(RelayKind::Completion, events);
        }
    };

    let identity = resolve_identity(state.identity.as_ref(), &headers, || {
        parse_user_id(query.user_id.as_deref().unwrap_or(""))
    });

    let events = match identity {
        Err(err) => state.relay.rejected(&err.to_string()),
        Ok(user_id) => {
            let request = StreamRequest {
                user_id,
                session_id: query.session_id,
                messages: Vec::new(),
                think: ThinkMode::Disabled,
            };
            let prompt = PromptParams {
                role: query.role,
                content: query.content,
            };
            state.relay.open(request, &prompt)
        }
    };

    state.attach(RelayKind::Completion, events)
}

async fn stream_chat_with_thinking(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> Response<Body> {
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(rejection) => {
            let events = state
                .relay
                .rejected(&format!("invalid request body: {}", rejection.body_text()));
            return state.attach(RelayKind::Completion, events);
        }
    };

    let identity = resolve_identity(state.identity.as_ref(), &headers, || {
        payload
            .user_id
            .as_ref()
            .map_or(Ok(None), user_id_from_json)
    });

    let events = match identity {
        Err(err) => state.relay.rejected(&err.to_string()),
        Ok(user_id) => {
            let request = StreamRequest {
                user_id,
                session_id: payload.session_id,
                messages: payload.messages,
                think: payload.thinking.map(|thinking| thinking.mode).unwrap_or_default(),
            };
            let prompt = PromptParams {
                role: payload.role,
                content: payload.content,
            };
            state.relay.open(request, &prompt)
        }
    };

    state.attach(RelayKind::Completion, events)
}

async fn stream_hot_content(State(state): State<Arc<ServerState>>) -> Response<Body> {
    let events = state.hot.open();
    state.attach(RelayKind::HotContent, events)
}

async fn health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        active_connections: state.connections.active_count(),
        released_connections: state.connections.released_count(),
    })
}
