//! HTTP routes and WebSocket upgrades.
//!
//! Every route except the active-user feed and `/health` authenticates the
//! caller first. WebSocket credentials are checked before the upgrade, so a
//! rejected client never touches a registry.

use crate::auth::{extract_token, JwtVerifier};
use crate::config::Config;
use crate::metrics;
use crate::session::{self, SessionConfig};
use anyhow::Result;
use axum::{
    async_trait,
    extract::{
        ws::{WebSocket, WebSocketUpgrade},
        ConnectInfo, FromRequestParts, Path, Query, State,
    },
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use courier_core::{
    ActiveUserDirectory, AuthError, Identity, MemoryStore, Messenger, RelayError, Store,
    StoreError, Verifier,
};
use courier_protocol::{MessageEnvelope, MessageId, MessageStatus};
use courier_transport::AxumConnection;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Shared server state.
pub struct AppState {
    pub messenger: Arc<Messenger>,
    pub verifier: Arc<dyn Verifier>,
    pub config: Config,
}

impl AppState {
    /// Wire the messaging core over `store`.
    #[must_use]
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let directory = Arc::new(ActiveUserDirectory::new(config.presence.grace_period()));
        let verifier = JwtVerifier::new(&config.auth.jwt_secret, config.auth.leeway_secs);

        Self {
            messenger: Arc::new(Messenger::new(store, directory)),
            verifier: Arc::new(verifier),
            config,
        }
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            heartbeat_interval: self.config.heartbeat.interval(),
            heartbeat_timeout: self.config.heartbeat.timeout(),
            outbound_queue: self.config.limits.outbound_queue,
        }
    }

    fn connection(&self, socket: WebSocket, addr: SocketAddr) -> AxumConnection {
        AxumConnection::new(socket, self.config.limits.max_message_size).with_remote_addr(addr)
    }
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// An HTTP error with a machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        let message = error.to_string();
        match error {
            RelayError::ChatNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "CHAT_NOT_FOUND", message)
            }
            RelayError::MessageNotFound(_) => {
                ApiError::new(StatusCode::NOT_FOUND, "MESSAGE_NOT_FOUND", message)
            }
            RelayError::NotMember { .. } => {
                ApiError::new(StatusCode::FORBIDDEN, "NOT_CHAT_MEMBER", message)
            }
            RelayError::NotAuthor { .. } => {
                ApiError::new(StatusCode::FORBIDDEN, "NOT_MESSAGE_AUTHOR", message)
            }
            RelayError::NotParticipant { .. } => {
                ApiError::new(StatusCode::FORBIDDEN, "NOT_CHAT_MEMBER", message)
            }
            RelayError::Store(StoreError::Constraint(_)) => {
                ApiError::new(StatusCode::BAD_REQUEST, "INVALID_ARGUMENT", message)
            }
            RelayError::Store(StoreError::Unavailable(_)) => {
                error!(error = %message, "Store unavailable");
                metrics::record_error("store");
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", message)
            }
            RelayError::Protocol(_) => {
                error!(error = %message, "Encoding failed");
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(error: AuthError) -> Self {
        ApiError::new(StatusCode::UNAUTHORIZED, "UNAUTHORIZED", error.to_string())
    }
}

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// The verified caller.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let query = Query::<TokenQuery>::try_from_uri(&parts.uri)
            .map(|Query(q)| q)
            .unwrap_or_default();
        let token = extract_token(query.token.as_deref(), &parts.headers).ok_or(AuthError::Missing)?;
        let identity = state.verifier.verify(token).map_err(|e| {
            warn!(error = %e, "Rejected credentials");
            e
        })?;
        Ok(Self(identity))
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/v1/create-chat", post(create_chat))
        .route("/v1/chat/:chat_id/history", get(chat_history))
        .route("/v1/chat/:chat_id", delete(delete_chat))
        .route("/v1/chat/:chat_id/delete-messages", delete(delete_messages))
        .route("/v1/me/chats", get(my_chats))
        .route("/v1/check-chat/:user1/:user2", get(check_chat))
        .route("/v1/message/:message_id", delete(delete_message))
        .route("/v1/notifications/chat/unread", get(unread_count))
        .route("/v1/notifications/chat/mark-read/:chat_id", post(mark_read))
        .route("/v1/follow-notice/:username", post(follow_notice))
        .route("/v1/session/activate", post(activate))
        .route("/v1/logout", post(logout))
        .route("/v1/active-users", get(active_users))
        .route("/v1/chat/:chat_id/ws", get(chat_ws))
        .route("/v1/chat-notifications/ws", get(chat_notifications_ws))
        .route("/v1/notifications/ws", get(notifications_ws))
        .route("/v1/active-users/ws", get(active_users_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(config, Arc::new(MemoryStore::new())));
    let _delivery = state.messenger.spawn_delivery_worker();
    let app = router(state);

    let listener = TcpListener::bind(addr).await?;
    info!("Courier server listening on {}", addr);

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, Deserialize)]
struct CreateChatRequest {
    user2: String,
}

async fn create_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Json(request): Json<CreateChatRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let other = request.user2.trim();
    if other.is_empty() {
        return Err(ApiError::bad_request("user2 is required"));
    }
    let chat = state.messenger.create_chat(&identity, other).await?;
    Ok(Json(json!({ "chat_id": chat.chat_id })))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    #[serde(default = "default_history_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_history_limit() -> usize {
    20
}

async fn chat_history(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(chat_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<MessageEnvelope>>, ApiError> {
    let limit = query.limit.min(state.config.limits.max_history_page);
    let envelopes = state
        .messenger
        .history(&chat_id, &identity, limit, query.offset)
        .await?;
    Ok(Json(envelopes))
}

async fn delete_messages(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let hidden = state.messenger.delete_messages_for(&chat_id, &identity).await?;
    Ok(Json(json!({ "deleted": hidden })))
}

async fn my_chats(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chats = state.messenger.inbox(&identity).await?;
    Ok(Json(json!({ "chats": chats })))
}

async fn check_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path((user1, user2)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let chat_id = state.messenger.find_chat(&identity, &user1, &user2).await?;
    Ok(Json(json!({ "chat_id": chat_id.unwrap_or_default() })))
}

async fn delete_chat(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(chat_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.messenger.delete_chat(&chat_id, &identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_message(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(message_id): Path<MessageId>,
) -> Result<StatusCode, ApiError> {
    state.messenger.delete_message(message_id, &identity).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> Result<Json<serde_json::Value>, ApiError> {
    let unread_count = state.messenger.unread_total(&identity).await?;
    Ok(Json(json!({ "unread_count": unread_count })))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(chat_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let read = state.messenger.mark_read(&chat_id, &identity).await?;
    metrics::record_transitions(MessageStatus::Read, read.len());
    Ok(Json(json!({ "message_ids": read })))
}

async fn follow_notice(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(username): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let delivered = state.messenger.notify_follow(&identity, &username).await?;
    if delivered {
        metrics::record_notification("follow");
    }
    Ok(Json(json!({ "delivered": delivered })))
}

async fn activate(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> Result<StatusCode, ApiError> {
    let picture = state
        .messenger
        .store()
        .profile_picture(&identity)
        .await
        .map_err(RelayError::from)?;
    state.messenger.directory().activate(&identity, &picture).await;
    Ok(StatusCode::NO_CONTENT)
}

async fn logout(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> Json<serde_json::Value> {
    let was_active = state.messenger.directory().logout(&identity).await;
    Json(json!({ "logged_out": was_active }))
}

async fn active_users(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
) -> impl IntoResponse {
    Json(state.messenger.directory().active_users_for(&identity).await)
}

async fn chat_ws(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    Path(chat_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let ctx = state.messenger.open_chat(&chat_id, &identity).await?;

    Ok(ws
        .max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = state.connection(socket, addr);
            let messenger = Arc::clone(&state.messenger);
            session::serve_chat(messenger, ctx, conn, state.session_config()).await;
        }))
}

async fn chat_notifications_ws(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = state.connection(socket, addr);
            session::serve_notifications(
                Arc::clone(&state.messenger),
                Messenger::chat_notifications,
                identity,
                conn,
                state.session_config(),
            )
            .await;
        })
}

async fn notifications_ws(
    State(state): State<Arc<AppState>>,
    AuthUser(identity): AuthUser,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = state.connection(socket, addr);
            session::serve_notifications(
                Arc::clone(&state.messenger),
                Messenger::notifications,
                identity,
                conn,
                state.session_config(),
            )
            .await;
        })
}

#[derive(Debug, Deserialize)]
struct FeedQuery {
    #[serde(default)]
    username: String,
}

/// The feed names its user in the query string and is not authenticated.
async fn active_users_ws(
    State(state): State<Arc<AppState>>,
    Query(query): Query<FeedQuery>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let identity = query.username.trim().to_string();
    if identity.is_empty() {
        return Err(ApiError::bad_request("username is required"));
    }
    let picture = state
        .messenger
        .store()
        .profile_picture(&identity)
        .await
        .map_err(RelayError::from)?;

    Ok(ws
        .max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| async move {
            let conn = state.connection(socket, addr);
            session::serve_active_users(
                Arc::clone(state.messenger.directory()),
                identity,
                picture,
                conn,
                state.session_config(),
            )
            .await;
        }))
}
