use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{HeaderMap, Method},
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use parley_hub::ConversationHub;
use parley_shared::protocol::{Conversation, Profile};
use parley_shared::types::{ConversationId, UserId};

use crate::auth::Authenticator;
use crate::blob_store::BlobStore;
use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::ws;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ConversationHub>,
    pub blob_store: Arc<BlobStore>,
    pub auth: Arc<Authenticator>,
    pub rate_limiter: RateLimiter,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route("/session", post(open_session))
        .route("/profiles/search", get(profile_search))
        .route("/conversations", post(create_conversation))
        .route("/conversations", get(list_conversations))
        .route("/presence", post(presence_query))
        .route("/conversations/:id/messages", get(conversation_messages))
        .route("/blob/upload", post(blob_upload))
        .route("/blob/:id", get(blob_download))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(parley_shared::constants::MAX_IMAGE_SIZE))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Resolve the Authorization bearer token to a verified user id.
async fn authenticate(headers: &HeaderMap, auth: &Authenticator) -> Result<UserId, ServerError> {
    let value = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = value.strip_prefix("Bearer ").unwrap_or(value);

    auth.verify(token).await.ok_or(ServerError::Unauthorized)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    connected_sessions: usize,
    active_calls: usize,
}

#[derive(Deserialize)]
struct OpenSessionRequest {
    /// Existing identity to resume, or absent to provision a new one.
    user_id: Option<UserId>,
    username: String,
    display_name: String,
    avatar_url: Option<String>,
}

#[derive(Serialize)]
struct OpenSessionResponse {
    user_id: UserId,
    token: String,
}

#[derive(Deserialize)]
struct ProfileSearchQuery {
    q: String,
    #[serde(default = "default_search_limit")]
    limit: u32,
}

fn default_search_limit() -> u32 {
    20
}

#[derive(Deserialize)]
struct CreateConversationRequest {
    members: Vec<UserId>,
    name: Option<String>,
    #[serde(default)]
    is_group: bool,
}

#[derive(Deserialize)]
struct MessagesQuery {
    #[serde(default)]
    since_seq: i64,
}

#[derive(Deserialize)]
struct PresenceQueryRequest {
    users: Vec<UserId>,
}

#[derive(Serialize)]
struct PresenceQueryResponse {
    online: Vec<UserId>,
}

#[derive(Serialize)]
struct BlobUploadResponse {
    id: Uuid,
    url: String,
    content_type: String,
    size_bytes: u64,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        connected_sessions: state.hub.sessions().session_count().await,
        active_calls: state.hub.calls().active_calls().await,
    })
}

/// Provision or resume an identity and issue a session token.
async fn open_session(
    State(state): State<AppState>,
    Json(req): Json<OpenSessionRequest>,
) -> Result<Json<OpenSessionResponse>, ServerError> {
    if req.username.is_empty() {
        return Err(ServerError::BadRequest("username is required".into()));
    }

    let user_id = req.user_id.unwrap_or_else(UserId::new);
    state
        .hub
        .gateway()
        .upsert_profile(&Profile {
            user_id,
            username: req.username.clone(),
            display_name: req.display_name,
            avatar_url: req.avatar_url,
            last_active: chrono::Utc::now(),
        })
        .await?;

    let token = state.auth.issue(user_id).await;
    info!(user = %user_id.short(), username = %req.username, "session opened");

    Ok(Json(OpenSessionResponse { user_id, token }))
}

async fn profile_search(
    headers: HeaderMap,
    State(state): State<AppState>,
    Query(query): Query<ProfileSearchQuery>,
) -> Result<Json<Vec<Profile>>, ServerError> {
    let user = authenticate(&headers, &state.auth).await?;

    if query.q.is_empty() {
        return Ok(Json(Vec::new()));
    }

    let profiles = state
        .hub
        .gateway()
        .search_profiles(&query.q, user, query.limit.min(100))
        .await?;
    Ok(Json(profiles))
}

async fn create_conversation(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<Conversation>, ServerError> {
    let user = authenticate(&headers, &state.auth).await?;

    let mut members = req.members;
    if !members.contains(&user) {
        members.push(user);
    }
    if (!req.is_group && members.len() != 2) || members.len() < 2 {
        return Err(ServerError::BadRequest(format!(
            "Invalid member count: {}",
            members.len()
        )));
    }

    let conversation = state
        .hub
        .create_conversation(user, members, req.name, req.is_group)
        .await?;
    Ok(Json(conversation))
}

async fn list_conversations(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<Vec<Conversation>>, ServerError> {
    let user = authenticate(&headers, &state.auth).await?;

    let conversations = state.hub.gateway().list_conversations_for(user).await?;
    Ok(Json(conversations))
}

/// Batch presence check used when rendering a roster.
async fn presence_query(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<PresenceQueryRequest>,
) -> Result<Json<PresenceQueryResponse>, ServerError> {
    authenticate(&headers, &state.auth).await?;

    let online_set = state.hub.presence().online_set(&req.users).await;
    let online = req
        .users
        .into_iter()
        .filter(|u| online_set.contains(u))
        .collect();
    Ok(Json(PresenceQueryResponse { online }))
}

/// History read over HTTP; the same data a `Resync` command returns in-band.
async fn conversation_messages(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<ConversationId>,
    Query(query): Query<MessagesQuery>,
) -> Result<Json<Vec<parley_shared::protocol::Message>>, ServerError> {
    let user = authenticate(&headers, &state.auth).await?;

    let messages = state.hub.backfill(user, id, query.since_seq).await?;
    Ok(Json(messages))
}

/// Image upload. The returned url goes into a `MessagePayload::Image`.
async fn blob_upload(
    headers: HeaderMap,
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<BlobUploadResponse>, ServerError> {
    let user = authenticate(&headers, &state.auth).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ServerError::BadRequest(format!("Multipart error: {}", e)))?
    {
        let name = field.name().unwrap_or("").to_string();
        if name == "file" {
            let content_type = field.content_type().unwrap_or("").to_string();
            let data = field
                .bytes()
                .await
                .map_err(|e| ServerError::BadRequest(format!("Failed to read field: {}", e)))?;

            let id = state.blob_store.store_image(&data, &content_type).await?;

            info!(id = %id, size = data.len(), user = %user.short(), "Image uploaded via API");

            return Ok(Json(BlobUploadResponse {
                id,
                url: format!("/blob/{id}"),
                content_type,
                size_bytes: data.len() as u64,
            }));
        }
    }

    Err(ServerError::BadRequest(
        "Missing 'file' field in multipart form".to_string(),
    ))
}

async fn blob_download(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Vec<u8>, ServerError> {
    let data = state.blob_store.get_blob(id).await?;
    Ok(data)
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}
