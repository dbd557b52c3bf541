use crate::{auth, config::Config, db, store::SqliteStore, ws};
use anyhow::Result;
use axum::{
    extract::{Extension, Path, Query, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use chat_core::{
    ChatError, ChatHub, CoreConfig, Member, Room, SessionStore, StoreError, StoreHandle, UserIdentity,
    DEFAULT_PAGE_LIMIT,
};
use chat_protocol::{MessagePayload, RoomPayload};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<ChatHub>,
    pub store: StoreHandle<SqliteStore>,
    pub config: Config,
}

impl AppState {
    /// Open the database under the data dir and start the chat hub.
    pub async fn new(config: Config) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        let secret = auth::load_or_create_secret(&config.data_dir, config.jwt_secret.as_deref())?;
        let pool = db::init_pool(config.data_dir.join("chat.db"))?;
        let store = Arc::new(SqliteStore::new(pool, secret));
        let hub = ChatHub::new(
            store.clone(),
            store.clone(),
            CoreConfig {
                store_timeout: config.store_timeout,
                ..CoreConfig::default()
            },
        );
        Ok(Self {
            hub,
            store: StoreHandle::new(store, config.store_timeout),
            config,
        })
    }
}

/// Build the HTTP application router.
pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/me", get(me))
        .route("/api/rooms", post(create_room).get(list_rooms))
        .route("/api/rooms/:id", get(room_detail).delete(delete_room))
        .route("/api/rooms/:id/join", post(join_room))
        .route("/api/rooms/:id/leave", post(leave_room))
        .route("/api/rooms/:id/participants", get(participants))
        .route(
            "/api/rooms/:id/messages",
            post(create_message).get(list_messages),
        )
        .route(
            "/api/rooms/:id/messages/:message_id",
            patch(edit_message).delete(delete_message),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));
    Router::new()
        .route("/api/health", get(health))
        .route("/api/auth/login", post(login))
        .route("/ws", get(ws::ws_handler))
        .merge(protected)
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

/// Bearer token of the current request, kept for logout.
#[derive(Clone)]
struct AccessToken(String);

pub(crate) fn bearer(headers: &axum::http::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

async fn auth_middleware<B>(
    State(state): State<AppState>,
    mut req: axum::http::Request<B>,
    next: Next<B>,
) -> Result<Response, AppError> {
    let token = bearer(req.headers()).unwrap_or_default().to_owned();
    let user = state.hub.authenticate(&token).await?;
    req.extensions_mut().insert(user);
    req.extensions_mut().insert(AccessToken(token));
    Ok(next.run(req).await)
}

#[derive(Serialize)]
struct ErrorResp {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

/// `ChatError` rendered as a JSON error response.
#[derive(Debug)]
pub struct AppError(pub ChatError);

impl From<ChatError> for AppError {
    fn from(e: ChatError) -> Self {
        Self(e)
    }
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0 {
            ChatError::Validation(_) => StatusCode::BAD_REQUEST,
            ChatError::Unauthenticated => StatusCode::UNAUTHORIZED,
            ChatError::NotAMember
            | ChatError::NotOwner
            | ChatError::NotLastMessage
            | ChatError::Superseded => StatusCode::FORBIDDEN,
            ChatError::RoomNotFound | ChatError::MessageNotFound => StatusCode::NOT_FOUND,
            ChatError::AlreadyMember => StatusCode::CONFLICT,
            ChatError::Timeout => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let message = match &self.0 {
            ChatError::Validation(m) => Some(m.clone()),
            ChatError::Internal(m) => {
                error!(error = %m, "request failed");
                None
            }
            _ => None,
        };
        let body = ErrorResp {
            error: self.0.code().into(),
            message,
        };
        (self.status(), Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, AppError>;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct UserResp {
    id: Uuid,
    nickname: String,
    is_online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_seen_at: Option<i64>,
}

impl From<UserIdentity> for UserResp {
    fn from(u: UserIdentity) -> Self {
        Self {
            id: u.id,
            nickname: u.nickname,
            is_online: u.is_online,
            last_seen_at: u.last_seen_at,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ParticipantResp {
    #[serde(flatten)]
    user: UserResp,
    joined_at: i64,
}

impl From<Member> for ParticipantResp {
    fn from(m: Member) -> Self {
        Self {
            user: m.user.into(),
            joined_at: m.joined_at,
        }
    }
}

#[derive(Deserialize)]
struct LoginReq {
    nickname: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResp {
    user: UserResp,
    access_token: String,
}

async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginReq>,
) -> ApiResult<impl IntoResponse> {
    let nickname = auth::validate_nickname(&req.nickname)?.to_owned();
    let user = state
        .store
        .call(move |s| s.find_or_create_user(&nickname))
        .await?;
    let ttl = state.config.token_ttl;
    let (user_id, nick) = (user.id, user.nickname.clone());
    let token = state
        .store
        .call(move |s| {
            let token = auth::issue_jwt(s.secret(), user_id, &nick, ttl)
                .map_err(StoreError::backend)?;
            s.set_session_token(&user_id, Some(&token))?;
            Ok(token)
        })
        .await?;
    info!(user_id = %user.id, nickname = %user.nickname, "user logged in");
    let mut user = user;
    user.is_online = state.hub.registry().is_online(&user.id);
    Ok(Json(LoginResp {
        user: user.into(),
        access_token: token,
    }))
}

async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Extension(token): Extension<AccessToken>,
) -> ApiResult<impl IntoResponse> {
    let user_id = user.id;
    let cleared = state
        .store
        .call(move |s| {
            // only the presented session is revoked
            match s.validate_token(&token.0)? {
                Some(u) if u.id == user_id => s.set_session_token(&user_id, None).map(|_| true),
                _ => Ok(false),
            }
        })
        .await?;
    info!(%user_id, cleared, "user logged out");
    Ok(StatusCode::NO_CONTENT)
}

async fn me(
    State(state): State<AppState>,
    Extension(mut user): Extension<UserIdentity>,
) -> impl IntoResponse {
    user.is_online = state.hub.registry().is_online(&user.id);
    Json(UserResp::from(user))
}

#[derive(Deserialize)]
struct CreateRoomReq {
    name: String,
}

async fn create_room(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Json(req): Json<CreateRoomReq>,
) -> ApiResult<impl IntoResponse> {
    let room = state.hub.rooms().create_room(&user, &req.name).await?;
    Ok((StatusCode::CREATED, Json(room.to_payload(Some(1)))))
}

async fn list_rooms(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let rooms = state.hub.rooms().list_rooms().await?;
    let body: Vec<RoomPayload> = rooms
        .iter()
        .map(|(room, count)| room.to_payload(Some(*count)))
        .collect();
    Ok(Json(body))
}

#[derive(Serialize)]
struct RoomDetailResp {
    #[serde(flatten)]
    room: RoomPayload,
    participants: Vec<ParticipantResp>,
}

fn detail(room: Room, members: Vec<Member>) -> RoomDetailResp {
    RoomDetailResp {
        room: room.to_payload(Some(members.len() as u32)),
        participants: members.into_iter().map(ParticipantResp::from).collect(),
    }
}

async fn room_detail(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let (room, members) = state.hub.rooms().room_detail(id).await?;
    Ok(Json(detail(room, members)))
}

async fn delete_room(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.hub.rooms().delete_room(id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn join_room(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.hub.rooms().join(id, &user).await?;
    let (room, members) = state.hub.rooms().room_detail(id).await?;
    Ok(Json(detail(room, members)))
}

async fn leave_room(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.hub.rooms().leave(id, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn participants(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let members = state.hub.rooms().members(id).await?;
    let body: Vec<ParticipantResp> = members.into_iter().map(ParticipantResp::from).collect();
    Ok(Json(body))
}

#[derive(Deserialize)]
struct ContentReq {
    content: String,
}

async fn create_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(id): Path<Uuid>,
    Json(req): Json<ContentReq>,
) -> ApiResult<impl IntoResponse> {
    let msg = state.hub.messages().create(id, user.id, &req.content).await?;
    Ok((StatusCode::CREATED, Json(msg.to_payload())))
}

#[derive(Deserialize)]
struct ListQuery {
    cursor: Option<String>,
    limit: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PageResp {
    messages: Vec<MessagePayload>,
    next_cursor: Option<Uuid>,
    has_more: bool,
}

async fn list_messages(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path(id): Path<Uuid>,
    Query(q): Query<ListQuery>,
) -> ApiResult<impl IntoResponse> {
    let cursor = match q.cursor.as_deref().filter(|c| !c.is_empty()) {
        Some(c) => Some(Uuid::parse_str(c).map_err(|_| ChatError::validation("invalid cursor"))?),
        None => None,
    };
    let limit = match q.limit.as_deref() {
        Some(l) => l
            .parse::<usize>()
            .map_err(|_| ChatError::validation("limit must be between 1 and 100"))?,
        None => DEFAULT_PAGE_LIMIT,
    };
    state.hub.rooms().require_member(id, user.id).await?;
    let page = state.hub.messages().list_by_room(id, cursor, limit).await?;
    Ok(Json(PageResp {
        messages: page.messages.iter().map(|m| m.to_payload()).collect(),
        next_cursor: page.next_cursor,
        has_more: page.has_more,
    }))
}

async fn edit_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path((room_id, message_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<ContentReq>,
) -> ApiResult<impl IntoResponse> {
    let msg = state
        .hub
        .messages()
        .edit_in_room(room_id, message_id, user.id, &req.content)
        .await?;
    Ok(Json(msg.to_payload()))
}

async fn delete_message(
    State(state): State<AppState>,
    Extension(user): Extension<UserIdentity>,
    Path((room_id, message_id)): Path<(Uuid, Uuid)>,
) -> ApiResult<impl IntoResponse> {
    state
        .hub
        .messages()
        .delete_in_room(room_id, message_id, user.id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Run the HTTP server until interrupted.
pub async fn run_http_server(config: Config) -> Result<()> {
    let addr: SocketAddr = config.bind.parse()?;
    let state = AppState::new(config).await?;
    info!(%addr, "chat server listening");
    axum::Server::bind(&addr)
        .serve(build_router(state).into_make_service())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;
    Ok(())
}
