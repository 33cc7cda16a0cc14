use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        DefaultBodyLimit, Query, Request, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use event_hub::{connection_stream, scope_current_user, EventHub, Mailbox};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use server_api::{
    acting_user, create_folder, delete_files, delete_folders, files_by_keys,
    handle_upload_callback, initiate_upload, list_files, list_folders, move_files,
    spawn_reconciler, ApiContext, HttpUploadProvider, PendingUploadStore,
};
use shared::{
    domain::{ConnectionId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{
        CreateFolderRequest, DeleteFilesRequest, DeleteFoldersRequest, FilesByKeysRequest, Folder,
        InitiateUploadRequest, InitiateUploadResponse, ListFilesResponse, MoveFilesRequest,
        UploadedFile, CALLBACK_HOOK_HEADER, CALLBACK_SIGNATURE_HEADER,
    },
};
use storage::Storage;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_REQUEST_BODY_BYTES: usize = 256 * 1024;
const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_CONNECTION_ID_LEN: usize = 128;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct UserQuery {
    user_id: i64,
}

#[derive(Debug, Default, Deserialize)]
struct EventsQuery {
    connection_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListFilesQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings()?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;
    let api = ApiContext {
        storage,
        hub: EventHub::new(),
        pending: PendingUploadStore::new(),
        provider: Arc::new(HttpUploadProvider::new(
            settings.upload_api_url.clone(),
            settings.upload_file_url_base.clone(),
            settings.upload_api_key.clone(),
        )),
        callback_secret: settings.upload_api_key.clone(),
        api_url: settings.api_url.clone(),
    };

    let reconciler = spawn_reconciler(api.clone(), settings.reconcile_config());
    let state = AppState {
        api,
        hub_config: settings.hub_config(),
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(error) = tokio::signal::ctrl_c().await {
                warn!(%error, "failed to listen for shutdown signal");
            }
        })
        .await?;
    reconciler.abort();
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    let user_routes = Router::new()
        .route("/files", get(http_list_files))
        .route("/files/initiate", post(http_initiate_upload))
        .route("/files/by_keys", post(http_files_by_keys))
        .route("/files/delete", post(http_delete_files))
        .route("/files/move", post(http_move_files))
        .route("/folders", get(http_list_folders).post(http_create_folder))
        .route("/folders/delete", post(http_delete_folders))
        .route("/events", get(ws_handler))
        .route_layer(middleware::from_fn(scope_user));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/upload_callback", post(http_upload_callback))
        .merge(user_routes)
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}

/// Runs the rest of the request with `user_id` from the query as the acting user.
async fn scope_user(request: Request, next: Next) -> Response {
    let Ok(Query(q)) = Query::<UserQuery>::try_from_uri(request.uri()) else {
        return reject(ApiError::new(
            ErrorCode::Unauthorized,
            "user_id query parameter is required",
        ))
        .into_response();
    };
    scope_current_user(UserId(q.user_id), next.run(request)).await
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        ErrorCode::Upstream => StatusCode::BAD_GATEWAY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(err.code), Json(err))
}

async fn healthz(State(state): State<Arc<AppState>>) -> HttpResult<&'static str> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|e| reject(ApiError::internal(e.to_string())))?;
    Ok("ok")
}

async fn http_initiate_upload(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InitiateUploadRequest>,
) -> HttpResult<Json<InitiateUploadResponse>> {
    initiate_upload(&state.api, req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_files_by_keys(
    State(state): State<Arc<AppState>>,
    Json(req): Json<FilesByKeysRequest>,
) -> HttpResult<Json<Vec<Option<UploadedFile>>>> {
    files_by_keys(&state.api, &req.file_keys)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_list_files(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListFilesQuery>,
) -> HttpResult<Json<ListFilesResponse>> {
    list_files(
        &state.api,
        q.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        q.offset.unwrap_or(0),
    )
    .await
    .map(Json)
    .map_err(reject)
}

async fn http_list_folders(State(state): State<Arc<AppState>>) -> HttpResult<Json<Vec<Folder>>> {
    list_folders(&state.api).await.map(Json).map_err(reject)
}

async fn http_create_folder(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateFolderRequest>,
) -> HttpResult<Json<Folder>> {
    create_folder(&state.api, req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_delete_files(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteFilesRequest>,
) -> HttpResult<StatusCode> {
    delete_files(&state.api, req).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_folders(
    State(state): State<Arc<AppState>>,
    Json(req): Json<DeleteFoldersRequest>,
) -> HttpResult<StatusCode> {
    delete_folders(&state.api, req).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_move_files(
    State(state): State<Arc<AppState>>,
    Json(req): Json<MoveFilesRequest>,
) -> HttpResult<StatusCode> {
    move_files(&state.api, req).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_upload_callback(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResult<Json<UploadedFile>> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    handle_upload_callback(
        &state.api,
        header(CALLBACK_HOOK_HEADER),
        header(CALLBACK_SIGNATURE_HEADER),
        &body,
    )
    .await
    .map(Json)
    .map_err(|e| reject(e.into()))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<EventsQuery>,
) -> HttpResult<impl IntoResponse> {
    // The upgraded socket runs outside the request scope, so resolve the user now.
    let user_id = acting_user().map_err(reject)?;
    let connection_id = connection_id_from(q.connection_id.as_deref());
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, user_id, connection_id)))
}

/// Client-chosen id when usable, otherwise a fresh random one.
fn connection_id_from(requested: Option<&str>) -> ConnectionId {
    match requested.map(str::trim) {
        Some(id) if !id.is_empty() && id.len() <= MAX_CONNECTION_ID_LEN => ConnectionId::from(id),
        _ => ConnectionId::random(),
    }
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: WebSocket,
    user_id: UserId,
    connection_id: ConnectionId,
) {
    let mailbox = Mailbox::with_capacity(state.hub_config.mailbox_capacity);
    state
        .api
        .hub
        .register_connection(user_id, connection_id.clone(), mailbox.clone())
        .await;
    info!(%user_id, %connection_id, "event stream opened");

    let (mut sender, mut receiver) = socket.split();
    let mut frames = connection_stream(mailbox.clone(), &state.hub_config);

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = frames.next().await {
            let text = match serde_json::to_string(&frame) {
                Ok(v) => v,
                Err(error) => {
                    warn!(%error, "dropping unserializable frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let recv = async {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    };

    tokio::select! {
        _ = &mut send_task => debug!(%connection_id, "event stream ended by server"),
        _ = recv => debug!(%connection_id, "event stream closed by client"),
    }
    send_task.abort();

    state
        .api
        .hub
        .unregister_mailbox(user_id, &connection_id, &mailbox)
        .await;
    info!(%user_id, %connection_id, "event stream closed");
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
