use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{Path, Query, State, WebSocketUpgrade},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{
    create_bookmark, delete_bookmark, list_bookmarks, session_principal, sign_in, sign_out,
    ApiContext,
};
use shared::{
    domain::{Bookmark, BookmarkId, Principal},
    error::{ApiError, ErrorCode},
    protocol::{ChangeEvent, CreateBookmarkRequest, EventMask, LoginRequest, SessionResponse},
};
use storage::Storage;
use tokio::sync::broadcast;
use tracing::{error, info};

mod config;

use config::{load_settings, prepare_database_url};

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    events: broadcast::Sender<ChangeEvent>,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: String,
    events: Option<String>,
}

type ErrorReply = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|err| {
        error!(
            %database_url,
            error = %err,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        err
    })?;
    let api = ApiContext { storage };
    let (events, _) = broadcast::channel(256);

    let state = AppState { api, events };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/login", post(http_login))
        .route("/auth/session", get(http_session))
        .route("/auth/logout", post(http_logout))
        .route("/bookmarks", get(http_list_bookmarks))
        .route("/bookmarks", post(http_create_bookmark))
        .route("/bookmarks/:id", delete(http_delete_bookmark))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn error_reply(err: ApiError) -> ErrorReply {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, ErrorReply> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or_else(|| {
            error_reply(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer token",
            ))
        })
}

async fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Principal, ErrorReply> {
    let token = bearer_token(headers)?;
    session_principal(&state.api, token).await.map_err(error_reply)
}

async fn http_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, ErrorReply> {
    let session = sign_in(&state.api, &req.email).await.map_err(error_reply)?;
    info!(user = %session.principal.user_id, "session opened");
    Ok(Json(session))
}

async fn http_session(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Principal>, ErrorReply> {
    let principal = authenticate(&state, &headers).await?;
    Ok(Json(principal))
}

async fn http_logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ErrorReply> {
    let token = bearer_token(&headers)?;
    sign_out(&state.api, token).await.map_err(error_reply)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_bookmarks(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Bookmark>>, ErrorReply> {
    authenticate(&state, &headers).await?;
    let bookmarks = list_bookmarks(&state.api).await.map_err(error_reply)?;
    Ok(Json(bookmarks))
}

async fn http_create_bookmark(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateBookmarkRequest>,
) -> Result<(StatusCode, Json<Bookmark>), ErrorReply> {
    let principal = authenticate(&state, &headers).await?;
    let (bookmark, event) = create_bookmark(&state.api, principal.user_id, &req)
        .await
        .map_err(error_reply)?;
    let _ = state.events.send(event);
    Ok((StatusCode::CREATED, Json(bookmark)))
}

async fn http_delete_bookmark(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<StatusCode, ErrorReply> {
    authenticate(&state, &headers).await?;
    if let Some(event) = delete_bookmark(&state.api, BookmarkId(id))
        .await
        .map_err(error_reply)?
    {
        let _ = state.events.send(event);
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(q): Query<WsQuery>,
) -> Result<impl IntoResponse, ErrorReply> {
    // The browser websocket API cannot set headers, so the upgrade carries
    // the token in the query string instead.
    session_principal(&state.api, &q.token)
        .await
        .map_err(error_reply)?;
    let mask = EventMask::from_param(q.events.as_deref().unwrap_or(""));
    Ok(ws.on_upgrade(move |socket| ws_connection(state, socket, mask)))
}

async fn ws_connection(
    state: Arc<AppState>,
    socket: axum::extract::ws::WebSocket,
    mask: EventMask,
) {
    use axum::extract::ws::Message;
    use futures::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut events_rx = state.events.subscribe();

    let send_task = tokio::spawn(async move {
        while let Ok(event) = events_rx.recv().await {
            if !mask.allows(event.kind()) {
                continue;
            }
            let text = match serde_json::to_string(&event) {
                Ok(v) => v,
                Err(_) => continue,
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(_msg)) = receiver.next().await {}

    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use client_core::{
        remote::RemoteBackend, BookmarkStore, ChangeFeed, LiveBookmarkStore, NewBookmark,
        SessionService, StoreEvent,
    };
    use tower::ServiceExt;

    async fn test_state() -> Arc<AppState> {
        let storage = Storage::new("sqlite::memory:").await.expect("db");
        let api = ApiContext { storage };
        let (events, _) = broadcast::channel(32);
        Arc::new(AppState { api, events })
    }

    async fn login(app: &Router, email: &str) -> String {
        let request = Request::post("/auth/login")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(format!("{{\"email\":\"{email}\"}}")))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let session: SessionResponse = serde_json::from_slice(&bytes).expect("session json");
        session.token
    }

    #[tokio::test]
    async fn bookmark_routes_require_a_session() {
        let app = build_router(test_state().await);
        let request = Request::get("/bookmarks")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn create_rejects_relative_urls() {
        let app = build_router(test_state().await);
        let token = login(&app, "alice@example.com").await;

        let request = Request::post("/bookmarks")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from(r#"{"title":"docs","url":"not/absolute"}"#))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn create_list_and_idempotent_delete() {
        let app = build_router(test_state().await);
        let token = login(&app, "alice@example.com").await;

        let request = Request::post("/bookmarks")
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::from(
                r#"{"title":"docs","url":"https://docs.example"}"#,
            ))
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let created: Bookmark = serde_json::from_slice(&bytes).expect("bookmark json");

        let request = Request::get("/bookmarks")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let listed: Vec<Bookmark> = serde_json::from_slice(&bytes).expect("list json");
        assert_eq!(listed, vec![created.clone()]);

        for _ in 0..2 {
            let request = Request::delete(format!("/bookmarks/{}", created.id))
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .expect("request");
            let response = app.clone().oneshot(request).await.expect("response");
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }
    }

    #[tokio::test]
    async fn logout_revokes_the_session() {
        let app = build_router(test_state().await);
        let token = login(&app, "alice@example.com").await;

        let request = Request::post("/auth/logout")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let request = Request::get("/auth/session")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    async fn spawn_server() -> SocketAddr {
        let app = build_router(test_state().await);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        addr
    }

    #[tokio::test]
    async fn websocket_upgrade_rejects_bad_tokens() {
        let addr = spawn_server().await;
        let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=bogus")).await;
        match result {
            Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
                assert_eq!(response.status(), StatusCode::UNAUTHORIZED)
            }
            other => panic!("expected http rejection, got {other:?}"),
        }
    }

    /// End to end: one session's mutations show up live in another session's
    /// reconciled store over a real socket.
    #[tokio::test]
    async fn live_change_feed_propagates_across_sessions() {
        let addr = spawn_server().await;
        let url = format!("http://{addr}");

        let alice = RemoteBackend::new(&url).expect("backend");
        alice.sign_in("alice@example.com").await.expect("sign in");
        let store = LiveBookmarkStore::connect(
            Arc::clone(&alice) as Arc<dyn SessionService>,
            Arc::clone(&alice) as Arc<dyn BookmarkStore>,
            Arc::clone(&alice) as Arc<dyn ChangeFeed>,
        )
        .await
        .expect("connect store");
        store.load_all().await.expect("initial load");
        let mut events = store.subscribe();

        let bob = RemoteBackend::new(&url).expect("backend");
        bob.sign_in("bob@example.com").await.expect("sign in");
        let created = bob
            .insert(NewBookmark {
                title: "shared".to_string(),
                url: "https://shared.example".to_string(),
            })
            .await
            .expect("create");

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("insert timeout")
            .expect("event stream");
        match event {
            StoreEvent::Inserted(bookmark) => assert_eq!(bookmark.id, created.id),
            other => panic!("unexpected event: {other:?}"),
        }

        bob.delete(created.id).await.expect("delete");
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("delete timeout")
            .expect("event stream");
        match event {
            StoreEvent::Removed(id) => assert_eq!(id, created.id),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(store.snapshot().await.is_empty());

        store.shutdown().await;
        alice.sign_out().await.expect("sign out");
    }
}
