//! HTTP and WebSocket surface.
//!
//! Every non-public route requires signed headers; the `/join` endpoint
//! verifies a signature carried in its query string before upgrading. All
//! JSON responses use the `{success, data}` / `{success, reason}` envelope.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{OriginalUri, Path, Query, State, WebSocketUpgrade};
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;

use refsync_sdk::identity::{Peer, PeerId};
use refsync_sdk::protocol::{ApiResponse, ErrorReason, Frame, FrameBody};

use crate::auth::{self, AuthedPeer, JoinParams};
use crate::export;
use crate::membership;
use crate::server::SharedState;

/// A well-formed refusal: the reason string plus optional detail, rendered
/// as the error envelope with a matching status code.
#[derive(Debug, Clone)]
pub struct Refusal {
    pub reason: ErrorReason,
    pub details: Option<String>,
}

impl Refusal {
    pub fn new(reason: ErrorReason, details: Option<String>) -> Self {
        Self { reason, details }
    }

    pub fn forbidden() -> Self {
        Self::new(ErrorReason::Forbidden, None)
    }

    pub fn bad_request(details: impl Into<String>) -> Self {
        Self::new(ErrorReason::BadRequest, Some(details.into()))
    }

    fn status(&self) -> StatusCode {
        match self.reason {
            ErrorReason::BadRequest => StatusCode::BAD_REQUEST,
            ErrorReason::BadSignature => StatusCode::UNAUTHORIZED,
            ErrorReason::IncorrectCode => StatusCode::NOT_FOUND,
            ErrorReason::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorReason::Stale => StatusCode::CONFLICT,
            ErrorReason::Forbidden => StatusCode::FORBIDDEN,
        }
    }
}

impl IntoResponse for Refusal {
    fn into_response(self) -> Response {
        let body: ApiResponse<serde_json::Value> =
            ApiResponse::error(self.reason, self.details.clone());
        (self.status(), Json(body)).into_response()
    }
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse::ok(data)).into_response()
}

/// Build the axum router.
pub fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/user", axum::routing::post(register_user))
        .route("/api/{sku}/create", axum::routing::post(create_instance))
        .route("/api/{sku}/invitation", get(get_invitation))
        .route("/api/{sku}/accept", axum::routing::put(accept_invitation))
        .route(
            "/api/{sku}/invite",
            axum::routing::put(invite_peer).delete(revoke_peer),
        )
        .route("/api/{sku}/request", axum::routing::put(request_code).get(resolve_code))
        .route(
            "/api/{sku}/incident",
            axum::routing::put(put_incident)
                .patch(patch_incident)
                .delete(delete_incident),
        )
        .route("/api/{sku}/get", get(get_snapshot))
        .route("/api/{sku}/csv", get(export_csv))
        .route("/api/{sku}/json", get(export_json))
        .route("/api/{sku}/join", get(join_socket))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Auth plumbing ──────────────────────────────────────────────────────

fn verify(
    state: &SharedState,
    method: &Method,
    uri: &OriginalUri,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<AuthedPeer, Refusal> {
    let path_and_query = uri.0.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let authed = auth::verify_headers(
        headers,
        method.as_str(),
        path_and_query,
        body,
        state.config.skew_secs,
        Utc::now(),
    )?;
    if !state.check_rate(authed.session) {
        return Err(Refusal::bad_request("rate limited"));
    }
    tracing::debug!(
        peer = %authed.peer,
        session = ?authed.session,
        method = %method,
        path = path_and_query,
        "verified request"
    );
    Ok(authed)
}

fn require_member(state: &SharedState, sku: &str, peer: &PeerId) -> Result<(), Refusal> {
    let admitted = state
        .with_db(|db| db.is_member(sku, peer))
        .map_err(|e| Refusal::new(ErrorReason::ServerError, Some(e.to_string())))?;
    if admitted { Ok(()) } else { Err(Refusal::forbidden()) }
}

fn require_admin(state: &SharedState, sku: &str, peer: &PeerId) -> Result<(), Refusal> {
    let admin = state
        .with_db(|db| db.is_admin(sku, peer))
        .map_err(|e| Refusal::new(ErrorReason::ServerError, Some(e.to_string())))?;
    if admin { Ok(()) } else { Err(Refusal::forbidden()) }
}

fn db_err(e: rusqlite::Error) -> Refusal {
    Refusal::new(ErrorReason::ServerError, Some(e.to_string()))
}

/// The caller's display name, if registered.
fn display_name(state: &SharedState, peer: &PeerId) -> String {
    state.with_db(|db| db.user_name(peer)).ok().flatten().unwrap_or_default()
}

// ── User registration ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RegisterUser {
    name: String,
}

async fn register_user(
    State(state): State<Arc<SharedState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    let req: RegisterUser =
        serde_json::from_slice(&body).map_err(|e| Refusal::bad_request(e.to_string()))?;
    state
        .with_db(|db| db.upsert_user(&authed.peer, &req.name))
        .map_err(db_err)?;
    Ok(ok(Peer { id: authed.peer, name: req.name }))
}

// ── Membership ─────────────────────────────────────────────────────────

async fn create_instance(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    Ok(ok(membership::create_instance(&state, &sku, &authed.peer)?))
}

async fn get_invitation(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    Ok(ok(membership::read_invitation(&state, &sku, &authed.peer)?))
}

#[derive(Debug, Deserialize)]
struct AcceptQuery {
    invitation: String,
}

async fn accept_invitation(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    Query(q): Query<AcceptQuery>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    Ok(ok(membership::accept_invitation(&state, &sku, &authed.peer, &q.invitation)?))
}

#[derive(Debug, Deserialize)]
struct InviteQuery {
    user: String,
    #[serde(default)]
    admin: Option<String>,
}

async fn invite_peer(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    Query(q): Query<InviteQuery>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    require_admin(&state, &sku, &authed.peer)?;

    let target = PeerId::from_encoded(q.user);
    let admin = matches!(q.admin.as_deref(), Some("1") | Some("true"));
    Ok(ok(membership::invite(&state, &sku, &authed.peer, target, admin)?))
}

async fn revoke_peer(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    Query(q): Query<InviteQuery>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    let target = PeerId::from_encoded(q.user);

    // Admins can remove anyone; everyone can remove themselves.
    if target != authed.peer {
        require_admin(&state, &sku, &authed.peer)?;
    }
    let removed = membership::revoke(&state, &sku, &authed.peer, &target).await?;
    Ok(ok(serde_json::json!({ "removed": removed })))
}

async fn request_code(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    Ok(ok(membership::issue_code(&state, &sku, &authed.peer)))
}

#[derive(Debug, Deserialize)]
struct CodeQuery {
    code: String,
}

async fn resolve_code(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    Query(q): Query<CodeQuery>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    require_admin(&state, &sku, &authed.peer)?;
    let peer = membership::resolve_code(&state, &sku, &q.code)
        .ok_or_else(|| Refusal::new(ErrorReason::IncorrectCode, None))?;
    Ok(ok(peer))
}

// ── Incidents ──────────────────────────────────────────────────────────

async fn put_incident(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    require_member(&state, &sku, &authed.peer)?;
    let envelope = serde_json::from_slice(&body)
        .map_err(|e| Refusal::bad_request(format!("bad incident envelope: {e}")))?;

    let instance = state.instance(&sku).ok_or_else(Refusal::forbidden)?;
    let origin = Peer { id: authed.peer.clone(), name: display_name(&state, &authed.peer) };
    instance.add_incident(&origin, envelope).await?;
    Ok(ok(serde_json::Value::Null))
}

async fn patch_incident(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    require_member(&state, &sku, &authed.peer)?;
    let envelope = serde_json::from_slice(&body)
        .map_err(|e| Refusal::bad_request(format!("bad incident envelope: {e}")))?;

    let instance = state.instance(&sku).ok_or_else(Refusal::forbidden)?;
    let origin = Peer { id: authed.peer.clone(), name: display_name(&state, &authed.peer) };
    instance.update_incident(&origin, envelope).await?;
    Ok(ok(serde_json::Value::Null))
}

#[derive(Debug, Deserialize)]
struct DeleteQuery {
    id: String,
}

async fn delete_incident(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    Query(q): Query<DeleteQuery>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    require_member(&state, &sku, &authed.peer)?;

    let instance = state.instance(&sku).ok_or_else(Refusal::forbidden)?;
    let origin = Peer { id: authed.peer.clone(), name: display_name(&state, &authed.peer) };
    instance.remove_incident(&origin, &q.id).await?;
    Ok(ok(serde_json::Value::Null))
}

// ── Snapshot & exports ─────────────────────────────────────────────────

async fn get_snapshot(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    require_member(&state, &sku, &authed.peer)?;
    let instance = state.instance(&sku).ok_or_else(Refusal::forbidden)?;
    Ok(ok(instance.snapshot().await?))
}

async fn export_csv(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    require_member(&state, &sku, &authed.peer)?;
    let instance = state.instance(&sku).ok_or_else(Refusal::forbidden)?;
    let info = instance.snapshot().await?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        export::csv(&info),
    )
        .into_response())
}

async fn export_json(
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, Refusal> {
    let authed = verify(&state, &method, &uri, &headers, &body)?;
    require_member(&state, &sku, &authed.peer)?;
    let instance = state.instance(&sku).ok_or_else(Refusal::forbidden)?;
    let info = instance.snapshot().await?;
    Ok(ok(export::json(&info)))
}

// ── WebSocket ──────────────────────────────────────────────────────────

async fn join_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<SharedState>>,
    Path(sku): Path<String>,
    Query(params): Query<JoinParams>,
    uri: OriginalUri,
) -> Response {
    let path_and_query = uri.0.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let peer =
        match auth::verify_join(&params, path_and_query, state.config.skew_secs, Utc::now()) {
            Ok(peer) => peer,
            Err(refusal) => return refusal.into_response(),
        };
    if let Err(refusal) = require_member(&state, &sku, &peer.id) {
        return refusal.into_response();
    }
    if state.instance(&sku).is_none() {
        return Refusal::forbidden().into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, sku, peer))
        .into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<SharedState>, sku: String, peer: Peer) {
    let Some(instance) = state.instance(&sku) else {
        return;
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(256);

    // Writer task: everything the instance broadcasts to this session.
    let write_peer = peer.id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                tracing::debug!(peer = %write_peer, "socket write error: {e}");
                break;
            }
        }
        let _ = ws_tx.send(WsMessage::Close(None)).await;
    });

    let socket_id = match instance.join(peer.clone(), tx).await {
        Ok(id) => id,
        Err(refusal) => {
            tracing::warn!(peer = %peer.id, reason = ?refusal.reason, "join failed");
            writer.abort();
            return;
        }
    };
    tracing::info!(sku, peer = %peer.id, name = %peer.name, "socket joined");

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(WsMessage::Text(text)) => {
                let frame: Frame = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        // Malformed frames are dropped, not fatal.
                        tracing::warn!(peer = %peer.id, error = %e, "dropping malformed frame");
                        continue;
                    }
                };
                dispatch_frame(&instance, &peer, frame.body).await;
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            // Ping/Pong are answered by the protocol layer.
            Ok(_) => {}
        }
    }

    instance.leave(socket_id).await;
    tracing::info!(sku, peer = %peer.id, "socket left");
}

/// Apply one inbound frame. Refusals on the socket path are silent: the
/// frame is dropped, nothing is echoed, and the next snapshot reconverges
/// the peer.
async fn dispatch_frame(instance: &crate::instance::Instance, peer: &Peer, body: FrameBody) {
    let result = match body {
        FrameBody::AddIncident { incident } => instance.add_incident(peer, incident).await,
        FrameBody::UpdateIncident { incident } => instance.update_incident(peer, incident).await,
        FrameBody::RemoveIncident { id } => instance.remove_incident(peer, &id).await,
        FrameBody::ScratchpadUpdate { id, scratchpad } => {
            instance.scratchpad_update(peer, &id, scratchpad).await
        }
        FrameBody::Message { message } => {
            instance.relay_message(peer, message).await;
            Ok(())
        }
        // Server-originated frame types are not accepted from peers.
        _ => Ok(()),
    };
    if let Err(refusal) = result {
        tracing::debug!(peer = %peer.id, reason = ?refusal.reason, "frame refused");
    }
}
