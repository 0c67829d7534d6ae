//! Admin HTTP API.
//!
//! Read-only endpoints are open. Moderation and blacklist endpoints need
//! `Authorization: Bearer <CROSSWIRE_ADMIN_TOKEN>` and are refused outright
//! when no token is configured.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crosswire_shared::constants::SERVER_ID;
use crosswire_shared::protocol::MemberInfo;
use crosswire_shared::types::Role;
use crosswire_store::{Member, Restriction};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::server::{Server, ServerStats};

#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Server>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/stats", get(stats))
        .route("/members", get(members))
        .route("/members/:id/mute", post(mute))
        .route("/members/:id/unmute", post(unmute))
        .route("/members/:id/ban", post(ban))
        .route("/members/:id/unban", post(unban))
        .route("/members/:id/kick", post(kick))
        .route("/members/:id/role", post(set_role))
        .route("/blacklist", get(blacklist).post(add_blacklist_word))
        .route("/blacklist/:word", delete(remove_blacklist_word))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    channel_id: String,
}

#[derive(Serialize)]
struct MemberView {
    #[serde(flatten)]
    info: MemberInfo,
    muted: bool,
    banned: bool,
}

#[derive(Serialize)]
struct OkResponse {
    ok: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RestrictRequest {
    #[serde(default)]
    reason: String,
    /// Omitted means until lifted.
    duration_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct KickRequest {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct RoleRequest {
    role: Role,
}

#[derive(Debug, Deserialize)]
struct BlacklistRequest {
    word: String,
}

#[derive(Serialize)]
struct BlacklistResponse {
    words: Vec<String>,
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        channel_id: state.server.channel().channel_id().await,
    })
}

async fn stats(State(state): State<AppState>) -> Json<ServerStats> {
    Json(state.server.stats().await)
}

async fn members(State(state): State<AppState>) -> Json<Vec<MemberView>> {
    let channel = state.server.channel();
    let mut views = Vec::new();
    for member in channel.members().await {
        if member.id == SERVER_ID {
            continue;
        }
        let (muted, banned) = match channel.restriction(&member.id).await {
            Some(r) => (true, r.is_ban()),
            None => (false, false),
        };
        views.push(MemberView {
            info: member.info(),
            muted,
            banned,
        });
    }
    views.sort_by(|a, b| a.info.id.cmp(&b.info.id));
    Json(views)
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "admin API is disabled (no CROSSWIRE_ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("invalid admin token".into()));
    }
    Ok(())
}

fn reason_or(reason: String, fallback: &str) -> String {
    if reason.trim().is_empty() {
        fallback.to_string()
    } else {
        reason
    }
}

async fn mute(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RestrictRequest>>,
) -> Result<Json<Restriction>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let restriction = state
        .server
        .mute(&id, req.duration_secs.map(Duration::from_secs), &reason_or(req.reason, "muted by admin"))
        .await?;
    info!(member = %id, "admin muted member");
    Ok(Json(restriction))
}

async fn unmute(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    state.server.unmute(&id).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn ban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<RestrictRequest>>,
) -> Result<Json<Restriction>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let restriction = state
        .server
        .ban(
            &id,
            &reason_or(req.reason, "banned by admin"),
            SERVER_ID,
            req.duration_secs.map(Duration::from_secs),
        )
        .await?;
    info!(member = %id, "admin banned member");
    Ok(Json(restriction))
}

async fn unban(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OkResponse>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    state.server.unban(&id).await?;
    Ok(Json(OkResponse { ok: true }))
}

async fn kick(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<KickRequest>>,
) -> Result<Json<MemberInfo>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let member: Member = state
        .server
        .kick(&id, &reason_or(req.reason, "kicked by admin"), SERVER_ID)
        .await?;
    info!(member = %id, "admin kicked member");
    Ok(Json(member.info()))
}

async fn set_role(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RoleRequest>,
) -> Result<Json<MemberInfo>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    let member = state.server.set_role(&id, req.role).await?;
    Ok(Json(member.info()))
}

async fn blacklist(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<Json<BlacklistResponse>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    Ok(Json(BlacklistResponse {
        words: state.server.spam().blacklist_words().await,
    }))
}

async fn add_blacklist_word(
    headers: HeaderMap,
    State(state): State<AppState>,
    Json(req): Json<BlacklistRequest>,
) -> Result<Json<BlacklistResponse>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    let word = req.word.trim();
    if word.is_empty() {
        return Err(ServerError::BadRequest("word must not be empty".into()));
    }
    let spam = state.server.spam();
    spam.add_blacklist_word(word).await;
    Ok(Json(BlacklistResponse {
        words: spam.blacklist_words().await,
    }))
}

async fn remove_blacklist_word(
    headers: HeaderMap,
    State(state): State<AppState>,
    Path(word): Path<String>,
) -> Result<Json<BlacklistResponse>, ServerError> {
    verify_admin_token(&headers, state.server.config())?;
    let spam = state.server.spam();
    if !spam.remove_blacklist_word(&word).await {
        return Err(ServerError::NotFound(format!("{word:?} is not blacklisted")));
    }
    Ok(Json(BlacklistResponse {
        words: spam.blacklist_words().await,
    }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "starting admin API");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use crosswire_store::Database;

    use super::*;
    use crate::channel::tests::test_config;
    use crate::testing::RecordingTransport;

    const TOKEN: &str = "s3cret";

    async fn app() -> (Router, Arc<Server>) {
        let mut config = test_config();
        config.admin_token = Some(TOKEN.into());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let server = Server::new(config, db, Arc::new(RecordingTransport::default()))
            .await
            .unwrap();
        let channel_id = server.channel().channel_id().await;
        server
            .channel()
            .add_member(Member::new("alice", &channel_id, "alice", Role::Member))
            .await
            .unwrap();
        (build_router(AppState { server: server.clone() }), server)
    }

    fn post_json(uri: &str, token: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut req = Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(token) = token {
            req = req.header("authorization", format!("Bearer {token}"));
        }
        req.body(Body::from(body.to_string())).unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_and_members_are_open() {
        let (app, _server) = app().await;

        let resp = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["channel_id"], test_config().channel_id);

        let resp = app
            .oneshot(Request::get("/members").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let members = body_json(resp).await;
        assert_eq!(members.as_array().unwrap().len(), 1);
        assert_eq!(members[0]["id"], "alice");
        assert_eq!(members[0]["muted"], false);
    }

    #[tokio::test]
    async fn test_mutations_need_token() {
        let (app, server) = app().await;

        let resp = app
            .clone()
            .oneshot(post_json("/members/alice/mute", None, serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app
            .oneshot(post_json("/members/alice/mute", Some("wrong!"), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(!server.channel().is_muted("alice").await);
    }

    #[tokio::test]
    async fn test_mute_then_unmute() {
        let (app, server) = app().await;

        let resp = app
            .clone()
            .oneshot(post_json(
                "/members/alice/mute",
                Some(TOKEN),
                serde_json::json!({ "reason": "flood", "duration_secs": 60 }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(server.channel().is_muted("alice").await);

        let resp = app
            .oneshot(post_json("/members/alice/unmute", Some(TOKEN), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(!server.channel().is_muted("alice").await);
    }

    #[tokio::test]
    async fn test_kick_unknown_member_is_404() {
        let (app, _server) = app().await;
        let resp = app
            .oneshot(post_json("/members/nobody/kick", Some(TOKEN), serde_json::json!({})))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_role_change() {
        let (app, server) = app().await;
        let resp = app
            .oneshot(post_json(
                "/members/alice/role",
                Some(TOKEN),
                serde_json::json!({ "role": "moderator" }),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            server.channel().get_member("alice").await.unwrap().role,
            Role::Moderator
        );
    }

    #[tokio::test]
    async fn test_blacklist_add_and_remove() {
        let (app, server) = app().await;

        let resp = app
            .clone()
            .oneshot(post_json("/blacklist", Some(TOKEN), serde_json::json!({ "word": "casino" })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(server.spam().blacklist_words().await.contains(&"casino".to_string()));

        let delete = Request::delete("/blacklist/casino")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(delete).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let again = Request::delete("/blacklist/casino")
            .header("authorization", format!("Bearer {TOKEN}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(again).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
