//! 本地 intake 服务
//!
//! 仅回环地址（127.0.0.1:37780），接收辅助采集端（浏览器扩展）推送的
//! 会话。鉴权用身份协作方签发的 PAT；OPTIONS 预检放行扩展来源。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthService;
use crate::config::INTAKE_PORT;
use crate::db::LocalStore;
use crate::types::{ConversationMessage, ConversationSession, Source};

/// CORS 头（浏览器扩展来源）
const CORS_HEADERS: [(&str, &str); 2] = [
    ("Access-Control-Allow-Origin", "chrome-extension://*"),
    ("Access-Control-Allow-Headers", "Authorization, Content-Type"),
];

/// intake 共享状态
pub struct IntakeState {
    pub store: Arc<LocalStore>,
    pub auth: Arc<AuthService>,
}

/// 推送的会话
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConversation {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub messages: Vec<IntakeMessage>,
}

/// 推送的消息
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeMessage {
    #[allow(dead_code)]
    pub uuid: String,
    pub sender: String,
    #[serde(default)]
    pub text: String,
    pub created_at: String,
}

#[derive(Debug, Deserialize)]
pub struct IntakePayload {
    #[serde(default)]
    pub conversations: Vec<IntakeConversation>,
}

/// 构建路由
pub fn router(state: Arc<IntakeState>) -> Router {
    Router::new()
        .route(
            "/api/sync/conversations",
            post(sync_conversations).options(preflight),
        )
        .route("/auth/callback", get(auth_callback).options(preflight))
        .fallback(fallback)
        .with_state(state)
}

/// 运行 intake 服务直到取消
pub async fn run(state: Arc<IntakeState>, cancel: CancellationToken) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], INTAKE_PORT));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("🌐 intake 监听: http://{}", addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;

    tracing::info!("intake 服务退出");
    Ok(())
}

/// OPTIONS 预检：204 + 扩展来源 CORS
async fn preflight() -> impl IntoResponse {
    (StatusCode::NO_CONTENT, CORS_HEADERS)
}

/// 未匹配路径：OPTIONS 同样放行预检，其余 404
async fn fallback(method: Method) -> Response {
    if method == Method::OPTIONS {
        (StatusCode::NO_CONTENT, CORS_HEADERS).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "not found" })),
        )
            .into_response()
    }
}

/// POST /api/sync/conversations
async fn sync_conversations(
    State(state): State<Arc<IntakeState>>,
    headers: HeaderMap,
    Json(payload): Json<IntakePayload>,
) -> Response {
    // Bearer 必须等于身份协作方持有的 PAT
    let authorized = match (bearer_token(&headers), state.auth.pat().await) {
        (Some(bearer), Some(pat)) => bearer == pat,
        _ => false,
    };

    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response();
    }

    let store = state.store.clone();
    let result = tokio::task::spawn_blocking(move || ingest_conversations(&store, payload))
        .await
        .unwrap_or(0);

    Json(json!({ "synced": result })).into_response()
}

/// 会话入库；单条失败只记日志
fn ingest_conversations(store: &LocalStore, payload: IntakePayload) -> usize {
    let mut synced = 0;

    for convo in payload.conversations {
        let mut session = ConversationSession::new(
            Source::ChatGpt,
            convo.uuid.clone(),
            convo.name.clone(),
            convo.created_at.clone(),
            convo.updated_at.clone(),
            convo.messages.len(),
        );

        if let Err(e) = store.upsert_session(&mut session) {
            tracing::warn!("intake 会话写入失败 {}: {}", convo.uuid, e);
            continue;
        }

        let messages: Vec<ConversationMessage> = convo
            .messages
            .iter()
            .map(|m| ConversationMessage {
                id: 0,
                session_id: session.id,
                role: if m.sender == "human" || m.sender == "user" {
                    "user".to_string()
                } else {
                    "assistant".to_string()
                },
                content: m.text.clone(),
                created_at: m.created_at.clone(),
                token_count: None,
            })
            .collect();

        if let Err(e) = store.upsert_messages(&messages) {
            tracing::warn!("intake 消息写入失败 {}: {}", convo.uuid, e);
            continue;
        }

        synced += 1;
    }

    synced
}

/// GET /auth/callback?refresh=…&access=…
async fn auth_callback(
    State(state): State<Arc<IntakeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Html<&'static str> {
    match (params.get("refresh"), params.get("access")) {
        (Some(refresh), Some(access)) => {
            state.auth.handle_auth_callback(refresh, access).await;
            Html(
                "<html><body><h3>登录成功</h3><p>可以关闭此页面了。</p></body></html>",
            )
        }
        _ => Html("<html><body><h3>登录失败</h3><p>回调参数缺失。</p></body></html>"),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
}
