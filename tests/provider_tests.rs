//! 会话提供方客户端集成测试
//!
//! 用本地 axum 服务顶替提供方 API；cookie 经由明文 Cookie 库 fixture 提供。

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration, Utc};
use serde_json::json;
use ses_daemon::dispatch::ConversationSyncer;
use ses_daemon::ingest::CookieExtractor;
use ses_daemon::remote::{ProviderClient, RemoteError};
use ses_daemon::types::Source;
use ses_daemon::LocalStore;
use tempfile::TempDir;

/// 明文 cookie 库 fixture
fn cookie_fixture(dir: &std::path::Path) -> CookieExtractor {
    let db_path = dir.join("Cookies");
    let conn = rusqlite::Connection::open(&db_path).unwrap();
    conn.execute_batch(
        r#"
        CREATE TABLE cookies (host_key TEXT, name TEXT, value TEXT, encrypted_value BLOB);
        INSERT INTO cookies VALUES ('.claude.ai', 'sessionKey', 'cookie-value-0123456789', X'');
        "#,
    )
    .unwrap();
    CookieExtractor::with_db_path(db_path)
}

#[derive(Clone)]
struct MockProvider {
    conversations: Arc<Vec<serde_json::Value>>,
    list_calls: Arc<AtomicUsize>,
    seen_headers: Arc<parking_lot::Mutex<Vec<(Option<String>, Option<String>)>>>,
}

fn conversation(uuid: &str, updated_at: &str) -> serde_json::Value {
    json!({
        "uuid": uuid,
        "name": format!("conversation {}", uuid),
        "created_at": "2026-01-01T00:00:00Z",
        "updated_at": updated_at,
        "chat_messages": [
            {"uuid": format!("{}-m1", uuid), "sender": "human", "text": "question", "created_at": "2026-01-01T00:00:00Z"},
            {"uuid": format!("{}-m2", uuid), "sender": "assistant", "text": "answer", "created_at": "2026-01-01T00:00:01Z"}
        ]
    })
}

async fn spawn_provider(conversations: Vec<serde_json::Value>) -> (String, MockProvider) {
    let mock = MockProvider {
        conversations: Arc::new(conversations),
        list_calls: Arc::new(AtomicUsize::new(0)),
        seen_headers: Arc::new(parking_lot::Mutex::new(Vec::new())),
    };

    async fn orgs(State(mock): State<MockProvider>, headers: HeaderMap) -> Json<serde_json::Value> {
        mock.seen_headers.lock().push((
            headers
                .get("Cookie")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
            headers
                .get("X-Session-Key")
                .and_then(|v| v.to_str().ok())
                .map(String::from),
        ));
        Json(json!([{ "uuid": "org-1", "name": "workspace" }]))
    }

    async fn listing(
        State(mock): State<MockProvider>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<serde_json::Value> {
        mock.list_calls.fetch_add(1, Ordering::SeqCst);
        let offset: usize = params
            .get("offset")
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let limit: usize = params
            .get("limit")
            .and_then(|s| s.parse().ok())
            .unwrap_or(50);

        let page: Vec<serde_json::Value> = mock
            .conversations
            .iter()
            .skip(offset)
            .take(limit)
            .map(|c| {
                json!({
                    "uuid": c["uuid"],
                    "name": c["name"],
                    "created_at": c["created_at"],
                    "updated_at": c["updated_at"],
                })
            })
            .collect();
        Json(json!(page))
    }

    async fn detail(
        State(mock): State<MockProvider>,
        Path((_org, uuid)): Path<(String, String)>,
    ) -> Json<serde_json::Value> {
        let convo = mock
            .conversations
            .iter()
            .find(|c| c["uuid"] == uuid.as_str())
            .cloned()
            .unwrap_or(json!({}));
        Json(convo)
    }

    let router = Router::new()
        .route("/api/organizations", get(orgs))
        .route("/api/organizations/:org/chat_conversations", get(listing))
        .route(
            "/api/organizations/:org/chat_conversations/:uuid",
            get(detail),
        )
        .with_state(mock.clone());

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    (format!("http://{}", addr), mock)
}

#[tokio::test]
async fn test_bulk_sync_fetches_everything() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(LocalStore::connect(tmp.path().join("local.db")).unwrap());
    let cookies = Arc::new(cookie_fixture(tmp.path()));

    let now = Utc::now().to_rfc3339();
    let (base_url, mock) = spawn_provider(vec![
        conversation("conv-a", &now),
        conversation("conv-b", &now),
    ])
    .await;

    let client = ProviderClient::with_base_url(store.clone(), cookies, base_url);
    let synced = client.sync_bulk().await.unwrap();
    assert_eq!(synced, 2);

    // 短页即停：只请求了一页
    assert_eq!(mock.list_calls.load(Ordering::SeqCst), 1);

    let session = store
        .get_session(Source::ClaudeChat, "conv-a")
        .unwrap()
        .unwrap();
    assert_eq!(session.title, "conversation conv-a");

    let messages = store.get_messages(session.id).unwrap();
    assert_eq!(messages.len(), 2);
    // human → user，其余 → assistant
    assert_eq!(messages[0].role, "user");
    assert_eq!(messages[1].role, "assistant");

    // cookie 同时挂在两个头名下
    let headers = mock.seen_headers.lock();
    let (cookie, session_key) = headers.first().cloned().unwrap();
    assert_eq!(cookie.as_deref(), Some("sessionKey=cookie-value-0123456789"));
    assert_eq!(session_key.as_deref(), Some("cookie-value-0123456789"));
}

#[tokio::test]
async fn test_targeted_sync_fetches_exact_set() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(LocalStore::connect(tmp.path().join("local.db")).unwrap());
    let cookies = Arc::new(cookie_fixture(tmp.path()));

    let now = Utc::now().to_rfc3339();
    let (base_url, mock) = spawn_provider(vec![
        conversation("conv-a", &now),
        conversation("conv-b", &now),
        conversation("conv-c", &now),
    ])
    .await;

    let client = ProviderClient::with_base_url(store.clone(), cookies, base_url);
    let synced = client
        .sync_targeted(&["conv-b".to_string()])
        .await
        .unwrap();
    assert_eq!(synced, 1);

    // targeted 不碰分页列表
    assert_eq!(mock.list_calls.load(Ordering::SeqCst), 0);
    assert!(store.get_session(Source::ClaudeChat, "conv-a").unwrap().is_none());
    assert!(store.get_session(Source::ClaudeChat, "conv-b").unwrap().is_some());
}

#[tokio::test]
async fn test_incremental_stops_at_cutoff() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(LocalStore::connect(tmp.path().join("local.db")).unwrap());
    let cookies = Arc::new(cookie_fixture(tmp.path()));

    let fresh = Utc::now().to_rfc3339();
    let stale = (Utc::now() - Duration::hours(48)).to_rfc3339();
    // 列表按更新时间降序（提供方语义）
    let (base_url, _mock) = spawn_provider(vec![
        conversation("conv-fresh", &fresh),
        conversation("conv-stale", &stale),
    ])
    .await;

    let client = ProviderClient::with_base_url(store.clone(), cookies, base_url);
    let synced = client.sync_incremental().await.unwrap();
    assert_eq!(synced, 1);

    assert!(store
        .get_session(Source::ClaudeChat, "conv-fresh")
        .unwrap()
        .is_some());
    // 第一条早于 cutoff 的元数据处停止
    assert!(store
        .get_session(Source::ClaudeChat, "conv-stale")
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_missing_cookie_is_auth_missing() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(LocalStore::connect(tmp.path().join("local.db")).unwrap());
    // 指向不存在的 Cookie 库
    let cookies = Arc::new(CookieExtractor::with_db_path(
        tmp.path().join("no-such-Cookies"),
    ));

    let client =
        ProviderClient::with_base_url(store, cookies, "http://127.0.0.1:1".to_string());
    let result = client.sync_bulk().await;
    assert!(matches!(result, Err(RemoteError::AuthMissing)));
}
