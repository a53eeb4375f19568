//! 会话提供方 API 客户端
//!
//! 针对分页 JSON 接口的薄 HTTPS 客户端，三种同步模式：
//! - bulk：遍历全部会话
//! - targeted：按给定 UUID 列表精确拉取
//! - incremental：按更新时间截断的分页遍历（默认 24 小时）
//!
//! 全部请求受 5 req/s 限速：5 个许可的信号量，许可在获取 1 秒后归还。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{OnceCell, Semaphore};

use super::{RemoteError, RemoteResult};
use crate::db::LocalStore;
use crate::dispatch::ConversationSyncer;
use crate::ingest::CookieExtractor;
use crate::types::{ConversationMessage, ConversationSession, Source};

/// 默认 base URL
pub const DEFAULT_BASE_URL: &str = "https://claude.ai";

/// 分页大小
const PAGE_LIMIT: usize = 50;

/// 增量同步默认回看窗口
const INCREMENTAL_CUTOFF_HOURS: i64 = 24;

/// 伪装的浏览器 UA
const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// 限速器：5 个许可，取得 1 秒后归还
///
/// 信号量 + 定时归还是令牌桶的粗粒度近似，满足任意滚动 1 秒窗口内
/// 最多 5 次调用。
pub struct RateLimiter {
    permits: Arc<Semaphore>,
    hold: Duration,
}

impl RateLimiter {
    pub fn new(max_per_second: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_per_second)),
            hold: Duration::from_secs(1),
        }
    }

    /// 等待一个调用配额
    pub async fn acquire(&self) {
        match self.permits.clone().acquire_owned().await {
            Ok(permit) => {
                let hold = self.hold;
                tokio::spawn(async move {
                    tokio::time::sleep(hold).await;
                    drop(permit);
                });
            }
            Err(_) => {
                // 信号量只在进程退出时关闭
            }
        }
    }
}

/// 会话元数据（分页列表项）
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationMeta {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Deserialize)]
struct OrgInfo {
    uuid: String,
}

#[derive(Debug, Deserialize)]
struct Conversation {
    uuid: String,
    #[serde(default)]
    name: String,
    created_at: String,
    updated_at: String,
    #[serde(default)]
    chat_messages: Vec<ChatMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[allow(dead_code)]
    uuid: String,
    sender: String,
    #[serde(default)]
    text: String,
    created_at: String,
}

/// 提供方 API 客户端
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<LocalStore>,
    cookies: Arc<CookieExtractor>,
    limiter: RateLimiter,
    /// 工作 org id，客户端生命周期内缓存
    org_id: OnceCell<String>,
}

impl ProviderClient {
    pub fn new(store: Arc<LocalStore>, cookies: Arc<CookieExtractor>) -> Self {
        Self::with_base_url(store, cookies, DEFAULT_BASE_URL)
    }

    /// 指定 base URL（测试用）
    pub fn with_base_url(
        store: Arc<LocalStore>,
        cookies: Arc<CookieExtractor>,
        base_url: impl Into<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.into(),
            store,
            cookies,
            limiter: RateLimiter::new(5),
            org_id: OnceCell::new(),
        }
    }

    /// 取会话 cookie；拿不到视为凭据缺失
    async fn cookie(&self) -> RemoteResult<String> {
        self.cookies
            .session_cookie()
            .await
            .ok_or(RemoteError::AuthMissing)
    }

    /// 发起一个带凭据与浏览器伪装头的 GET
    ///
    /// 会话 cookie 同时挂在两个头名下，提供方接受任一。
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        cookie: &str,
        path: &str,
    ) -> RemoteResult<T> {
        self.limiter.acquire().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .header("Cookie", format!("sessionKey={}", cookie))
            .header("X-Session-Key", cookie)
            .header("User-Agent", USER_AGENT)
            .header("Referer", format!("{}/", self.base_url))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status, path));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Permanent(format!("{}: 响应解析失败: {}", path, e)))
    }

    /// 工作 org id：取列表第一个，生命周期内缓存
    async fn org_id(&self, cookie: &str) -> RemoteResult<String> {
        if let Some(id) = self.org_id.get() {
            return Ok(id.clone());
        }

        let orgs: Vec<OrgInfo> = self.get_json(cookie, "/api/organizations").await?;
        let first = orgs
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Permanent("组织列表为空".into()))?;

        let _ = self.org_id.set(first.uuid.clone());
        Ok(first.uuid)
    }

    /// 拉取一页会话元数据
    async fn list_page(
        &self,
        cookie: &str,
        org_id: &str,
        offset: usize,
    ) -> RemoteResult<Vec<ConversationMeta>> {
        let path = format!(
            "/api/organizations/{}/chat_conversations?limit={}&offset={}",
            org_id, PAGE_LIMIT, offset
        );
        self.get_json(cookie, &path).await
    }

    /// 拉取单个完整会话并写入本地存储
    async fn fetch_and_store(
        &self,
        cookie: &str,
        org_id: &str,
        uuid: &str,
    ) -> RemoteResult<()> {
        let path = format!(
            "/api/organizations/{}/chat_conversations/{}",
            org_id, uuid
        );
        let convo: Conversation = self.get_json(cookie, &path).await?;

        let mut session = ConversationSession::new(
            Source::ClaudeChat,
            convo.uuid.clone(),
            convo.name.clone(),
            convo.created_at.clone(),
            convo.updated_at.clone(),
            convo.chat_messages.len(),
        );

        self.store
            .upsert_session(&mut session)
            .map_err(|e| RemoteError::Permanent(format!("会话写入失败: {}", e)))?;

        let messages: Vec<ConversationMessage> = convo
            .chat_messages
            .iter()
            .map(|m| ConversationMessage {
                id: 0,
                session_id: session.id,
                role: if m.sender == "human" {
                    "user".to_string()
                } else {
                    "assistant".to_string()
                },
                content: m.text.clone(),
                created_at: m.created_at.clone(),
                token_count: None,
            })
            .collect();

        self.store
            .upsert_messages(&messages)
            .map_err(|e| RemoteError::Permanent(format!("消息写入失败: {}", e)))?;

        Ok(())
    }

    /// 遍历分页；`cutoff` 给定时在第一条早于 cutoff 的元数据处停止
    async fn iterate_listing(
        &self,
        cookie: &str,
        org_id: &str,
        cutoff: Option<DateTime<Utc>>,
    ) -> RemoteResult<usize> {
        let mut offset = 0;
        let mut synced = 0;

        loop {
            let page = self.list_page(cookie, org_id, offset).await?;
            let page_len = page.len();

            for meta in &page {
                if let Some(cutoff) = cutoff {
                    let updated = DateTime::parse_from_rfc3339(&meta.updated_at)
                        .map(|dt| dt.with_timezone(&Utc));
                    match updated {
                        Ok(ts) if ts < cutoff => return Ok(synced),
                        Ok(_) => {}
                        Err(e) => {
                            tracing::debug!("updated_at 解析失败，跳过 {}: {}", meta.uuid, e);
                            continue;
                        }
                    }
                }

                match self.fetch_and_store(cookie, org_id, &meta.uuid).await {
                    Ok(()) => synced += 1,
                    Err(e) => {
                        tracing::warn!("会话 {} 拉取失败: {}", meta.uuid, e);
                    }
                }
            }

            // 短页或空页表示到底
            if page_len < PAGE_LIMIT {
                return Ok(synced);
            }
            offset += page_len;
        }
    }
}

#[async_trait]
impl ConversationSyncer for ProviderClient {
    async fn sync_bulk(&self) -> RemoteResult<usize> {
        let cookie = self.cookie().await?;
        let org_id = self.org_id(&cookie).await?;
        self.iterate_listing(&cookie, &org_id, None).await
    }

    async fn sync_targeted(&self, ids: &[String]) -> RemoteResult<usize> {
        let cookie = self.cookie().await?;
        let org_id = self.org_id(&cookie).await?;

        let mut synced = 0;
        for uuid in ids {
            match self.fetch_and_store(&cookie, &org_id, uuid).await {
                Ok(()) => synced += 1,
                Err(e) => {
                    tracing::warn!("会话 {} 拉取失败: {}", uuid, e);
                }
            }
        }
        Ok(synced)
    }

    async fn sync_incremental(&self) -> RemoteResult<usize> {
        let cookie = self.cookie().await?;
        let org_id = self.org_id(&cookie).await?;
        let cutoff = Utc::now() - chrono::Duration::hours(INCREMENTAL_CUTOFF_HOURS);
        self.iterate_listing(&cookie, &org_id, Some(cutoff)).await
    }
}
