//! 云端同步 worker
//!
//! 周期性把待同步会话投递到文档服务与记忆服务。节奏自适应：
//! 有产出的一轮后 2 分钟，空轮或出错后 10 分钟。所有远端错误非致命，
//! 会话在被标记前一直处于待同步状态，下一轮隐式重试。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{CloudClient, DocumentRequest, RemoteError};
use crate::auth::AuthService;
use crate::db::LocalStore;
use crate::types::{ConversationMessage, ConversationSession};

/// 有产出后的轮询间隔
const PRODUCTIVE_INTERVAL: Duration = Duration::from_secs(120);

/// 空轮 / 异常后的轮询间隔
const IDLE_INTERVAL: Duration = Duration::from_secs(600);

/// 每轮最多处理的会话数
const BATCH_SIZE: usize = 10;

/// 记忆片段截断长度（字符）
const MEMORY_SNIPPET_CHARS: usize = 500;

/// 同步 worker
pub struct SyncWorker {
    store: Arc<LocalStore>,
    auth: Arc<AuthService>,
    cloud: Arc<CloudClient>,
}

impl SyncWorker {
    pub fn new(store: Arc<LocalStore>, auth: Arc<AuthService>, cloud: Arc<CloudClient>) -> Self {
        Self { store, auth, cloud }
    }

    /// 运行直到取消
    pub async fn run(self, cancel: CancellationToken) {
        loop {
            let interval = match self.run_pass().await {
                Ok(synced) if synced > 0 => {
                    tracing::info!("☁️ 同步完成: {} 个会话", synced);
                    PRODUCTIVE_INTERVAL
                }
                Ok(_) => IDLE_INTERVAL,
                Err(e) => {
                    tracing::warn!("同步轮次异常: {}", e);
                    IDLE_INTERVAL
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        tracing::info!("同步 worker 退出");
    }

    /// 执行一轮同步，返回成功投递的会话数
    pub async fn run_pass(&self) -> anyhow::Result<usize> {
        let token = match self.auth.access_token().await {
            Some(t) => t,
            None => {
                tracing::debug!("无可用访问凭据，跳过本轮同步");
                return Ok(0);
            }
        };

        let tenant_id = self.auth.state().await.tenant_id;
        let pending = self.store.get_pending_sync(BATCH_SIZE)?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut synced = 0;
        for session in &pending {
            // 单个会话失败不阻断本轮
            match self.sync_session(&token, tenant_id.clone(), session).await {
                Ok(()) => synced += 1,
                Err(e) => {
                    tracing::warn!(
                        "会话 {}/{} 同步失败: {}",
                        session.source,
                        session.external_id,
                        e
                    );
                }
            }
        }

        Ok(synced)
    }

    /// 投递单个会话：文档必达，记忆 best-effort，最后原子标记
    async fn sync_session(
        &self,
        token: &str,
        tenant_id: Option<String>,
        session: &ConversationSession,
    ) -> anyhow::Result<()> {
        let messages = self.store.get_messages(session.id)?;
        let transcript = format_transcript(session, &messages);
        let tags = vec!["ai-session".to_string(), session.source.to_string()];

        let request = DocumentRequest::new(
            tenant_id,
            session.title.clone(),
            format!("{} messages from {}", messages.len(), session.source),
            session.content_hash.clone(),
            &transcript,
            tags.clone(),
        );

        let doc_id = self.cloud.create_document(token, &request).await?;

        // 记忆端点：首条 assistant 消息截断投递；无 scope / 网络异常都不算失败
        if let Some(first_assistant) = messages.iter().find(|m| m.role == "assistant") {
            let snippet = truncate_snippet(&first_assistant.content, MEMORY_SNIPPET_CHARS);
            match self.cloud.retain_memory(token, &snippet, &tags).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_memory_synced(session.id) {
                        tracing::debug!("记忆台账更新失败: {}", e);
                    }
                }
                Err(RemoteError::AuthDenied) => {
                    // 用户没有记忆 scope，视为成功
                }
                Err(e) => {
                    tracing::debug!("记忆投递失败（忽略）: {}", e);
                }
            }
        }

        self.store.mark_synced(session.id, Some(&doc_id))?;
        Ok(())
    }
}

/// 会话 → markdown 转写
pub fn format_transcript(
    session: &ConversationSession,
    messages: &[ConversationMessage],
) -> String {
    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", session.title));
    out.push_str(&format!("- Source: {}\n", session.source));
    out.push_str(&format!("- Updated: {}\n\n", session.updated_at));

    for msg in messages {
        let heading = if msg.role == "user" {
            "## User"
        } else {
            "## Assistant"
        };
        out.push_str(&format!("{} ({})\n\n{}\n\n", heading, msg.created_at, msg.content));
    }

    out
}

/// 字符级截断，截断时追加省略号
fn truncate_snippet(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max_chars).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Source;

    #[test]
    fn test_truncate_snippet() {
        assert_eq!(truncate_snippet("short", 500), "short");

        let long = "x".repeat(600);
        let truncated = truncate_snippet(&long, 500);
        assert_eq!(truncated.chars().count(), 501);
        assert!(truncated.ends_with('…'));
    }

    #[test]
    fn test_format_transcript() {
        let session = ConversationSession::new(
            Source::ClaudeCode,
            "sess-1",
            "proj/sess-1",
            "2026-01-01T00:00:00Z",
            "2026-01-01T00:00:01Z",
            2,
        );
        let messages = vec![
            ConversationMessage {
                id: 1,
                session_id: 1,
                role: "user".into(),
                content: "Hello".into(),
                created_at: "2026-01-01T00:00:00Z".into(),
                token_count: None,
            },
            ConversationMessage {
                id: 2,
                session_id: 1,
                role: "assistant".into(),
                content: "Hi!".into(),
                created_at: "2026-01-01T00:00:01Z".into(),
                token_count: Some(7),
            },
        ];

        let transcript = format_transcript(&session, &messages);
        assert!(transcript.starts_with("# proj/sess-1"));
        assert!(transcript.contains("## User (2026-01-01T00:00:00Z)\n\nHello"));
        assert!(transcript.contains("## Assistant (2026-01-01T00:00:01Z)\n\nHi!"));
    }
}
