//! 数据类型定义

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// 会话来源（哪个 AI 助手界面产生的会话）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    /// Claude 桌面/网页聊天
    ClaudeChat,
    /// Claude Code CLI
    ClaudeCode,
    /// Cowork 桌面端
    Cowork,
    /// ChatGPT
    ChatGpt,
}

impl Source {
    /// 数据库中的规范字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::ClaudeChat => "claude-chat",
            Source::ClaudeCode => "claude-code",
            Source::Cowork => "cowork",
            Source::ChatGpt => "chatgpt",
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude-chat" => Ok(Source::ClaudeChat),
            "claude-code" => Ok(Source::ClaudeCode),
            "cowork" => Ok(Source::Cowork),
            "chatgpt" => Ok(Source::ChatGpt),
            other => Err(format!("unknown source: {}", other)),
        }
    }
}

/// 观测类型（从单个 content block 提取的结构化事件）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObservationType {
    ToolUse,
    ToolResult,
    Text,
    Thinking,
    GitCommit,
    TestResult,
    Error,
}

impl ObservationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationType::ToolUse => "tool_use",
            ObservationType::ToolResult => "tool_result",
            ObservationType::Text => "text",
            ObservationType::Thinking => "thinking",
            ObservationType::GitCommit => "git_commit",
            ObservationType::TestResult => "test_result",
            ObservationType::Error => "error",
        }
    }
}

impl std::fmt::Display for ObservationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ObservationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tool_use" => Ok(ObservationType::ToolUse),
            "tool_result" => Ok(ObservationType::ToolResult),
            "text" => Ok(ObservationType::Text),
            "thinking" => Ok(ObservationType::Thinking),
            "git_commit" => Ok(ObservationType::GitCommit),
            "test_result" => Ok(ObservationType::TestResult),
            "error" => Ok(ObservationType::Error),
            other => Err(format!("unknown observation type: {}", other)),
        }
    }
}

/// 会话
///
/// 唯一键：`(source, external_id)`，upsert 以此键折叠。
/// 时间戳统一存储为 ISO-8601 字符串（保留 offset）。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    /// 库内自增 ID（upsert 返回后回填）
    pub id: i64,
    pub source: Source,
    /// 来源方提供的不透明 ID
    pub external_id: String,
    pub title: String,
    pub created_at: String,
    pub updated_at: String,
    /// 最后一次云端同步时间；NULL 表示从未同步
    pub synced_at: Option<String>,
    /// 16 位十六进制指纹，见 [`content_hash`]
    pub content_hash: String,
}

impl ConversationSession {
    /// 构造一个尚未入库的会话（id = 0，hash 自动计算）
    pub fn new(
        source: Source,
        external_id: impl Into<String>,
        title: impl Into<String>,
        created_at: impl Into<String>,
        updated_at: impl Into<String>,
        message_count: usize,
    ) -> Self {
        let external_id = external_id.into();
        let updated_at = updated_at.into();
        let content_hash = content_hash(&external_id, &updated_at, message_count);
        Self {
            id: 0,
            source,
            external_id,
            title: title.into(),
            created_at: created_at.into(),
            updated_at,
            synced_at: None,
            content_hash,
        }
    }
}

/// 消息（一次 user/assistant 轮次）
///
/// 唯一键：`(session_id, role, created_at)`，重复摄取幂等。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub session_id: i64,
    /// "user" | "assistant"
    pub role: String,
    pub content: String,
    pub created_at: String,
    pub token_count: Option<i64>,
}

/// 观测（从编码助手会话的单个 content block 提取的结构化事件）
///
/// 唯一键：`(session_id, sequence_number)`。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationObservation {
    pub id: i64,
    pub session_id: i64,
    pub observation_type: ObservationType,
    pub tool_name: Option<String>,
    /// 从工具输入的 path | file_path | filename 键提取
    pub file_path: Option<String>,
    pub content: String,
    pub token_count: Option<i64>,
    /// 会话内单调递增
    pub sequence_number: i64,
    /// tool_result → tool_use 回链；跨批次引用保持 NULL
    pub parent_observation_id: Option<i64>,
    pub created_at: String,
}

/// 同步台账行（每会话一行，记录云端投递状态）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub source: Source,
    pub external_id: String,
    pub last_synced_at: String,
    /// 云端文档服务返回的句柄
    pub doc_service_id: Option<String>,
    pub memory_synced: bool,
}

/// 消息全文搜索结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub message_id: i64,
    pub session_id: i64,
    pub session_title: String,
    pub role: String,
    pub content: String,
    pub snippet: String,
    pub score: f64,
}

/// 观测全文搜索结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservationHit {
    pub observation_id: i64,
    pub session_id: i64,
    pub observation_type: String,
    pub tool_name: Option<String>,
    pub file_path: Option<String>,
    pub content: String,
    pub snippet: String,
    pub score: f64,
}

/// 统计信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub session_count: i64,
    pub message_count: i64,
    pub observation_count: i64,
}

/// 内容指纹
///
/// SHA-256("{external_id}:{updated_at}:{message_count}") 的前 16 个十六进制
/// 字符（大写）。仅用于更新检测，不作主键。
pub fn content_hash(external_id: &str, updated_at: &str, message_count: usize) -> String {
    let input = format!("{}:{}:{}", external_id, updated_at, message_count);
    let digest = Sha256::digest(input.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02X}", b)).collect();
    hex[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_deterministic() {
        let a = content_hash("sess-1", "2026-01-01T00:00:00Z", 3);
        let b = content_hash("sess-1", "2026-01-01T00:00:00Z", 3);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
        // 全大写十六进制
        assert!(a
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn test_content_hash_changes_with_inputs() {
        let base = content_hash("sess-1", "2026-01-01T00:00:00Z", 3);
        assert_ne!(base, content_hash("sess-2", "2026-01-01T00:00:00Z", 3));
        assert_ne!(base, content_hash("sess-1", "2026-01-01T00:00:01Z", 3));
        assert_ne!(base, content_hash("sess-1", "2026-01-01T00:00:00Z", 4));
    }

    #[test]
    fn test_source_roundtrip() {
        for s in [
            Source::ClaudeChat,
            Source::ClaudeCode,
            Source::Cowork,
            Source::ChatGpt,
        ] {
            assert_eq!(s.as_str().parse::<Source>().unwrap(), s);
        }
        assert!("gemini".parse::<Source>().is_err());
    }

    #[test]
    fn test_observation_type_roundtrip() {
        let all = [
            ObservationType::ToolUse,
            ObservationType::ToolResult,
            ObservationType::Text,
            ObservationType::Thinking,
            ObservationType::GitCommit,
            ObservationType::TestResult,
            ObservationType::Error,
        ];
        for t in all {
            assert_eq!(t.as_str().parse::<ObservationType>().unwrap(), t);
        }
    }
}
