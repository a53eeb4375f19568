//! 会话日志行解析
//!
//! 每行一个事件（JSON）。同一行独立产出两份表示：
//! - 传统消息：content block 拼接成单条文本（含 tool_use/tool_result/thinking
//!   的括注摘要），供消息搜索使用；
//! - 结构化观测：content 数组的每个 block 一条观测，带会话内单调序号，
//!   tool_result 通过来源 block id 延迟回链到 tool_use。
//!
//! 两份表示并存是历史兼容约束（共驻工具按消息搜索），未来统一到观测。

use std::path::Path;

use serde_json::Value;

use crate::types::{ConversationMessage, ConversationObservation, ObservationType};

/// 测试命令关键字（Bash 工具命令包含其一 → TestResult）
const TEST_COMMAND_MARKERS: &[&str] = &["dotnet test", "npm test", "pytest", "yarn test"];

/// 错误关键字（tool_result 内容包含其一 → Error）
const ERROR_MARKERS: &[&str] = &["error", "exception", "failed"];

/// 一次文件处理的提取结果
///
/// `messages`/`observations` 的 `session_id` 为 0 占位，会话 upsert 后由
/// 调用方回填。`block_ids`/`parent_refs` 与 `observations` 一一对应：
/// tool_use 记录来源 block id，tool_result 记录其 `tool_use_id`。
#[derive(Debug, Default)]
pub struct Extraction {
    /// 首个 user 行定义的标题；本批没有 user 行时为 None
    pub session_title: Option<String>,
    pub first_timestamp: Option<String>,
    pub last_timestamp: Option<String>,
    pub messages: Vec<ConversationMessage>,
    pub observations: Vec<ConversationObservation>,
    pub block_ids: Vec<Option<String>>,
    pub parent_refs: Vec<Option<String>>,
}

/// 行提取器（单个文件的一次处理）
pub struct Extractor {
    stem: String,
    subagent: bool,
    next_sequence: i64,
    out: Extraction,
}

impl Extractor {
    /// 创建提取器
    ///
    /// `starting_sequence`：本批观测的起始序号。从文件头读取时为 0，
    /// 增量读取时为库内已有序号 + 1，保证重放幂等且序号严格递增。
    pub fn new(stem: &str, subagent: bool, starting_sequence: i64) -> Self {
        Self {
            stem: stem.to_string(),
            subagent,
            next_sequence: starting_sequence,
            out: Extraction::default(),
        }
    }

    /// 处理一行；解析失败只跳过该行
    pub fn push_line(&mut self, line: &str) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return;
        }

        let json: Value = match serde_json::from_str(trimmed) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!("跳过无法解析的行: {}", e);
                return;
            }
        };

        let line_type = match json.get("type").and_then(|v| v.as_str()) {
            Some(t @ ("user" | "assistant")) => t,
            _ => return,
        };

        let timestamp = json
            .get("timestamp")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());

        if self.out.first_timestamp.is_none() {
            self.out.first_timestamp = Some(timestamp.clone());
        }
        self.out.last_timestamp = Some(timestamp.clone());

        // 首个 user 行定义会话元数据
        if line_type == "user" && self.out.session_title.is_none() {
            let cwd = json.get("cwd").and_then(|v| v.as_str());
            self.out.session_title = Some(derive_title(cwd, &self.stem, self.subagent));
        }

        let message = json.get("message").cloned().unwrap_or(Value::Null);
        let content = message.get("content").cloned().unwrap_or(Value::Null);

        // 传统消息：block 拼接 + usage 合计
        let text = assemble_message_text(&content);
        if !text.is_empty() {
            let token_count = message
                .get("usage")
                .filter(|u| u.is_object())
                .map(|u| {
                    u.get("input_tokens").and_then(|v| v.as_i64()).unwrap_or(0)
                        + u.get("output_tokens").and_then(|v| v.as_i64()).unwrap_or(0)
                });

            self.out.messages.push(ConversationMessage {
                id: 0,
                session_id: 0,
                role: line_type.to_string(),
                content: text,
                created_at: timestamp.clone(),
                token_count,
            });
        }

        // 结构化观测：仅数组形态的 content 产出
        if let Some(blocks) = content.as_array() {
            for block in blocks {
                self.push_block(block, &timestamp);
            }
        }
    }

    fn push_block(&mut self, block: &Value, timestamp: &str) {
        let block_type = match block.get("type").and_then(|v| v.as_str()) {
            Some(t) => t,
            None => return,
        };

        let (observation_type, tool_name, file_path, obs_content, block_id, parent_ref) =
            match block_type {
                "text" => {
                    let text = block.get("text").and_then(|v| v.as_str()).unwrap_or("");
                    (
                        ObservationType::Text,
                        None,
                        None,
                        text.to_string(),
                        None,
                        None,
                    )
                }
                "thinking" => {
                    let text = block.get("thinking").and_then(|v| v.as_str()).unwrap_or("");
                    (
                        ObservationType::Thinking,
                        None,
                        None,
                        text.to_string(),
                        None,
                        None,
                    )
                }
                "tool_use" => {
                    let name = block
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("unknown");
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    let observation_type = classify_tool_use(name, &input);
                    let file_path = extract_file_path(&input);
                    let content = serde_json::to_string(&input).unwrap_or_default();
                    let block_id = block
                        .get("id")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    (
                        observation_type,
                        Some(name.to_string()),
                        file_path,
                        content,
                        block_id,
                        None,
                    )
                }
                "tool_result" => {
                    let content = flatten_tool_result(block.get("content").unwrap_or(&Value::Null));
                    let observation_type = classify_tool_result(&content);
                    let parent_ref = block
                        .get("tool_use_id")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    (observation_type, None, None, content, None, parent_ref)
                }
                _ => return,
            };

        let sequence_number = self.next_sequence;
        self.next_sequence += 1;

        self.out.observations.push(ConversationObservation {
            id: 0,
            session_id: 0,
            observation_type,
            tool_name,
            file_path,
            content: obs_content,
            token_count: None,
            sequence_number,
            parent_observation_id: None,
            created_at: timestamp.to_string(),
        });
        self.out.block_ids.push(block_id);
        self.out.parent_refs.push(parent_ref);
    }

    /// 结束本次处理
    pub fn finish(self) -> Extraction {
        self.out
    }
}

/// 由 cwd 末段 + 文件名前 8 字符构造标题；subagent 文件加前缀
pub fn derive_title(cwd: Option<&str>, stem: &str, subagent: bool) -> String {
    let short_stem: String = stem.chars().take(8).collect();
    let base = match cwd {
        Some(cwd) if !cwd.is_empty() => {
            let last = Path::new(cwd)
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or(cwd);
            format!("{}/{}", last, short_stem)
        }
        _ => short_stem,
    };

    if subagent {
        format!("[subagent] {}", base)
    } else {
        base
    }
}

/// 路径中是否有 `subagents` 目录段
pub fn is_subagent_path(path: &Path) -> bool {
    path.components()
        .any(|c| c.as_os_str().to_str() == Some("subagents"))
}

/// content block 拼接为单条消息文本
fn assemble_message_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let parts: Vec<String> = blocks
                .iter()
                .filter_map(|block| {
                    match block.get("type").and_then(|v| v.as_str()) {
                        Some("text") => block
                            .get("text")
                            .and_then(|v| v.as_str())
                            .map(|s| s.to_string()),
                        Some("tool_use") => {
                            let name = block
                                .get("name")
                                .and_then(|v| v.as_str())
                                .unwrap_or("unknown");
                            let input = block.get("input").cloned().unwrap_or(Value::Null);
                            Some(format!(
                                "[tool_use:{}] {}",
                                name,
                                serde_json::to_string(&input).unwrap_or_default()
                            ))
                        }
                        Some("tool_result") => Some(format!(
                            "[tool_result] {}",
                            flatten_tool_result(block.get("content").unwrap_or(&Value::Null))
                        )),
                        Some("thinking") => block
                            .get("thinking")
                            .and_then(|v| v.as_str())
                            .map(|s| format!("[thinking] {}", s)),
                        _ => None,
                    }
                })
                .collect();
            parts.join("\n")
        }
        _ => String::new(),
    }
}

/// tool_result 的 content 可能是字符串或 block 数组，展平为文本
fn flatten_tool_result(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// tool_use 分类
fn classify_tool_use(name: &str, input: &Value) -> ObservationType {
    if name.eq_ignore_ascii_case("Bash") {
        let command = input.get("command").and_then(|v| v.as_str()).unwrap_or("");
        if contains_ignore_case(command, "git commit") {
            return ObservationType::GitCommit;
        }
        if TEST_COMMAND_MARKERS
            .iter()
            .any(|m| contains_ignore_case(command, m))
        {
            return ObservationType::TestResult;
        }
    }
    ObservationType::ToolUse
}

/// tool_result 分类
fn classify_tool_result(content: &str) -> ObservationType {
    if ERROR_MARKERS
        .iter()
        .any(|m| contains_ignore_case(content, m))
    {
        ObservationType::Error
    } else {
        ObservationType::ToolResult
    }
}

/// 工具输入中的文件路径（path | file_path | filename）
fn extract_file_path(input: &Value) -> Option<String> {
    for key in ["path", "file_path", "filename"] {
        if let Some(p) = input.get(key).and_then(|v| v.as_str()) {
            return Some(p.to_string());
        }
    }
    None
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_title() {
        assert_eq!(
            derive_title(Some("/home/me/proj"), "sess-xyz", false),
            "proj/sess-xyz"
        );
        assert_eq!(
            derive_title(Some("/home/me/proj"), "0123456789abcdef", false),
            "proj/01234567"
        );
        assert_eq!(
            derive_title(Some("/home/me/proj"), "sess-xyz", true),
            "[subagent] proj/sess-xyz"
        );
        assert_eq!(derive_title(None, "sess-xyz", false), "sess-xyz");
    }

    #[test]
    fn test_is_subagent_path() {
        assert!(is_subagent_path(Path::new(
            "/home/me/.claude/projects/p/subagents/x.jsonl"
        )));
        assert!(!is_subagent_path(Path::new(
            "/home/me/.claude/projects/p/x.jsonl"
        )));
    }

    #[test]
    fn test_user_string_content() {
        let mut ex = Extractor::new("sess-xyz", false, 0);
        ex.push_line(
            r#"{"type":"user","message":{"role":"user","content":"Hello"},"timestamp":"2026-01-01T00:00:00Z","cwd":"/home/me/proj"}"#,
        );
        let out = ex.finish();

        assert_eq!(out.session_title.as_deref(), Some("proj/sess-xyz"));
        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].role, "user");
        assert_eq!(out.messages[0].content, "Hello");
        assert_eq!(out.messages[0].token_count, None);
        // 字符串 content 不产出观测
        assert!(out.observations.is_empty());
    }

    #[test]
    fn test_assistant_text_block() {
        let mut ex = Extractor::new("sess-xyz", false, 0);
        ex.push_line(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hi!"}],"usage":{"input_tokens":3,"output_tokens":4}},"timestamp":"2026-01-01T00:00:01Z"}"#,
        );
        let out = ex.finish();

        assert_eq!(out.messages.len(), 1);
        assert_eq!(out.messages[0].content, "Hi!");
        assert_eq!(out.messages[0].token_count, Some(7));

        assert_eq!(out.observations.len(), 1);
        assert_eq!(out.observations[0].observation_type, ObservationType::Text);
        assert_eq!(out.observations[0].content, "Hi!");
        assert_eq!(out.observations[0].sequence_number, 0);
    }

    #[test]
    fn test_tool_use_and_result_blocks() {
        let mut ex = Extractor::new("sess-abc", false, 0);
        ex.push_line(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"toolu_42","name":"Read","input":{"path":"/src/x.cs"}}]},"timestamp":"2026-01-01T00:00:02Z"}"#,
        );
        ex.push_line(
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"toolu_42","content":"ok"}]},"timestamp":"2026-01-01T00:00:03Z"}"#,
        );
        let out = ex.finish();

        assert_eq!(out.observations.len(), 2);
        let tool_use = &out.observations[0];
        let tool_result = &out.observations[1];

        assert_eq!(tool_use.observation_type, ObservationType::ToolUse);
        assert_eq!(tool_use.tool_name.as_deref(), Some("Read"));
        assert_eq!(tool_use.file_path.as_deref(), Some("/src/x.cs"));
        assert_eq!(out.block_ids[0].as_deref(), Some("toolu_42"));

        assert_eq!(tool_result.observation_type, ObservationType::ToolResult);
        assert_eq!(out.parent_refs[1].as_deref(), Some("toolu_42"));

        // 序号严格递增
        assert!(tool_result.sequence_number > tool_use.sequence_number);
    }

    #[test]
    fn test_error_classification() {
        let mut ex = Extractor::new("s", false, 0);
        ex.push_line(
            r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"NullReferenceException at line 42"}]},"timestamp":"2026-01-01T00:00:00Z"}"#,
        );
        let out = ex.finish();
        assert_eq!(out.observations.len(), 1);
        assert_eq!(out.observations[0].observation_type, ObservationType::Error);
    }

    #[test]
    fn test_git_commit_and_test_classification() {
        let git = classify_tool_use(
            "Bash",
            &serde_json::json!({"command": "git commit -m 'x'"}),
        );
        assert_eq!(git, ObservationType::GitCommit);

        let test = classify_tool_use("Bash", &serde_json::json!({"command": "PYTEST tests/"}));
        assert_eq!(test, ObservationType::TestResult);

        let plain = classify_tool_use("Bash", &serde_json::json!({"command": "ls -la"}));
        assert_eq!(plain, ObservationType::ToolUse);

        let other = classify_tool_use("Read", &serde_json::json!({"path": "/a"}));
        assert_eq!(other, ObservationType::ToolUse);
    }

    #[test]
    fn test_malformed_line_skipped() {
        let mut ex = Extractor::new("s", false, 0);
        ex.push_line("not json at all{");
        ex.push_line(
            r#"{"type":"user","message":{"role":"user","content":"ok"},"timestamp":"2026-01-01T00:00:00Z","cwd":"/p"}"#,
        );
        let out = ex.finish();
        assert_eq!(out.messages.len(), 1);
    }

    #[test]
    fn test_thinking_block() {
        let mut ex = Extractor::new("s", false, 5);
        ex.push_line(
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"thinking","thinking":"hmm"},{"type":"text","text":"done"}]},"timestamp":"2026-01-01T00:00:00Z"}"#,
        );
        let out = ex.finish();

        assert_eq!(out.observations.len(), 2);
        assert_eq!(
            out.observations[0].observation_type,
            ObservationType::Thinking
        );
        assert_eq!(out.observations[0].sequence_number, 5);
        assert_eq!(out.observations[1].sequence_number, 6);

        // 消息拼接含 thinking 括注
        assert_eq!(out.messages[0].content, "[thinking] hmm\ndone");
    }
}
