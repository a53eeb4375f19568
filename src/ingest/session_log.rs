//! 会话日志 watcher
//!
//! 监听 Claude Code 的 append-only JSONL 会话日志目录，按字节偏移增量读取，
//! 提取消息与结构化观测写入本地存储。偏移持久化保证任意重启序列下
//! 每个文件恰好被消费一次（不重叠、不遗漏）。

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::extract::{derive_title, is_subagent_path, Extraction, Extractor};
use super::offsets::OffsetMap;
use crate::db::LocalStore;
use crate::types::{ConversationSession, Source};

/// 文件事件防抖（秒）
const DEBOUNCE_SECS: u64 = 2;

/// 会话日志 watcher
pub struct SessionLogWatcher {
    store: Arc<LocalStore>,
    root: PathBuf,
    offsets: Arc<Mutex<OffsetMap>>,
    enabled: bool,
    poll_interval: Duration,
}

impl SessionLogWatcher {
    pub fn new(
        store: Arc<LocalStore>,
        root: PathBuf,
        positions_path: PathBuf,
        enabled: bool,
        poll_interval_secs: u64,
    ) -> Self {
        Self {
            store,
            root,
            offsets: Arc::new(Mutex::new(OffsetMap::load(positions_path))),
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
        }
    }

    /// 运行 watcher 直到取消
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if !self.enabled {
            tracing::info!("Claude Code 会话采集已禁用，watcher 不启动");
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<PathBuf>(100);

        let tx_clone = tx.clone();
        let mut debouncer = new_debouncer(
            Duration::from_secs(DEBOUNCE_SECS),
            move |res: std::result::Result<
                Vec<notify_debouncer_mini::DebouncedEvent>,
                notify::Error,
            >| {
                if let Ok(events) = res {
                    for event in events {
                        if event.kind == DebouncedEventKind::Any {
                            let _ = tx_clone.blocking_send(event.path);
                        }
                    }
                }
            },
        )?;

        match debouncer.watcher().watch(&self.root, RecursiveMode::Recursive) {
            Ok(_) => {
                tracing::info!("👁️ Watching session logs: {:?}", self.root);
            }
            Err(e) => {
                // 目录可能尚不存在；周期性重扫兜底
                tracing::warn!("⚠️ Failed to watch {:?}: {}", self.root, e);
            }
        }

        // 启动时全量扫描一次（偏移剪枝跳过已消费内容）
        self.scan_tree().await;

        let mut tick = tokio::time::interval(self.poll_interval);
        tick.tick().await; // 首次立即完成，跳过

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(path) = rx.recv() => {
                    if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
                        self.ingest(path).await;
                    }
                }
                _ = tick.tick() => {
                    self.scan_tree().await;
                }
            }
        }

        drop(debouncer);
        tracing::info!("会话日志 watcher 退出");
        Ok(())
    }

    /// 全量重扫目录树
    async fn scan_tree(&self) {
        let mut files = Vec::new();
        collect_jsonl_files(&self.root, &mut files);

        for path in files {
            self.ingest(path).await;
        }
    }

    /// 处理单个文件；一个文件的失败不影响其他文件
    async fn ingest(&self, path: PathBuf) {
        let store = self.store.clone();
        let offsets = self.offsets.clone();
        let path_for_log = path.clone();

        let result = tokio::task::spawn_blocking(move || {
            let mut offsets = offsets.lock();
            process_file(&store, &mut offsets, &path)
        })
        .await;

        match result {
            Ok(Ok(inserted)) if inserted > 0 => {
                tracing::debug!(
                    "📝 Ingested {:?}: {} new messages",
                    path_for_log.file_name().unwrap_or_default(),
                    inserted
                );
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!("处理会话文件失败 {:?}: {}", path_for_log, e);
            }
            Err(e) => {
                tracing::error!("spawn_blocking failed: {}", e);
            }
        }
    }
}

/// 递归收集 *.jsonl 文件
fn collect_jsonl_files(dir: &Path, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(_) => return,
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_jsonl_files(&path, out);
        } else if path.extension().and_then(|e| e.to_str()) == Some("jsonl") {
            out.push(path);
        }
    }
}

/// 处理单个会话日志文件的一次增量读取
///
/// 流程：读取新增完整行 → 提取 → upsert 会话 → 回填 session_id →
/// 批量 upsert 消息与观测 → 解析父链接 → 最后才推进并持久化偏移。
/// 返回写入的消息行数。
pub fn process_file(
    store: &LocalStore,
    offsets: &mut OffsetMap,
    path: &Path,
) -> crate::error::Result<usize> {
    let stem = match path.file_stem().and_then(|s| s.to_str()) {
        Some(s) => s.to_string(),
        None => return Ok(0),
    };

    let mut offset = offsets.get(path);

    // 文件被截断或替换时从头重读
    let file_len = std::fs::metadata(path)?.len();
    if file_len < offset {
        tracing::debug!("文件变短，偏移重置: {:?}", path);
        offset = 0;
    }

    let (lines, consumed) = read_new_lines(path, offset)?;
    if consumed == 0 {
        return Ok(0);
    }

    let subagent = is_subagent_path(path);
    let existing = store.get_session(Source::ClaudeCode, &stem)?;

    // 从文件头读取时序号从 0 起（重放幂等）；增量读取时接续库内序号
    let starting_seq = if offset == 0 {
        0
    } else {
        match &existing {
            Some(s) => store.next_observation_sequence(s.id)?,
            None => 0,
        }
    };

    let mut extractor = Extractor::new(&stem, subagent, starting_seq);
    for line in &lines {
        extractor.push_line(line);
    }

    let Extraction {
        session_title,
        first_timestamp,
        last_timestamp,
        messages,
        observations,
        block_ids,
        parent_refs,
    } = extractor.finish();

    // 会话元数据：本批没有 user 行时沿用已有标题
    let title = session_title
        .or_else(|| existing.as_ref().map(|s| s.title.clone()))
        .unwrap_or_else(|| derive_title(None, &stem, subagent));
    let created_at = existing
        .as_ref()
        .map(|s| s.created_at.clone())
        .or_else(|| first_timestamp.clone())
        .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
    let updated_at = last_timestamp
        .or_else(|| existing.as_ref().map(|s| s.updated_at.clone()))
        .unwrap_or_else(|| created_at.clone());

    let prior_count = match &existing {
        Some(s) => store.session_message_count(s.id)?,
        None => 0,
    };
    let message_count = prior_count as usize + messages.len();

    let mut session = ConversationSession::new(
        Source::ClaudeCode,
        stem,
        title,
        created_at,
        updated_at,
        message_count,
    );
    store.upsert_session(&mut session)?;

    let mut messages = messages;
    for m in &mut messages {
        m.session_id = session.id;
    }
    let inserted = store.upsert_messages(&messages)?;

    let mut observations = observations;
    for o in &mut observations {
        o.session_id = session.id;
    }
    store.upsert_observations(&mut observations)?;

    // 父链接解析：来源 block id → 已分配行 id（仅限本批）
    let mut scratch: HashMap<&str, i64> = HashMap::new();
    for (obs, block_id) in observations.iter().zip(&block_ids) {
        if let Some(id) = block_id {
            scratch.insert(id.as_str(), obs.id);
        }
    }

    let mut pairs = Vec::new();
    for (obs, parent_ref) in observations.iter().zip(&parent_refs) {
        if let Some(r) = parent_ref {
            if let Some(&parent_id) = scratch.get(r.as_str()) {
                pairs.push((obs.id, parent_id));
            }
        }
    }
    store.update_observation_parents(&pairs)?;

    // 行处理全部成功后才推进偏移
    offsets.set(path, offset + consumed);
    offsets.save()?;

    Ok(inserted)
}

/// 从 `offset` 起读取新增的完整行
///
/// 只消费以换行符结尾的部分；未完成的尾行留待下次。
/// 返回 (行集合, 消费字节数)。
fn read_new_lines(path: &Path, offset: u64) -> std::io::Result<(Vec<String>, u64)> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;

    let consumed = match buf.iter().rposition(|&b| b == b'\n') {
        Some(i) => i + 1,
        None => return Ok((Vec::new(), 0)),
    };

    let text = String::from_utf8_lossy(&buf[..consumed]);
    let lines = text.lines().map(|s| s.to_string()).collect();

    Ok((lines, consumed as u64))
}
