//! Claude 桌面端 local-storage 扫描
//!
//! 桌面客户端的会话 key 以明文字符串形式出现在其 append 结构的存储文件里，
//! 因此不解析存储格式本身：对每个 `*.ldb` 文件做临时拷贝（活库持有文件锁），
//! 抽取可打印 ASCII 串后正则匹配 `LSS-<uuid>:`，聚合去重后发事件。

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use notify::RecursiveMode;
use notify_debouncer_mini::{new_debouncer, DebouncedEventKind};
use regex::Regex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::notify::{ActivityEvent, ActivityNotifier};

/// 扫描防抖窗口（秒）：窗口内的后续事件合并为一次扫描
const SCAN_DEBOUNCE_SECS: u64 = 3;

/// 可打印 ASCII 串的最小长度
const MIN_RUN_LEN: usize = 8;

/// 会话 key 模式（大小写不敏感）
const SESSION_KEY_PATTERN: &str =
    r"(?i)LSS-([0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}):";

/// 扫描一个目录下的全部 `*.ldb` 文件，返回去重后的小写 UUID 集合
///
/// 单个文件失败只记日志；提取失败退化为空集，不中断。
pub fn scan_directory(dir: &Path) -> BTreeSet<String> {
    let mut uuids = BTreeSet::new();

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::debug!("local-storage 目录不可读 {:?}: {}", dir, e);
            return uuids;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("ldb") {
            continue;
        }

        match scan_file(&path) {
            Ok(found) => uuids.extend(found),
            Err(e) => {
                tracing::debug!("扫描 {:?} 失败: {}", path, e);
            }
        }
    }

    uuids
}

/// 扫描单个 `*.ldb` 文件
///
/// 临时拷贝由 `NamedTempFile` 持有，任何退出路径都会删除。
pub fn scan_file(path: &Path) -> Result<BTreeSet<String>> {
    let temp = tempfile::NamedTempFile::new()?;
    std::fs::copy(path, temp.path())?;

    let bytes = std::fs::read(temp.path())?;
    Ok(extract_session_ids(&bytes))
}

/// 从字节流抽取会话 UUID（小写、去重）
pub fn extract_session_ids(bytes: &[u8]) -> BTreeSet<String> {
    let runs = printable_runs(bytes, MIN_RUN_LEN);
    let haystack = runs.join("\n");

    // 模式为编译期常量，构造不会失败
    let re = Regex::new(SESSION_KEY_PATTERN).expect("invalid session key pattern");

    re.captures_iter(&haystack)
        .map(|c| c[1].to_lowercase())
        .collect()
}

/// 抽取长度 ≥ min_len 的可打印 ASCII 串
fn printable_runs(bytes: &[u8], min_len: usize) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();

    for &b in bytes {
        if (0x20..0x7f).contains(&b) {
            current.push(b as char);
        } else {
            if current.len() >= min_len {
                runs.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= min_len {
        runs.push(current);
    }

    runs
}

/// local-storage watcher：文件变化触发防抖扫描，周期定时兜底
pub struct LocalStorageScanner {
    dir: Option<PathBuf>,
    notifier: Arc<ActivityNotifier>,
    enabled: bool,
    poll_interval: Duration,
}

impl LocalStorageScanner {
    pub fn new(
        dir: Option<PathBuf>,
        notifier: Arc<ActivityNotifier>,
        enabled: bool,
        poll_interval_secs: u64,
    ) -> Self {
        Self {
            dir,
            notifier,
            enabled,
            poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
        }
    }

    /// 运行直到取消
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        if !self.enabled {
            tracing::info!("Claude 桌面端采集已禁用，scanner 不启动");
            return Ok(());
        }

        let dir = match &self.dir {
            Some(d) => d.clone(),
            None => {
                tracing::info!("未找到 Claude 桌面端 local-storage 目录，scanner 空转");
                cancel.cancelled().await;
                return Ok(());
            }
        };

        let (tx, mut rx) = mpsc::channel::<()>(16);

        let tx_clone = tx.clone();
        let mut debouncer = new_debouncer(
            Duration::from_secs(SCAN_DEBOUNCE_SECS),
            move |res: std::result::Result<
                Vec<notify_debouncer_mini::DebouncedEvent>,
                notify::Error,
            >| {
                if let Ok(events) = res {
                    // 一个防抖窗口的多条事件合并成一次扫描触发
                    if events
                        .iter()
                        .any(|e| e.kind == DebouncedEventKind::Any)
                    {
                        let _ = tx_clone.blocking_send(());
                    }
                }
            },
        )?;

        match debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive) {
            Ok(_) => {
                tracing::info!("👁️ Watching local-storage: {:?}", dir);
            }
            Err(e) => {
                tracing::warn!("⚠️ Failed to watch {:?}: {}", dir, e);
            }
        }

        let mut tick = tokio::time::interval(self.poll_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(()) = rx.recv() => {
                    self.scan_and_publish(&dir).await;
                }
                _ = tick.tick() => {
                    self.scan_and_publish(&dir).await;
                }
            }
        }

        drop(debouncer);
        tracing::info!("local-storage scanner 退出");
        Ok(())
    }

    async fn scan_and_publish(&self, dir: &Path) {
        let dir = dir.to_path_buf();
        let uuids = tokio::task::spawn_blocking(move || scan_directory(&dir))
            .await
            .unwrap_or_default();

        if uuids.is_empty() {
            return;
        }

        tracing::debug!("📦 local-storage 扫描: {} 个会话 ID", uuids.len());
        self.notifier.publish(ActivityEvent {
            at: chrono::Utc::now(),
            conversation_ids: uuids.into_iter().collect(),
        });
    }
}
