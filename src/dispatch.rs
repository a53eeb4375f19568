//! 调度 worker
//!
//! 订阅活动通知器，驱动远端 API 客户端：
//! - 有界队列（容量 5，满则丢最旧）：生产侧永不阻塞
//! - 5 分钟定时 tick 或队列非空时排空队列，UUID 合并去重（大小写不敏感）
//! - 合并集非空 → targeted 同步；为空 → incremental 同步
//! - 进程启动后的第一轮固定 bulk 同步

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use crate::notify::{ActivityEvent, ActivityNotifier};
use crate::remote::RemoteError;

/// 队列容量
const QUEUE_CAPACITY: usize = 5;

/// 兜底周期 tick
const TICK_INTERVAL: Duration = Duration::from_secs(300);

/// 会话同步接口（由远端 API 客户端实现）
#[async_trait]
pub trait ConversationSyncer: Send + Sync {
    /// 全量同步
    async fn sync_bulk(&self) -> Result<usize, RemoteError>;
    /// 指定 UUID 集合同步
    async fn sync_targeted(&self, ids: &[String]) -> Result<usize, RemoteError>;
    /// 增量同步（截至时间内更新过的会话）
    async fn sync_incremental(&self) -> Result<usize, RemoteError>;
}

/// 有界事件队列，满则丢最旧
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    items: VecDeque<ActivityEvent>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity),
        }
    }

    /// 入队；超出容量时丢弃最旧事件（生产者永不阻塞）
    pub fn push(&mut self, event: ActivityEvent) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(event);
    }

    /// 取出全部事件
    pub fn drain(&mut self) -> Vec<ActivityEvent> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// 合并多个事件的 UUID 列表：小写折叠去重，稳定排序
pub fn merge_conversation_ids(events: &[ActivityEvent]) -> Vec<String> {
    let set: BTreeSet<String> = events
        .iter()
        .flat_map(|e| e.conversation_ids.iter())
        .map(|id| id.to_lowercase())
        .collect();
    set.into_iter().collect()
}

/// 调度 worker
pub struct DispatchWorker {
    notifier: Arc<ActivityNotifier>,
    syncer: Arc<dyn ConversationSyncer>,
    queue: EventQueue,
    first_pass_done: bool,
}

impl DispatchWorker {
    pub fn new(notifier: Arc<ActivityNotifier>, syncer: Arc<dyn ConversationSyncer>) -> Self {
        Self {
            notifier,
            syncer,
            queue: EventQueue::new(QUEUE_CAPACITY),
            first_pass_done: false,
        }
    }

    /// 运行直到取消；取消信号在下一个 await 点生效，订阅随作用域释放
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut rx = self.notifier.subscribe();
        let mut tick = tokio::time::interval(TICK_INTERVAL);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            self.queue.push(event);
                            self.process().await;
                        }
                        Err(RecvError::Lagged(n)) => {
                            tracing::warn!("通知器滞后，丢失 {} 条事件", n);
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
                _ = tick.tick() => {
                    self.process().await;
                }
            }
        }

        tracing::info!("调度 worker 退出");
    }

    /// 一轮处理
    async fn process(&mut self) {
        // 进程启动后的第一轮固定 bulk
        if !self.first_pass_done {
            self.first_pass_done = true;
            self.queue.drain();
            match self.syncer.sync_bulk().await {
                Ok(n) => tracing::info!("📥 Bulk 同步完成: {} 个会话", n),
                Err(e) => log_sync_error("bulk", &e),
            }
            return;
        }

        let events = self.queue.drain();
        let ids = merge_conversation_ids(&events);

        if ids.is_empty() {
            match self.syncer.sync_incremental().await {
                Ok(n) if n > 0 => tracing::info!("📥 增量同步: {} 个会话", n),
                Ok(_) => {}
                Err(e) => log_sync_error("incremental", &e),
            }
        } else {
            match self.syncer.sync_targeted(&ids).await {
                Ok(n) => tracing::info!("📥 定向同步: {}/{} 个会话", n, ids.len()),
                Err(e) => log_sync_error("targeted", &e),
            }
        }
    }
}

fn log_sync_error(mode: &str, e: &RemoteError) {
    match e {
        RemoteError::AuthMissing => {
            tracing::debug!("{} 同步跳过: 没有可用凭据", mode);
        }
        other => {
            tracing::warn!("{} 同步失败: {}", mode, other);
        }
    }
}
