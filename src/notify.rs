//! 活动通知器
//!
//! 多订阅者的发布面，只承载一种事件：时间戳 + 会话 UUID 列表。
//! fire-and-forget，无投递确认。

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

/// 广播通道容量（生产速率极低，容量只是兜底）
const CHANNEL_CAPACITY: usize = 16;

/// 活动事件
#[derive(Debug, Clone)]
pub struct ActivityEvent {
    pub at: DateTime<Utc>,
    pub conversation_ids: Vec<String>,
}

/// 活动通知器
pub struct ActivityNotifier {
    tx: broadcast::Sender<ActivityEvent>,
}

impl ActivityNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// 订阅事件流
    pub fn subscribe(&self) -> broadcast::Receiver<ActivityEvent> {
        self.tx.subscribe()
    }

    /// 发布事件；没有订阅者时静默丢弃
    pub fn publish(&self, event: ActivityEvent) {
        let count = event.conversation_ids.len();
        match self.tx.send(event) {
            Ok(receivers) => {
                tracing::debug!("🔔 活动事件: {} 个会话 → {} 个订阅者", count, receivers);
            }
            Err(_) => {
                tracing::debug!("活动事件无订阅者，丢弃");
            }
        }
    }
}

impl Default for ActivityNotifier {
    fn default() -> Self {
        Self::new()
    }
}
