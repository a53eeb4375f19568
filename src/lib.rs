//! ses-daemon - 本地会话采集守护进程
//!
//! 常驻用户态的后台进程，从多个本地数据源持续采集 AI 助手会话，
//! 归一化进单一 SQLite 存储，并转发到云端服务；同时作为共驻
//! memory 工具的本地数据提供方（只读 WAL 访问）。
//!
//! # 核心组成
//!
//! - **摄取引擎** (`ingest`)：会话日志增量 tail、local-storage 字节扫描、
//!   Cookie 提取，全部增量、可重启
//! - **本地存储** (`db` / `schema` / `migrations` / `search`)：会话 / 消息 /
//!   观测三层模型，FTS5 索引，版本化迁移，同步台账
//! - **云端同步** (`remote`)：台账驱动的出站 worker + 提供方 API 客户端
//! - **事件协调** (`notify` / `dispatch`)：防抖发现 → 有界队列 → 定向拉取
//! - **本地服务面** (`server`)：回环 intake + 特权控制面
//! - **编排** (`daemon`)：显式装配、单实例、优雅停机
//!
//! # 架构约束
//!
//! 存储写入走进程内唯一写入者（单连接 + 互斥锁）；
//! 进程外读者依赖 SQLite WAL 的快照一致性。

pub mod auth;
pub mod config;
pub mod daemon;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod license;
pub mod migrations;
pub mod notify;
pub mod remote;
pub mod schema;
pub mod search;
pub mod server;
pub mod types;

// Re-exports
pub use config::{DataPaths, Settings};
pub use db::LocalStore;
pub use error::{Error, Result};
pub use search::escape_fts_query;
pub use types::*;

pub use dispatch::{ConversationSyncer, DispatchWorker, EventQueue};
pub use ingest::{CookieExtractor, LocalStorageScanner, OffsetMap, SessionLogWatcher};
pub use notify::{ActivityEvent, ActivityNotifier};
pub use remote::{CloudClient, ProviderClient, RemoteError, SyncWorker};
