//! 摄取引擎
//!
//! 一组协作的 watcher，把异构本地数据源（JSONL 会话日志、桌面端
//! local-storage、Cookie 库）归一化进本地存储：
//! - `session_log`：增量 tail 会话日志，提取消息与结构化观测
//! - `local_storage`：字节扫描桌面端存储，发现会话 UUID
//! - `cookies`：提取远端 API 所需的会话 cookie

pub mod cookies;
pub mod extract;
pub mod local_storage;
pub mod offsets;
pub mod session_log;

pub use cookies::CookieExtractor;
pub use extract::{derive_title, is_subagent_path, Extraction, Extractor};
pub use local_storage::{extract_session_ids, scan_directory, LocalStorageScanner};
pub use offsets::OffsetMap;
pub use session_log::{process_file, SessionLogWatcher};
