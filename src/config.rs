//! 守护进程配置
//!
//! 配置从 `~/.ses/config.json` 读取（不存在则全部取默认值），
//! `SES_IDENTITY_BASE_URL` 环境变量可覆盖身份服务地址。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// 身份服务默认地址
pub const DEFAULT_IDENTITY_BASE_URL: &str = "https://identity.ses.dev";

/// 本地 intake 监听端口（固定）
pub const INTAKE_PORT: u16 = 37780;

/// 守护进程配置项
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// 身份服务基础 URL
    pub identity_base_url: String,
    /// 是否启用 Claude Code 会话日志采集（§ session-log watcher）
    pub enable_claude_code_sync: bool,
    /// 是否启用 Claude 桌面端 local-storage 扫描
    pub enable_claude_desktop_sync: bool,
    /// 周期性重扫间隔（秒）
    pub polling_interval_seconds: u64,
    /// 预置的许可证公钥（PEM，离线校验用；空表示未配置）
    pub license_public_key_pem: String,
    /// 在线吊销检查间隔（天）
    pub license_revocation_check_days: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            identity_base_url: DEFAULT_IDENTITY_BASE_URL.to_string(),
            enable_claude_code_sync: true,
            enable_claude_desktop_sync: true,
            polling_interval_seconds: 30,
            license_public_key_pem: String::new(),
            license_revocation_check_days: 7,
        }
    }
}

impl Settings {
    /// 从数据目录下的 config.json 加载；文件缺失或损坏时退回默认值
    pub fn load(data_dir: &std::path::Path) -> Self {
        let path = data_dir.join("config.json");
        let mut settings = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<Settings>(&text) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("⚠️ 配置文件解析失败，使用默认值: {}", e);
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        };

        if let Ok(url) = std::env::var("SES_IDENTITY_BASE_URL") {
            if !url.is_empty() {
                settings.identity_base_url = url;
            }
        }

        settings
    }
}

/// 数据目录布局（~/.ses）
#[derive(Debug, Clone)]
pub struct DataPaths {
    /// 数据目录（默认 ~/.ses）
    pub data_dir: PathBuf,
}

impl DataPaths {
    /// 默认数据目录 ~/.ses
    pub fn default_home() -> Self {
        let data_dir = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ses");
        Self { data_dir }
    }

    /// 指定数据目录（测试用）
    pub fn at(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// 数据库路径
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("local.db")
    }

    /// Watcher 偏移量文件
    pub fn watcher_positions_path(&self) -> PathBuf {
        self.data_dir.join("watcher-positions.json")
    }

    /// 控制面 socket 路径（Unix）
    pub fn control_socket_path(&self) -> PathBuf {
        self.data_dir.join("daemon.sock")
    }

    /// PID 文件路径（单实例锁）
    pub fn pid_path(&self) -> PathBuf {
        self.data_dir.join("daemon.pid")
    }

    /// 凭据文件路径
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    /// Claude Code 会话日志根目录（~/.claude/projects）
    pub fn claude_code_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".claude")
            .join("projects")
    }

    /// Claude 桌面端 local-storage 目录（含 *.ldb 文件）
    pub fn claude_desktop_storage_root() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            dirs::home_dir().map(|h| {
                h.join("Library/Application Support/Claude/Local Storage/leveldb")
            })
        }
        #[cfg(target_os = "windows")]
        {
            dirs::data_dir().map(|d| d.join("Claude").join("Local Storage").join("leveldb"))
        }
        #[cfg(all(not(target_os = "macos"), not(target_os = "windows")))]
        {
            dirs::config_dir().map(|d| d.join("Claude").join("Local Storage").join("leveldb"))
        }
    }

    /// Claude 桌面端 Cookie 数据库（SQLite）
    pub fn claude_desktop_cookie_db() -> Option<PathBuf> {
        #[cfg(target_os = "macos")]
        {
            dirs::home_dir().map(|h| h.join("Library/Application Support/Claude/Cookies"))
        }
        #[cfg(target_os = "windows")]
        {
            dirs::data_dir().map(|d| d.join("Claude").join("Network").join("Cookies"))
        }
        #[cfg(all(not(target_os = "macos"), not(target_os = "windows")))]
        {
            None
        }
    }
}
