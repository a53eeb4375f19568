//! ses-daemon - 本地会话采集守护进程
//!
//! 负责：
//! - 多源摄取（会话日志 / 桌面端 local-storage / intake 推送）
//! - 本地 SQLite 存储 + 全文索引
//! - 云端同步（文档服务 / 记忆服务）
//! - 本地 intake 与控制面

use anyhow::Result;
use ses_daemon::config::{DataPaths, Settings};
use ses_daemon::daemon::Daemon;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ses_daemon=info".parse()?))
        .init();

    tracing::info!("🚀 ses-daemon v{}", env!("CARGO_PKG_VERSION"));

    let paths = DataPaths::default_home();
    let settings = Settings::load(&paths.data_dir);

    let daemon = Daemon::new(paths, settings);
    daemon.run().await?;

    tracing::info!("👋 ses-daemon exiting");
    Ok(())
}
