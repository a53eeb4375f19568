//! 守护进程编排
//!
//! 构造器式显式装配（无全局注册表）：按依赖顺序拉起各组件，
//! 单实例锁、认证状态检查、统一取消信号、限时排水的优雅停机。

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthService, FileCredentialStore, HttpIdentityApi};
use crate::config::{DataPaths, Settings};
use crate::db::LocalStore;
use crate::dispatch::DispatchWorker;
use crate::ingest::{CookieExtractor, LocalStorageScanner, SessionLogWatcher};
use crate::license::LicenseService;
use crate::notify::ActivityNotifier;
use crate::remote::{CloudClient, ProviderClient, SyncWorker};
use crate::server::{control, intake, ControlState, IntakeState};

/// 每个组件的停机排水窗口
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 守护进程
pub struct Daemon {
    paths: DataPaths,
    settings: Settings,
}

impl Daemon {
    pub fn new(paths: DataPaths, settings: Settings) -> Self {
        Self { paths, settings }
    }

    /// 运行到收到停机信号（OS 中断或控制面 /api/shutdown）
    pub async fn run(self) -> Result<()> {
        std::fs::create_dir_all(&self.paths.data_dir).context("创建数据目录失败")?;

        // 单实例：锁被占用不是错误，提示后正常退出
        if instance_already_running(&self.paths) {
            eprintln!("ses-daemon 已在运行，本实例退出");
            return Ok(());
        }
        write_pid_file(&self.paths)?;

        // ---- 依赖装配（叶子在前）----
        let store = Arc::new(LocalStore::connect(self.paths.db_path())?);

        let creds = Arc::new(FileCredentialStore::new(self.paths.credentials_path()));
        let identity = Arc::new(HttpIdentityApi::new(self.settings.identity_base_url.clone()));
        let auth = Arc::new(AuthService::new(creds.clone(), identity.clone()));
        let license = Arc::new(LicenseService::new(
            creds,
            identity,
            self.settings.license_public_key_pem.clone(),
            self.settings.license_revocation_check_days,
        ));

        // 启动时认证状态检查
        let auth_state = auth.state().await;
        if auth_state.authenticated {
            tracing::info!("🔑 已有登录凭据");
        } else {
            tracing::info!("尚未登录，云端同步将跳过");
        }

        let notifier = Arc::new(ActivityNotifier::new());
        let cookies = Arc::new(CookieExtractor::new());
        let provider = Arc::new(ProviderClient::new(store.clone(), cookies));
        let cloud = Arc::new(CloudClient::new());

        let cancel = CancellationToken::new();
        let mut components: Vec<(&'static str, tokio::task::JoinHandle<()>)> = Vec::new();

        // ---- 组件启动 ----
        {
            let watcher = SessionLogWatcher::new(
                store.clone(),
                DataPaths::claude_code_root(),
                self.paths.watcher_positions_path(),
                self.settings.enable_claude_code_sync,
                self.settings.polling_interval_seconds,
            );
            let cancel = cancel.clone();
            components.push((
                "session-log-watcher",
                tokio::spawn(async move {
                    if let Err(e) = watcher.run(cancel).await {
                        tracing::error!("会话日志 watcher 异常退出: {}", e);
                    }
                }),
            ));
        }

        {
            let scanner = LocalStorageScanner::new(
                DataPaths::claude_desktop_storage_root(),
                notifier.clone(),
                self.settings.enable_claude_desktop_sync,
                self.settings.polling_interval_seconds,
            );
            let cancel = cancel.clone();
            components.push((
                "local-storage-scanner",
                tokio::spawn(async move {
                    if let Err(e) = scanner.run(cancel).await {
                        tracing::error!("local-storage scanner 异常退出: {}", e);
                    }
                }),
            ));
        }

        {
            let worker = DispatchWorker::new(notifier.clone(), provider);
            let cancel = cancel.clone();
            components.push((
                "dispatch-worker",
                tokio::spawn(async move {
                    worker.run(cancel).await;
                }),
            ));
        }

        {
            let worker = SyncWorker::new(store.clone(), auth.clone(), cloud);
            let cancel = cancel.clone();
            components.push((
                "sync-worker",
                tokio::spawn(async move {
                    worker.run(cancel).await;
                }),
            ));
        }

        {
            // 许可证吊销检查：按配置的天数间隔，到期才发起在线请求
            let license = license.clone();
            let cancel = cancel.clone();
            components.push((
                "license-checker",
                tokio::spawn(async move {
                    let mut tick = tokio::time::interval(Duration::from_secs(6 * 3600));
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tick.tick() => {
                                if license.needs_revocation_check().await {
                                    if let Err(e) = license.check_revocation().await {
                                        tracing::debug!("吊销检查失败: {}", e);
                                    }
                                }
                            }
                        }
                    }
                }),
            ));
        }

        {
            let state = Arc::new(IntakeState {
                store: store.clone(),
                auth: auth.clone(),
            });
            let cancel = cancel.clone();
            components.push((
                "intake",
                tokio::spawn(async move {
                    if let Err(e) = intake::run(state, cancel).await {
                        tracing::error!("intake 服务异常退出: {}", e);
                    }
                }),
            ));
        }

        {
            let state = Arc::new(ControlState {
                store: store.clone(),
                auth: auth.clone(),
                license: license.clone(),
                shutdown: cancel.clone(),
                started_at: Instant::now(),
            });
            let cancel = cancel.clone();
            let socket_path = self.paths.control_socket_path();
            components.push((
                "control-plane",
                tokio::spawn(async move {
                    #[cfg(unix)]
                    if let Err(e) = control::run_unix(&socket_path, state, cancel).await {
                        tracing::error!("控制面异常退出: {}", e);
                    }
                    #[cfg(windows)]
                    if let Err(e) = control::run_windows(state, cancel).await {
                        tracing::error!("控制面异常退出: {}", e);
                    }
                    #[cfg(not(any(unix, windows)))]
                    let _ = (socket_path, state, cancel);
                }),
            ));
        }

        tracing::info!("🚀 ses-daemon 启动完成，{} 个组件", components.len());

        // ---- 等待停机信号 ----
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("收到中断信号，准备退出...");
                cancel.cancel();
            }
            _ = cancel.cancelled() => {
                // 控制面 /api/shutdown 触发
            }
        }

        // ---- 限时排水 ----
        for (name, handle) in components {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(_) => tracing::debug!("组件 {} 已退出", name),
                Err(_) => {
                    tracing::warn!("⏰ 组件 {} 超过排水窗口，放弃等待", name);
                }
            }
        }

        cleanup(&self.paths);
        tracing::info!("🧹 ses-daemon 退出完成");
        Ok(())
    }
}

/// 检查是否已有实例在运行（pid 文件 + 进程存活探测）
pub fn instance_already_running(paths: &DataPaths) -> bool {
    let pid_path = paths.pid_path();
    if !pid_path.exists() {
        return false;
    }

    let pid_str = match std::fs::read_to_string(&pid_path) {
        Ok(s) => s,
        Err(_) => return false,
    };

    let pid: i32 = match pid_str.trim().parse() {
        Ok(p) => p,
        Err(_) => return false,
    };

    #[cfg(unix)]
    {
        unsafe { libc::kill(pid, 0) == 0 }
    }

    #[cfg(not(unix))]
    {
        // 没有廉价的存活探测，残留 pid 文件按过期处理
        let _ = pid;
        false
    }
}

fn write_pid_file(paths: &DataPaths) -> Result<()> {
    let pid = std::process::id();
    let pid_path = paths.pid_path();
    std::fs::write(&pid_path, pid.to_string())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&pid_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::debug!("📝 写入 PID 文件: {:?} (pid={})", pid_path, pid);
    Ok(())
}

/// 退出清理：pid 文件与残留 socket
fn cleanup(paths: &DataPaths) {
    let pid_path = paths.pid_path();
    if pid_path.exists() {
        let _ = std::fs::remove_file(&pid_path);
    }

    let socket_path = paths.control_socket_path();
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
}
