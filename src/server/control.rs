//! 特权控制面
//!
//! Unix 下是 ~/.ses/daemon.sock（0600），Windows 下是命名管道，
//! 平台传输之上跑 HTTP/1.1 语义。错误统一 `{"error": "…"}` 包络。

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthService;
use crate::db::LocalStore;
use crate::license::LicenseService;
use crate::remote::RemoteError;

/// Windows 命名管道名
#[cfg(windows)]
pub const PIPE_NAME: &str = r"\\.\pipe\ses-local-daemon";

/// 控制面共享状态
pub struct ControlState {
    pub store: Arc<LocalStore>,
    pub auth: Arc<AuthService>,
    pub license: Arc<LicenseService>,
    /// 优雅停机信号（/api/shutdown 触发）
    pub shutdown: CancellationToken,
    pub started_at: Instant,
}

/// 构建路由
pub fn router(state: Arc<ControlState>) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/license", get(license_state))
        .route("/api/license/activate", post(license_activate))
        .route("/api/signout", post(signout))
        .route("/api/shutdown", post(shutdown))
        .fallback(fallback)
        .with_state(state)
}

async fn fallback() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "not found" })),
    )
}

/// GET /api/status
async fn status(State(state): State<Arc<ControlState>>) -> Response {
    let auth = state.auth.state().await;
    let license = state.license.state().await;
    let stats = match state.store.stats() {
        Ok(s) => json!(s),
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    Json(json!({
        "auth": auth,
        "license": license,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
        "stats": stats,
    }))
    .into_response()
}

/// GET /api/license
async fn license_state(State(state): State<Arc<ControlState>>) -> Response {
    Json(state.license.state().await).into_response()
}

#[derive(Debug, Deserialize)]
struct ActivateBody {
    key: String,
}

/// POST /api/license/activate
async fn license_activate(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<ActivateBody>,
) -> Response {
    match state.license.activate(&body.key).await {
        Ok(license) => Json(license).into_response(),
        Err(e) => remote_error_response(&e),
    }
}

/// POST /api/signout
async fn signout(State(state): State<Arc<ControlState>>) -> Response {
    state.auth.sign_out().await;
    Json(json!({ "status": "ok" })).into_response()
}

/// POST /api/shutdown
async fn shutdown(State(state): State<Arc<ControlState>>) -> Response {
    tracing::info!("收到控制面停机请求");
    state.shutdown.cancel();
    Json(json!({ "status": "shutting_down" })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

fn remote_error_response(e: &RemoteError) -> Response {
    let status = match e {
        RemoteError::AuthMissing | RemoteError::AuthDenied => StatusCode::UNAUTHORIZED,
        RemoteError::Transient(_) => StatusCode::BAD_GATEWAY,
        RemoteError::Permanent(_) => StatusCode::BAD_REQUEST,
    };
    error_response(status, &e.to_string())
}

/// Unix socket 上运行控制面；残留 socket 文件在启动时清除
#[cfg(unix)]
pub async fn run_unix(
    socket_path: &std::path::Path,
    state: Arc<ControlState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    use tower::Service;

    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = tokio::net::UnixListener::bind(socket_path)?;
    std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;

    tracing::info!("🔌 控制面监听: {:?}", socket_path);

    let app = router(state);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let app = app.clone();
                        tokio::spawn(async move {
                            let socket = hyper_util::rt::TokioIo::new(stream);
                            let service = hyper::service::service_fn(
                                move |req: hyper::Request<hyper::body::Incoming>| {
                                    app.clone().call(req)
                                },
                            );
                            if let Err(e) = hyper::server::conn::http1::Builder::new()
                                .serve_connection(socket, service)
                                .await
                            {
                                tracing::debug!("控制面连接结束: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("接受连接失败: {}", e);
                    }
                }
            }
        }
    }

    let _ = std::fs::remove_file(socket_path);
    tracing::info!("控制面退出");
    Ok(())
}

/// 命名管道上运行控制面（Windows）
#[cfg(windows)]
pub async fn run_windows(
    state: Arc<ControlState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    use tokio::net::windows::named_pipe::ServerOptions;
    use tower::Service;

    let app = router(state);
    let mut server = ServerOptions::new()
        .first_pipe_instance(true)
        .create(PIPE_NAME)?;

    tracing::info!("🔌 控制面监听: {}", PIPE_NAME);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = server.connect() => {
                result?;
                let connected = server;
                server = ServerOptions::new().create(PIPE_NAME)?;

                let app = app.clone();
                tokio::spawn(async move {
                    let socket = hyper_util::rt::TokioIo::new(connected);
                    let service = hyper::service::service_fn(
                        move |req: hyper::Request<hyper::body::Incoming>| {
                            app.clone().call(req)
                        },
                    );
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(socket, service)
                        .await
                    {
                        tracing::debug!("控制面连接结束: {}", e);
                    }
                });
            }
        }
    }

    tracing::info!("控制面退出");
    Ok(())
}
