//! 远端访问层
//!
//! 所有远端调用返回 [`RemoteError`] 区分错误种类，调用方按种类决定
//! 日志级别与重试策略；任何远端错误都不致命。

pub mod docstore;
pub mod provider;
pub mod sync_worker;

use thiserror::Error;

pub use docstore::{CloudClient, DocumentRequest};
pub use provider::{ProviderClient, RateLimiter};
pub use sync_worker::{format_transcript, SyncWorker};

/// 远端调用错误种类
#[derive(Debug, Error)]
pub enum RemoteError {
    /// 暂时性失败（网络异常 / 5xx / 429）：下一轮重试
    #[error("暂时性远端错误: {0}")]
    Transient(String),

    /// 无可用凭据：中止本轮，不中止进程
    #[error("缺少访问凭据")]
    AuthMissing,

    /// 凭据被拒（401/403）：可选端点视为功能不可用
    #[error("凭据被拒绝")]
    AuthDenied,

    /// 永久性失败（其余 4xx / 响应格式错误）
    #[error("永久性远端错误: {0}")]
    Permanent(String),
}

impl RemoteError {
    /// 按 HTTP 状态码归类非 2xx 响应
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            RemoteError::AuthDenied
        } else if status.is_server_error()
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        {
            RemoteError::Transient(format!("{}: HTTP {}", context, status))
        } else {
            RemoteError::Permanent(format!("{}: HTTP {}", context, status))
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        RemoteError::Transient(e.to_string())
    }
}

/// 远端调用 Result
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;

        assert!(matches!(
            RemoteError::from_status(StatusCode::UNAUTHORIZED, "x"),
            RemoteError::AuthDenied
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::FORBIDDEN, "x"),
            RemoteError::AuthDenied
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::INTERNAL_SERVER_ERROR, "x"),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::TOO_MANY_REQUESTS, "x"),
            RemoteError::Transient(_)
        ));
        assert!(matches!(
            RemoteError::from_status(StatusCode::NOT_FOUND, "x"),
            RemoteError::Permanent(_)
        ));
    }
}
