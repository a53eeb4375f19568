//! 认证协作方
//!
//! - [`CredentialStore`]：凭据存取契约（异步、可空返回、不抛错）。
//!   默认实现是 0600 权限的本地 JSON 文件；OS 钥匙串后端在范围之外。
//! - [`IdentityApi`]：身份服务的薄接口，只做 token 刷新。
//! - [`AuthService`]：访问 token 的单互斥锁缓存，续期在拿锁后二次检查。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::remote::{RemoteError, RemoteResult};

/// 凭据 key
pub mod credential_key {
    pub const REFRESH_TOKEN: &str = "refresh_token";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const PAT: &str = "pat";
    pub const TENANT_ID: &str = "tenant_id";
    pub const LICENSE_KEY: &str = "license_key";
    pub const LICENSE_JWT: &str = "license_jwt";
    pub const LICENSE_LAST_REVOCATION_CHECK: &str = "license_last_revocation_check";
}

/// 凭据存储契约：异步、可空返回、从不抛错
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;
    async fn set(&self, key: &str, value: &str);
    async fn delete(&self, key: &str);
}

/// 文件凭据存储（~/.ses/credentials.json，Unix 下 0600）
pub struct FileCredentialStore {
    path: PathBuf,
    cache: Mutex<HashMap<String, String>>,
}

impl FileCredentialStore {
    pub fn new(path: PathBuf) -> Self {
        let cache = match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).unwrap_or_default(),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            cache: Mutex::new(cache),
        }
    }

    fn persist(&self, map: &HashMap<String, String>) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(map) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::warn!("凭据文件写入失败: {}", e);
                    return;
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(
                        &self.path,
                        std::fs::Permissions::from_mode(0o600),
                    );
                }
            }
            Err(e) => {
                tracing::warn!("凭据序列化失败: {}", e);
            }
        }
    }
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.cache.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        let mut map = self.cache.lock().await;
        map.insert(key.to_string(), value.to_string());
        self.persist(&map);
    }

    async fn delete(&self, key: &str) {
        let mut map = self.cache.lock().await;
        map.remove(key);
        self.persist(&map);
    }
}

/// 内存凭据存储（测试用）
#[derive(Default)]
pub struct MemoryCredentialStore {
    cache: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self, key: &str) -> Option<String> {
        self.cache.lock().await.get(key).cloned()
    }

    async fn set(&self, key: &str, value: &str) {
        self.cache
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
    }

    async fn delete(&self, key: &str) {
        self.cache.lock().await.remove(key);
    }
}

/// token 刷新结果
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// 有效期（秒），缺省 3600
    #[serde(default)]
    pub expires_in: Option<i64>,
}

/// 许可证吊销检查结果
#[derive(Debug, Clone, Deserialize)]
pub struct RevocationStatus {
    pub revoked: bool,
}

/// 身份服务薄接口
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// 刷新访问 token
    async fn refresh(&self, refresh_token: &str) -> RemoteResult<TokenPair>;
    /// 激活许可证，返回签名的许可证 JWT
    async fn activate_license(&self, key: &str) -> RemoteResult<String>;
    /// 在线吊销检查
    async fn check_revocation(&self, license_key: &str) -> RemoteResult<RevocationStatus>;
}

/// 身份服务 HTTP 实现
pub struct HttpIdentityApi {
    http: reqwest::Client,
    base_url: String,
}

impl HttpIdentityApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    async fn post_json<B: Serialize, T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
        timeout: Duration,
    ) -> RemoteResult<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status, path));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::Permanent(format!("{}: 响应解析失败: {}", path, e)))
    }
}

#[async_trait]
impl IdentityApi for HttpIdentityApi {
    async fn refresh(&self, refresh_token: &str) -> RemoteResult<TokenPair> {
        self.post_json(
            "/api/token/refresh",
            &serde_json::json!({ "refreshToken": refresh_token }),
            Duration::from_secs(30),
        )
        .await
    }

    async fn activate_license(&self, key: &str) -> RemoteResult<String> {
        #[derive(Deserialize)]
        struct ActivateResponse {
            license: String,
        }

        let resp: ActivateResponse = self
            .post_json(
                "/api/license/activate",
                &serde_json::json!({ "key": key }),
                Duration::from_secs(15),
            )
            .await?;
        Ok(resp.license)
    }

    async fn check_revocation(&self, license_key: &str) -> RemoteResult<RevocationStatus> {
        self.post_json(
            "/api/license/revocation",
            &serde_json::json!({ "key": license_key }),
            Duration::from_secs(15),
        )
        .await
    }
}

/// 认证状态摘要（控制面 /api/status 用）
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthState {
    pub authenticated: bool,
    pub has_pat: bool,
    pub tenant_id: Option<String>,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// 认证服务
pub struct AuthService {
    creds: Arc<dyn CredentialStore>,
    identity: Arc<dyn IdentityApi>,
    /// token 缓存；续期在拿锁后二次检查，避免并发重复刷新
    cached: Mutex<Option<CachedToken>>,
}

impl AuthService {
    pub fn new(creds: Arc<dyn CredentialStore>, identity: Arc<dyn IdentityApi>) -> Self {
        Self {
            creds,
            identity,
            cached: Mutex::new(None),
        }
    }

    /// 取访问 token：缓存有效直接返回，否则用 refresh token 续期
    ///
    /// 拿不到返回 None（Auth-absent：调用方中止本轮，不中止进程）。
    pub async fn access_token(&self) -> Option<String> {
        let mut cached = self.cached.lock().await;

        // 二次检查：等锁期间别的调用可能已经完成续期
        if let Some(c) = cached.as_ref() {
            if c.expires_at > Utc::now() + chrono::Duration::seconds(60) {
                return Some(c.token.clone());
            }
        }

        let refresh_token = self.creds.get(credential_key::REFRESH_TOKEN).await?;

        match self.identity.refresh(&refresh_token).await {
            Ok(pair) => {
                let expires_in = pair.expires_in.unwrap_or(3600);
                let token = pair.access_token.clone();

                self.creds
                    .set(credential_key::ACCESS_TOKEN, &pair.access_token)
                    .await;
                if let Some(new_refresh) = &pair.refresh_token {
                    self.creds
                        .set(credential_key::REFRESH_TOKEN, new_refresh)
                        .await;
                }

                *cached = Some(CachedToken {
                    token: token.clone(),
                    expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
                });
                Some(token)
            }
            Err(e) => {
                tracing::debug!("token 续期失败: {}", e);
                None
            }
        }
    }

    /// 处理浏览器回调送达的 token 对
    pub async fn handle_auth_callback(&self, refresh: &str, access: &str) {
        self.creds.set(credential_key::REFRESH_TOKEN, refresh).await;
        self.creds.set(credential_key::ACCESS_TOKEN, access).await;

        let mut cached = self.cached.lock().await;
        *cached = Some(CachedToken {
            token: access.to_string(),
            // 回调不带有效期，给一个保守的短缓存
            expires_at: Utc::now() + chrono::Duration::minutes(10),
        });

        tracing::info!("🔑 认证回调处理完成");
    }

    /// 清除全部凭据
    pub async fn sign_out(&self) {
        self.creds.delete(credential_key::REFRESH_TOKEN).await;
        self.creds.delete(credential_key::ACCESS_TOKEN).await;
        self.creds.delete(credential_key::PAT).await;

        let mut cached = self.cached.lock().await;
        *cached = None;

        tracing::info!("👋 已登出，凭据已清除");
    }

    /// 失效缓存，强制下次取 token 时续期
    pub async fn trigger_reauth(&self) {
        let mut cached = self.cached.lock().await;
        *cached = None;
    }

    /// 长期 PAT（本地 intake 鉴权用）
    pub async fn pat(&self) -> Option<String> {
        self.creds.get(credential_key::PAT).await
    }

    /// 状态摘要
    pub async fn state(&self) -> AuthState {
        AuthState {
            authenticated: self.creds.get(credential_key::REFRESH_TOKEN).await.is_some(),
            has_pat: self.creds.get(credential_key::PAT).await.is_some(),
            tenant_id: self.creds.get(credential_key::TENANT_ID).await,
        }
    }
}
