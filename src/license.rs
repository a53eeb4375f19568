//! 许可证协作方
//!
//! 薄壳：离线校验用预埋公钥验许可证 JWT（jsonwebtoken / RS256），
//! 在线吊销检查按配置的天数间隔走身份服务。核心不实现发证逻辑。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::auth::{credential_key, CredentialStore, IdentityApi};
use crate::remote::RemoteError;

/// 许可证状态摘要
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseState {
    /// unlicensed | valid | invalid | revoked
    pub status: String,
    pub plan: Option<String>,
    pub expires_at: Option<String>,
    pub last_revocation_check: Option<String>,
}

impl LicenseState {
    fn unlicensed() -> Self {
        Self {
            status: "unlicensed".to_string(),
            plan: None,
            expires_at: None,
            last_revocation_check: None,
        }
    }
}

/// 许可证 JWT claims
#[derive(Debug, Deserialize)]
struct LicenseClaims {
    #[allow(dead_code)]
    sub: String,
    #[serde(default)]
    plan: Option<String>,
    exp: i64,
}

/// 许可证服务
pub struct LicenseService {
    creds: Arc<dyn CredentialStore>,
    identity: Arc<dyn IdentityApi>,
    public_key_pem: String,
    revocation_check_days: u64,
}

impl LicenseService {
    pub fn new(
        creds: Arc<dyn CredentialStore>,
        identity: Arc<dyn IdentityApi>,
        public_key_pem: String,
        revocation_check_days: u64,
    ) -> Self {
        Self {
            creds,
            identity,
            public_key_pem,
            revocation_check_days,
        }
    }

    /// 当前许可证状态
    pub async fn state(&self) -> LicenseState {
        let jwt = match self.creds.get(credential_key::LICENSE_JWT).await {
            Some(jwt) => jwt,
            None => return LicenseState::unlicensed(),
        };

        let last_check = self
            .creds
            .get(credential_key::LICENSE_LAST_REVOCATION_CHECK)
            .await;

        match self.validate_offline(&jwt) {
            Some(claims) => LicenseState {
                status: "valid".to_string(),
                plan: claims.plan,
                expires_at: DateTime::from_timestamp(claims.exp, 0)
                    .map(|dt| dt.to_rfc3339()),
                last_revocation_check: last_check,
            },
            None => LicenseState {
                status: "invalid".to_string(),
                plan: None,
                expires_at: None,
                last_revocation_check: last_check,
            },
        }
    }

    /// 激活：身份服务换签名 JWT，本地留存 key + JWT
    pub async fn activate(&self, key: &str) -> Result<LicenseState, RemoteError> {
        let jwt = self.identity.activate_license(key).await?;

        self.creds.set(credential_key::LICENSE_KEY, key).await;
        self.creds.set(credential_key::LICENSE_JWT, &jwt).await;
        self.creds
            .set(
                credential_key::LICENSE_LAST_REVOCATION_CHECK,
                &Utc::now().to_rfc3339(),
            )
            .await;

        tracing::info!("📜 许可证已激活");
        Ok(self.state().await)
    }

    /// 是否到了在线吊销检查时间
    pub async fn needs_revocation_check(&self) -> bool {
        if self.creds.get(credential_key::LICENSE_KEY).await.is_none() {
            return false;
        }

        let last = self
            .creds
            .get(credential_key::LICENSE_LAST_REVOCATION_CHECK)
            .await
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        match last {
            Some(ts) => {
                Utc::now() - ts > chrono::Duration::days(self.revocation_check_days as i64)
            }
            None => true,
        }
    }

    /// 在线吊销检查；被吊销时清掉本地 JWT
    pub async fn check_revocation(&self) -> Result<bool, RemoteError> {
        let key = self
            .creds
            .get(credential_key::LICENSE_KEY)
            .await
            .ok_or(RemoteError::AuthMissing)?;

        let status = self.identity.check_revocation(&key).await?;

        self.creds
            .set(
                credential_key::LICENSE_LAST_REVOCATION_CHECK,
                &Utc::now().to_rfc3339(),
            )
            .await;

        if status.revoked {
            tracing::warn!("⚠️ 许可证已被吊销");
            self.creds.delete(credential_key::LICENSE_JWT).await;
        }

        Ok(status.revoked)
    }

    /// 离线校验：公钥已配置时验签 + 过期检查；未配置时只做结构检查
    fn validate_offline(&self, jwt: &str) -> Option<LicenseClaims> {
        if self.public_key_pem.is_empty() {
            // 无公钥时不验签，只解 payload 看是否过期
            let mut validation = Validation::new(Algorithm::RS256);
            validation.insecure_disable_signature_validation();
            let key = DecodingKey::from_secret(&[]);
            return jsonwebtoken::decode::<LicenseClaims>(jwt, &key, &validation)
                .ok()
                .map(|data| data.claims);
        }

        let key = DecodingKey::from_rsa_pem(self.public_key_pem.as_bytes()).ok()?;
        let validation = Validation::new(Algorithm::RS256);
        jsonwebtoken::decode::<LicenseClaims>(jwt, &key, &validation)
            .ok()
            .map(|data| data.claims)
    }
}
