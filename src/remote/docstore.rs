//! 云端客户端：文档服务 + 记忆服务
//!
//! 同步 worker 的两个投递目标。文档服务成功返回文档句柄；
//! 记忆服务是 best-effort，401/403 表示用户没有该 scope，不算失败。

use std::time::Duration;

use serde::Serialize;

use super::{RemoteError, RemoteResult};

/// 文档服务默认地址
pub const DEFAULT_DOC_SERVICE_URL: &str = "https://docs.ses.dev";

/// 记忆服务默认地址
pub const DEFAULT_MEMORY_SERVICE_URL: &str = "https://memory.ses.dev";

/// 文档服务超时
const DOC_TIMEOUT: Duration = Duration::from_secs(30);

/// 记忆服务超时
const MEMORY_TIMEOUT: Duration = Duration::from_secs(15);

/// 会话转写的文档类型
const DOCUMENT_TYPE_ID: i64 = 4;

/// 文档创建请求
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentRequest {
    pub tenant_id: Option<String>,
    pub document_type_id: i64,
    pub title: String,
    pub description: String,
    pub content_hash: String,
    pub mime_type: String,
    /// 字符串化的 JSON，内含 transcript
    pub metadata: String,
    pub tags: Vec<String>,
    pub created_by: String,
}

impl DocumentRequest {
    pub fn new(
        tenant_id: Option<String>,
        title: String,
        description: String,
        content_hash: String,
        transcript: &str,
        tags: Vec<String>,
    ) -> Self {
        let metadata = serde_json::json!({ "transcript": transcript }).to_string();
        Self {
            tenant_id,
            document_type_id: DOCUMENT_TYPE_ID,
            title,
            description,
            content_hash,
            mime_type: "application/json".to_string(),
            metadata,
            tags,
            created_by: "ses-local".to_string(),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct DocumentResponse {
    id: String,
}

/// 云端客户端
pub struct CloudClient {
    doc_http: reqwest::Client,
    memory_http: reqwest::Client,
    doc_base_url: String,
    memory_base_url: String,
}

impl CloudClient {
    pub fn new() -> Self {
        Self::with_base_urls(DEFAULT_DOC_SERVICE_URL, DEFAULT_MEMORY_SERVICE_URL)
    }

    /// 指定服务地址（测试用）
    pub fn with_base_urls(
        doc_base_url: impl Into<String>,
        memory_base_url: impl Into<String>,
    ) -> Self {
        let doc_http = reqwest::Client::builder()
            .timeout(DOC_TIMEOUT)
            .build()
            .unwrap_or_default();
        let memory_http = reqwest::Client::builder()
            .timeout(MEMORY_TIMEOUT)
            .build()
            .unwrap_or_default();

        Self {
            doc_http,
            memory_http,
            doc_base_url: doc_base_url.into(),
            memory_base_url: memory_base_url.into(),
        }
    }

    /// 创建文档，返回云端文档 id
    pub async fn create_document(
        &self,
        token: &str,
        request: &DocumentRequest,
    ) -> RemoteResult<String> {
        let url = format!("{}/api/documents", self.doc_base_url);
        let response = self
            .doc_http
            .post(&url)
            .bearer_auth(token)
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status, "documents"));
        }

        let body: DocumentResponse = response
            .json()
            .await
            .map_err(|e| RemoteError::Permanent(format!("文档响应解析失败: {}", e)))?;

        Ok(body.id)
    }

    /// 投递一条记忆（best-effort）
    ///
    /// 401/403 归类为 AuthDenied，调用方按"功能不可用"静默处理。
    pub async fn retain_memory(
        &self,
        token: &str,
        content: &str,
        tags: &[String],
    ) -> RemoteResult<()> {
        let url = format!("{}/api/memory/retain", self.memory_base_url);
        let body = serde_json::json!({
            "content": content,
            "importance": 3,
            "tags": tags,
        });

        let response = self
            .memory_http
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::from_status(status, "memory/retain"));
        }

        Ok(())
    }
}

impl Default for CloudClient {
    fn default() -> Self {
        Self::new()
    }
}
