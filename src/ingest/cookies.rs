//! 第三方桌面客户端 Cookie 提取
//!
//! 从 Claude 桌面端的 Cookie 库（SQLite）取出会话 cookie 供远端 API 使用。
//! 所有失败路径一律返回 None，绝不向上抛错：cookie 拿不到只是功能不可用。
//!
//! 平台差异：
//! - macOS：钥匙串取 "Claude Safe Storage" 口令，PBKDF2-HMAC-SHA1 派生
//!   AES-128 key，AES-CBC 解密（IV 全零，PKCS7）
//! - Windows：DPAPI（用户作用域）
//! - Linux：无实现，返回 None

use std::path::PathBuf;

/// 按序尝试的 cookie 名
const COOKIE_CANDIDATES: &[&str] = &[
    "sessionKey",
    "__Secure-next-auth.session-token",
    "sessionToken",
];

/// 钥匙串条目名（macOS）
#[cfg(target_os = "macos")]
const KEYCHAIN_SERVICE: &str = "Claude Safe Storage";

/// Cookie 提取器
pub struct CookieExtractor {
    db_path: Option<PathBuf>,
}

impl CookieExtractor {
    pub fn new() -> Self {
        Self {
            db_path: crate::config::DataPaths::claude_desktop_cookie_db(),
        }
    }

    /// 指定 Cookie 库路径（测试用）
    pub fn with_db_path(db_path: PathBuf) -> Self {
        Self {
            db_path: Some(db_path),
        }
    }

    /// 提取会话 cookie；任何失败返回 None
    pub async fn session_cookie(&self) -> Option<String> {
        let db_path = self.db_path.clone()?;
        if !db_path.exists() {
            return None;
        }

        // Cookie 库被桌面端锁着，拷贝后只读打开
        let encrypted = tokio::task::spawn_blocking(move || read_cookie_value(&db_path))
            .await
            .ok()??;

        decrypt_cookie(&encrypted).await
    }
}

impl Default for CookieExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// 从 Cookie 库读取第一个命中的候选 cookie 的加密值
fn read_cookie_value(db_path: &std::path::Path) -> Option<Vec<u8>> {
    let temp = tempfile::NamedTempFile::new().ok()?;
    std::fs::copy(db_path, temp.path()).ok()?;

    let conn = rusqlite::Connection::open_with_flags(
        temp.path(),
        rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
    )
    .ok()?;

    for name in COOKIE_CANDIDATES {
        let row: Option<(Vec<u8>, String)> = conn
            .query_row(
                r#"
                SELECT encrypted_value, value FROM cookies
                WHERE host_key LIKE '%claude.ai' AND name = ?1
                LIMIT 1
                "#,
                rusqlite::params![name],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .ok();

        if let Some((encrypted, plain)) = row {
            if !encrypted.is_empty() {
                return Some(encrypted);
            }
            if !plain.is_empty() {
                return Some(plain.into_bytes());
            }
        }
    }

    None
}

/// 解密 cookie 值
async fn decrypt_cookie(blob: &[u8]) -> Option<String> {
    if let Some(stripped) = strip_version_prefix(blob) {
        return decrypt_platform(stripped).await;
    }

    // 无版本前缀：可能本来就是明文
    printable_plaintext(blob)
}

/// v10/v11 前缀剥离；非加密格式返回 None
pub(crate) fn strip_version_prefix(blob: &[u8]) -> Option<&[u8]> {
    if blob.len() > 3 && (blob.starts_with(b"v10") || blob.starts_with(b"v11")) {
        Some(&blob[3..])
    } else {
        None
    }
}

/// 明文判定：可打印 UTF-8、无 NUL、长度 > 10
pub(crate) fn printable_plaintext(blob: &[u8]) -> Option<String> {
    if blob.len() <= 10 || blob.contains(&0) {
        return None;
    }
    let text = std::str::from_utf8(blob).ok()?;
    if text.chars().all(|c| !c.is_control() || c == '\t') {
        Some(text.to_string())
    } else {
        None
    }
}

#[cfg(target_os = "macos")]
async fn decrypt_platform(data: &[u8]) -> Option<String> {
    use aes::cipher::block_padding::Pkcs7;
    use aes::cipher::{BlockDecryptMut, KeyIvInit};

    type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

    // CI 环境没有钥匙串可用，直接短路
    if std::env::var("CI").map(|v| v == "true").unwrap_or(false) {
        return None;
    }

    let passphrase = keychain_passphrase().await?;

    let mut key = [0u8; 16];
    pbkdf2::pbkdf2_hmac::<sha1::Sha1>(
        passphrase.trim().as_bytes(),
        b"saltysalt",
        1003,
        &mut key,
    );

    let iv = [0u8; 16];
    let mut buf = data.to_vec();
    let plain = Aes128CbcDec::new(&key.into(), &iv.into())
        .decrypt_padded_mut::<Pkcs7>(&mut buf)
        .ok()?;

    String::from_utf8(plain.to_vec()).ok()
}

/// 通过系统钥匙串工具取加密口令（5 秒超时）
#[cfg(target_os = "macos")]
async fn keychain_passphrase() -> Option<String> {
    use std::time::Duration;

    let output = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new("security")
            .args(["find-generic-password", "-w", "-s", KEYCHAIN_SERVICE])
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }

    String::from_utf8(output.stdout).ok()
}

#[cfg(windows)]
async fn decrypt_platform(data: &[u8]) -> Option<String> {
    let data = data.to_vec();
    tokio::task::spawn_blocking(move || dpapi_unprotect(&data))
        .await
        .ok()?
}

/// DPAPI 解密（用户作用域）
#[cfg(windows)]
fn dpapi_unprotect(data: &[u8]) -> Option<String> {
    use windows::Win32::Foundation::LocalFree;
    use windows::Win32::Security::Cryptography::{CryptUnprotectData, CRYPT_INTEGER_BLOB};

    unsafe {
        let input = CRYPT_INTEGER_BLOB {
            cbData: data.len() as u32,
            pbData: data.as_ptr() as *mut u8,
        };
        let mut output = CRYPT_INTEGER_BLOB::default();

        CryptUnprotectData(&input, None, None, None, None, 0, &mut output).ok()?;

        let plain =
            std::slice::from_raw_parts(output.pbData, output.cbData as usize).to_vec();
        let _ = LocalFree(windows::Win32::Foundation::HLOCAL(output.pbData as _));

        String::from_utf8(plain).ok()
    }
}

#[cfg(all(not(target_os = "macos"), not(windows)))]
async fn decrypt_platform(_data: &[u8]) -> Option<String> {
    // Linux 路径刻意缺席：需要对接 secret-service 才可用
    None
}
