//! 报告加密引擎
//!
//! 使用 AES-256-GCM 对报告明文做认证加密，任何比特翻转或截断都会导致解密失败。
//! 密钥在进程启动时加载一次，之后只读共享。

// Allow deprecated generic-array::from_slice until aes-gcm upgrades
#![allow(deprecated)]

use crate::error::{AccessError, AccessResult};
use aes_gcm::{
    Aes256Gcm, Nonce,
    aead::{Aead, KeyInit, OsRng, Payload},
};
use base64::prelude::*;
use rand::RngCore;
use tracing::{debug, info, warn};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// 报告密钥来源
#[derive(Debug, Clone)]
pub enum ReportKeySource {
    /// 直接从配置文件读取密钥
    Direct(String),
    /// 从环境变量读取密钥
    Environment(String),
    /// 从文件路径读取密钥
    File(String),
}

/// 报告加密器
///
/// 加密格式: nonce[12] || ciphertext || tag[16]
#[derive(Clone)]
pub struct ReportCipher {
    cipher: Aes256Gcm,
    ephemeral: bool,
}

impl std::fmt::Debug for ReportCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReportCipher")
            .field("algorithm", &"AES-256-GCM")
            .field("ephemeral", &self.ephemeral)
            .finish()
    }
}

impl ReportCipher {
    /// 从密钥来源创建加密器
    pub fn from_key_source(source: &ReportKeySource) -> AccessResult<Self> {
        let key = match source {
            ReportKeySource::Direct(key) => {
                debug!("Loading report key from direct configuration");
                key.clone()
            }
            ReportKeySource::Environment(env_var) => {
                debug!("Loading report key from environment variable: {}", env_var);
                std::env::var(env_var).map_err(|e| {
                    AccessError::Config(format!(
                        "Failed to read report key from environment variable {env_var}: {e}"
                    ))
                })?
            }
            ReportKeySource::File(path) => {
                debug!("Loading report key from file: {}", path);
                std::fs::read_to_string(path).map_err(|e| {
                    AccessError::Config(format!("Failed to read report key from file {path}: {e}"))
                })?
            }
        };

        Self::from_key(&key)
    }

    /// 从密钥字符串创建加密器
    ///
    /// 密钥可以是:
    /// - 64 字符的十六进制字符串 (32 字节)
    /// - 44 字符的 Base64 字符串 (32 字节)
    pub fn from_key(key: &str) -> AccessResult<Self> {
        let key = key.trim();

        let key_bytes = if key.len() == 64 {
            hex::decode(key)
                .map_err(|e| AccessError::Config(format!("Invalid report key hex format: {e}")))?
        } else if key.len() == 44 || key.len() == 43 {
            BASE64_STANDARD
                .decode(key)
                .or_else(|_| BASE64_STANDARD_NO_PAD.decode(key))
                .map_err(|e| {
                    AccessError::Config(format!("Invalid report key base64 format: {e}"))
                })?
        } else {
            return Err(AccessError::Config(format!(
                "Invalid report key length: expected 64 hex chars or 44 base64 chars, got {}",
                key.len()
            )));
        };

        let cipher = Self::cipher_from_bytes(&key_bytes)?;
        info!("Report key loaded successfully");
        Ok(Self {
            cipher,
            ephemeral: false,
        })
    }

    /// 生成仅在本进程生命周期内有效的随机密钥
    ///
    /// 重启后之前生成的报告将无法解密
    pub fn ephemeral() -> AccessResult<Self> {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        let cipher = Self::cipher_from_bytes(&key)?;
        warn!("No report key configured, using an ephemeral key; reports will not survive a restart");
        Ok(Self {
            cipher,
            ephemeral: true,
        })
    }

    fn cipher_from_bytes(key_bytes: &[u8]) -> AccessResult<Aes256Gcm> {
        if key_bytes.len() != 32 {
            return Err(AccessError::Config(format!(
                "Invalid report key size: expected 32 bytes, got {}",
                key_bytes.len()
            )));
        }

        Aes256Gcm::new_from_slice(key_bytes)
            .map_err(|e| AccessError::Internal(format!("Failed to create cipher: {e}")))
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    /// 加密任意字节
    pub fn encrypt(&self, plaintext: &[u8]) -> AccessResult<Vec<u8>> {
        self.encrypt_bound(plaintext, &[])
    }

    /// 解密任意字节
    pub fn decrypt(&self, blob: &[u8]) -> AccessResult<Vec<u8>> {
        self.decrypt_bound(blob, &[])
    }

    /// 加密并绑定附加数据（AAD），解密时必须提供相同的 AAD
    pub fn encrypt_bound(&self, plaintext: &[u8], aad: &[u8]) -> AccessResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|e| AccessError::Internal(format!("Encryption failed: {e}")))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// 解密并校验附加数据，完整性校验失败时不返回任何明文
    pub fn decrypt_bound(&self, blob: &[u8], aad: &[u8]) -> AccessResult<Vec<u8>> {
        if blob.len() < NONCE_LEN + TAG_LEN {
            return Err(AccessError::Integrity(format!(
                "Invalid ciphertext size: expected at least {} bytes, got {}",
                NONCE_LEN + TAG_LEN,
                blob.len()
            )));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| AccessError::Integrity("Authentication tag mismatch".to_string()))
    }

    /// 生成新的报告密钥（用于初始化）
    ///
    /// 返回十六进制格式的 32 字节随机密钥
    pub fn generate_key() -> String {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        hex::encode(key)
    }
}
