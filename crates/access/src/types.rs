//! 报告访问服务数据类型定义

use chrono::{DateTime, Duration, Utc};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

/// 验证码用途
///
/// 同一个 identifier 在每种用途下最多只有一个有效验证码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OtpPurpose {
    /// 邮箱所有权验证（第一步）
    EmailVerify,
    /// 报告解密二次验证（第三步）
    ReportDecrypt,
}

impl OtpPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            OtpPurpose::EmailVerify => "email_verify",
            OtpPurpose::ReportDecrypt => "report_decrypt",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "email_verify" => Some(OtpPurpose::EmailVerify),
            "report_decrypt" => Some(OtpPurpose::ReportDecrypt),
            _ => None,
        }
    }
}

impl std::fmt::Display for OtpPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 存储中的验证码记录
#[derive(Clone, PartialEq)]
pub struct OtpRecord {
    /// 每次签发唯一，用于条件更新/回滚，防止误操作被覆盖后的新记录
    pub otp_id: String,
    pub identifier: String,
    pub purpose: OtpPurpose,
    /// 6 位数字验证码
    pub code: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 失败校验次数
    pub attempts: u32,
    /// 是否已被使用
    pub consumed: bool,
    /// 因校验失败自动重发的次数（沿重发链累计）
    pub resend_count: u32,
    /// 解密验证码绑定的报告，只能用于解密这一份报告
    pub report_id: Option<String>,
}

impl std::fmt::Debug for OtpRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpRecord")
            .field("otp_id", &self.otp_id)
            .field("identifier", &self.identifier)
            .field("purpose", &self.purpose)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("attempts", &self.attempts)
            .field("consumed", &self.consumed)
            .field("resend_count", &self.resend_count)
            .field("report_id", &self.report_id)
            .finish_non_exhaustive()
    }
}

impl OtpRecord {
    pub fn new(
        identifier: String,
        purpose: OtpPurpose,
        code: String,
        issued_at: DateTime<Utc>,
        ttl: Duration,
        resend_count: u32,
    ) -> Self {
        Self {
            otp_id: uuid::Uuid::new_v4().to_string(),
            identifier,
            purpose,
            code,
            issued_at,
            expires_at: issued_at + ttl,
            attempts: 0,
            consumed: false,
            resend_count,
            report_id: None,
        }
    }

    /// 绑定到指定报告
    pub fn for_report(mut self, report_id: Option<String>) -> Self {
        self.report_id = report_id;
        self
    }

    /// 记录未绑定报告，或绑定的正是 `report_id`
    pub fn allows_report(&self, report_id: &str) -> bool {
        self.report_id.as_deref().is_none_or(|bound| bound == report_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// 未过期且未被使用
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.consumed && !self.is_expired(now)
    }
}

/// 明文报告的数据来源标记，下游必须据此分支处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataSource {
    /// 来自真实的健康记录
    #[serde(rename = "REAL_DATABASE_COLLECTIONS")]
    RealData,
    /// 用户没有任何健康记录，报告内容为演示数据
    #[serde(rename = "DEMO_DATA_USER_NOT_FOUND")]
    NoDataFound,
    /// 数据源内部故障，报告内容为兜底数据
    #[serde(rename = "FALLBACK_DATA")]
    Fallback,
}

impl DataSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSource::RealData => "REAL_DATABASE_COLLECTIONS",
            DataSource::NoDataFound => "DEMO_DATA_USER_NOT_FOUND",
            DataSource::Fallback => "FALLBACK_DATA",
        }
    }
}

/// 加密后的报告（创建后不可变）
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedReport {
    pub report_id: String,
    /// nonce[12] || ciphertext || tag[16]
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// 存储中的报告记录：密文 + 解密令牌摘要
#[derive(Debug, Clone, PartialEq)]
pub struct StoredReport {
    pub report: EncryptedReport,
    pub user_id: String,
    /// 解密令牌的 SHA-256 摘要（十六进制），令牌明文不落盘
    pub token_digest: String,
    /// 保留期截止时间，None 表示永久保留
    pub expires_at: Option<DateTime<Utc>>,
}

impl StoredReport {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| now > at)
    }
}

/// 解密令牌：与 report_id 一一绑定的高熵随机串（32 字节，十六进制编码）
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecryptionToken(String);

impl std::fmt::Debug for DecryptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("DecryptionToken(***)")
    }
}

impl DecryptionToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 令牌的 SHA-256 摘要（十六进制）
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.0.trim().as_bytes()))
    }

    /// 常数时间比较令牌摘要
    pub fn matches_digest(&self, stored_digest: &str) -> bool {
        let candidate = self.digest();
        candidate.as_bytes().ct_eq(stored_digest.as_bytes()).into()
    }
}

impl From<String> for DecryptionToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// 请求邮箱验证码
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestOtpRequest {
    pub identifier: String,
}

/// 请求解密验证码，验证码只对 `report_id` 有效
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestDecryptOtpRequest {
    pub identifier: String,
    pub report_id: String,
}

/// 校验邮箱验证码
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyEmailOtpRequest {
    pub identifier: String,
    pub otp_code: String,
}

/// 通用操作响应
#[derive(Debug, Serialize, Deserialize)]
pub struct OperationResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// 生成报告请求
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateReportRequest {
    pub user_id: String,
}

/// 生成报告响应
#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateReportResponse {
    pub report_id: String,
    /// 密文（Base64 编码）
    pub ciphertext: String,
    pub decryption_token: DecryptionToken,
    /// 密文字节数
    pub file_size: usize,
    pub created_at: DateTime<Utc>,
}

/// 通过解密验证码解密报告
#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyDecryptOtpRequest {
    pub identifier: String,
    pub otp_code: String,
    pub report_id: String,
}

/// 通过解密令牌解密报告
#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptWithTokenRequest {
    pub report_id: String,
    pub decryption_token: DecryptionToken,
}

/// 解密结果响应
#[derive(Debug, Serialize, Deserialize)]
pub struct DecryptedReportResponse {
    pub success: bool,
    pub decrypted_report: crate::report::PlaintextReport,
}
