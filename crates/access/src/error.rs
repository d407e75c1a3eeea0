//! 报告访问服务错误定义
//!
//! 所有错误对调用方都是可重试的：客户端重新执行对应步骤即可，
//! 不会导致进程退出。

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// 自动重发新验证码时返回给客户端的 action 标记
pub const ACTION_NEW_OTP_SENT: &str = "new_otp_sent";

/// 报告访问服务错误类型
#[derive(Error, Debug)]
pub enum AccessError {
    /// 标识符或验证码格式错误（在访问存储之前拒绝）
    #[error("Validation error: {0}")]
    Validation(String),

    /// 不存在该 (identifier, purpose) 的验证码记录
    #[error("No one-time code found for {identifier} ({purpose})")]
    OtpNotFound { identifier: String, purpose: String },

    /// 验证码已过期或已被使用
    #[error("One-time code expired or already consumed")]
    OtpExpired,

    /// 验证码不匹配，仍可重试
    #[error("One-time code mismatch, {remaining} attempt(s) remaining")]
    OtpMismatch { remaining: u32 },

    /// 验证码不匹配，已自动签发并发送新的验证码
    #[error("One-time code mismatch, a new code has been sent")]
    NewOtpSent,

    /// 验证码投递失败（签发已回滚）
    #[error("Notification error: {0}")]
    Notification(String),

    /// 密文被篡改或密钥错误，解密失败
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// 解密令牌与报告不匹配
    #[error("Decryption token does not match report {0}")]
    InvalidToken(String),

    /// 报告不存在（或已超出保留期）
    #[error("Report not found: report_id={0}")]
    ReportNotFound(String),

    /// 数据库错误
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// 内部服务器错误
    #[error("Internal server error: {0}")]
    Internal(String),

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// Base64 编码/解码错误
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// JSON 序列化/反序列化错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP 客户端错误
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),
}

impl AccessError {
    /// 错误分类标签（用于指标和日志）
    pub fn kind(&self) -> &'static str {
        match self {
            AccessError::Validation(_) => "validation",
            AccessError::OtpNotFound { .. } | AccessError::ReportNotFound(_) => "not_found",
            AccessError::OtpExpired => "expired",
            AccessError::OtpMismatch { .. } | AccessError::NewOtpSent => "mismatch",
            AccessError::Notification(_) => "notification",
            AccessError::Integrity(_) => "integrity",
            AccessError::InvalidToken(_) => "token_invalid",
            _ => "internal",
        }
    }

    /// 对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        self.status_and_message().0
    }

    fn status_and_message(&self) -> (StatusCode, &'static str) {
        match self {
            AccessError::Validation(_) | AccessError::Base64(_) | AccessError::Json(_) => {
                (StatusCode::BAD_REQUEST, "Invalid request parameters")
            }
            AccessError::OtpNotFound { .. } => (
                StatusCode::NOT_FOUND,
                "No active code for this identifier, please request a new one",
            ),
            AccessError::OtpExpired => (
                StatusCode::GONE,
                "Code expired or already used, please request a new one",
            ),
            AccessError::OtpMismatch { .. } => (StatusCode::BAD_REQUEST, "Invalid code"),
            AccessError::NewOtpSent => (
                StatusCode::BAD_REQUEST,
                "Invalid code. A new code has been sent, please check your email",
            ),
            AccessError::Notification(_) => (
                StatusCode::BAD_GATEWAY,
                "Failed to deliver the code, please try again",
            ),
            AccessError::Integrity(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Report could not be decrypted",
            ),
            AccessError::InvalidToken(_) => (StatusCode::FORBIDDEN, "Invalid decryption token"),
            AccessError::ReportNotFound(_) => {
                // 不泄露具体的 report_id
                (StatusCode::NOT_FOUND, "Report not found")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error"),
        }
    }
}

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let (status, error_message) = self.status_and_message();

        match &self {
            AccessError::Integrity(_) => tracing::warn!("Decryption rejected: {}", self),
            AccessError::Notification(_) => tracing::warn!("Code delivery failed: {}", self),
            AccessError::Database(_)
            | AccessError::Internal(_)
            | AccessError::Config(_)
            | AccessError::HttpClient(_) => {
                // 不向客户端暴露内部错误详情
                tracing::error!("Internal error: {:?}", self);
            }
            _ => tracing::debug!("Request rejected: {}", self),
        }

        let mut body = json!({
            "success": false,
            "error": error_message,
            "code": status.as_u16()
        });

        match &self {
            AccessError::NewOtpSent => {
                body["action"] = json!(ACTION_NEW_OTP_SENT);
            }
            AccessError::OtpMismatch { remaining } => {
                body["attempts_remaining"] = json!(remaining);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

/// 报告访问服务结果类型别名
pub type AccessResult<T> = Result<T, AccessError>;
