//! 报告访问服务配置

use crate::crypto::ReportKeySource;
use crate::otp::OtpPolicy;
use crate::storage::{StorageBackend, StorageConfig};
use serde::{Deserialize, Serialize};

/// 报告访问服务配置
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AccessServiceConfig {
    /// 存储配置
    #[serde(default)]
    pub storage: StorageConfig,

    /// 报告加密密钥 - 直接配置
    ///
    /// 支持两种格式：
    /// - 64 字符的十六进制字符串（32 字节）
    /// - 44 字符的 Base64 字符串（32 字节）
    ///
    /// 注意：直接在配置文件中存储密钥不够安全，生产环境建议使用 key_env 或 key_file
    #[serde(default)]
    pub key: Option<String>,

    /// 密钥环境变量名称，例如 key_env = "REPORTGATE_KEY"
    #[serde(default)]
    pub key_env: Option<String>,

    /// 密钥文件路径，文件权限应设置为 600
    #[serde(default)]
    pub key_file: Option<String>,

    /// 验证码策略
    #[serde(default)]
    pub otp: OtpConfig,

    /// 验证码投递方式
    #[serde(default)]
    pub notifier: NotifierConfig,

    /// 报告保留时长（秒），0 表示永久保留
    #[serde(default)]
    pub report_ttl_seconds: u64,

    /// 健康数据 JSON 文件，未配置时数据源为空（所有报告均为演示数据）
    #[serde(default)]
    pub health_data_file: Option<String>,
}

/// 验证码策略配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OtpConfig {
    /// 有效期（秒）
    #[serde(default = "default_otp_ttl_seconds")]
    pub ttl_seconds: u64,

    /// 累计失败多少次后自动重发新验证码
    #[serde(default = "default_resend_after_failed_attempts")]
    pub resend_after_failed_attempts: u32,

    /// 一条重发链上最多自动重发次数，不配置表示不限制
    #[serde(default)]
    pub max_auto_resends: Option<u32>,

    /// 投递超时（毫秒）
    #[serde(default = "default_notify_timeout_ms")]
    pub notify_timeout_ms: u64,
}

fn default_otp_ttl_seconds() -> u64 {
    1200
}

fn default_resend_after_failed_attempts() -> u32 {
    1
}

fn default_notify_timeout_ms() -> u64 {
    5000
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_otp_ttl_seconds(),
            resend_after_failed_attempts: default_resend_after_failed_attempts(),
            max_auto_resends: None,
            notify_timeout_ms: default_notify_timeout_ms(),
        }
    }
}

impl OtpConfig {
    pub fn to_policy(&self) -> OtpPolicy {
        OtpPolicy {
            ttl: chrono::Duration::seconds(self.ttl_seconds.min(i64::MAX as u64) as i64),
            resend_after_failed_attempts: self.resend_after_failed_attempts,
            max_auto_resends: self.max_auto_resends,
            notify_timeout: std::time::Duration::from_millis(self.notify_timeout_ms),
        }
    }
}

/// 验证码投递配置
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifierConfig {
    /// 仅写日志
    #[default]
    Log,
    /// POST 到外部邮件服务
    Webhook {
        url: String,
        #[serde(default)]
        bearer_token: Option<String>,
    },
}

impl AccessServiceConfig {
    /// 获取密钥来源
    ///
    /// 优先级: key_file > key_env > key
    /// 都未配置时返回 None（使用进程级临时密钥）
    pub fn get_key_source(&self) -> Option<ReportKeySource> {
        if let Some(path) = &self.key_file {
            return Some(ReportKeySource::File(path.clone()));
        }

        if let Some(env_var) = &self.key_env {
            return Some(ReportKeySource::Environment(env_var.clone()));
        }

        if let Some(key) = &self.key {
            return Some(ReportKeySource::Direct(key.clone()));
        }

        None
    }

    /// 报告保留时长
    pub fn report_retention(&self) -> Option<chrono::Duration> {
        match self.report_ttl_seconds {
            0 => None,
            secs => Some(chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64)),
        }
    }

    /// 校验配置
    ///
    /// 返回错误和以 "Warning:" 开头的警告
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.storage.backend == StorageBackend::Sqlite && self.storage.sqlite.is_none() {
            errors.push("access.storage.sqlite section is required for the sqlite backend".into());
        }

        if self.get_key_source().is_none() {
            errors.push(
                "Warning: no report key configured; an ephemeral key will be used and reports will not survive a restart"
                    .to_string(),
            );
        } else if self.key.is_some() && self.key_env.is_none() && self.key_file.is_none() {
            errors.push(
                "Warning: report key is stored directly in the config file; prefer key_env or key_file"
                    .to_string(),
            );
        }

        if self.otp.ttl_seconds == 0 {
            errors.push("access.otp.ttl_seconds must be greater than 0".to_string());
        }
        if self.otp.resend_after_failed_attempts == 0 {
            errors.push("access.otp.resend_after_failed_attempts must be at least 1".to_string());
        }
        if self.otp.notify_timeout_ms == 0 {
            errors.push("access.otp.notify_timeout_ms must be greater than 0".to_string());
        }

        if let NotifierConfig::Webhook { url, .. } = &self.notifier {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!(
                    "access.notifier.url must be an http(s) URL, got '{url}'"
                ));
            } else if url.starts_with("http://") {
                errors.push(
                    "Warning: notifier webhook uses plain HTTP; codes are sent unencrypted"
                        .to_string(),
                );
            }
        } else {
            errors.push(
                "Warning: notifier kind is 'log'; codes are not delivered to users".to_string(),
            );
        }

        errors
    }
}
