//! 一次性验证码签发与校验
//!
//! 签发流程：生成验证码 → 写入存储（覆盖旧记录）→ 限时投递，投递失败则回滚。
//! 校验流程：格式检查 → 查询记录 → 过期/已使用检查 → 常数时间比较 → 单次消费。
//! 校验失败时由 [`OtpPolicy`] 决定是允许重试、自动重发新验证码，还是已达重发上限。

use crate::clock::SharedClock;
use crate::error::{AccessError, AccessResult};
use crate::metrics::{OTP_VERIFICATIONS, OTPS_ISSUED};
use crate::notifier::{Notifier, OtpDelivery, mask_identifier};
use crate::storage::OtpStore;
use crate::types::{OtpPurpose, OtpRecord};
use chrono::{DateTime, Utc};
use rand::{Rng, rngs::OsRng};
use regex::Regex;
use std::sync::{Arc, LazyLock};
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// 验证码长度
pub const OTP_LENGTH: usize = 6;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9._%+\-]+@[a-z0-9\-]+(\.[a-z0-9\-]+)*\.[a-z]{2,}$")
        .unwrap_or_else(|e| panic!("invalid email pattern: {e}"))
});

/// 校验失败后的处理策略
#[derive(Debug, Clone)]
pub struct OtpPolicy {
    /// 验证码有效期
    pub ttl: chrono::Duration,
    /// 累计失败多少次后自动重发新验证码
    pub resend_after_failed_attempts: u32,
    /// 一条重发链上最多自动重发次数，None 表示不限制
    pub max_auto_resends: Option<u32>,
    /// 投递超时
    pub notify_timeout: std::time::Duration,
}

impl Default for OtpPolicy {
    fn default() -> Self {
        Self {
            ttl: chrono::Duration::minutes(20),
            resend_after_failed_attempts: 1,
            max_auto_resends: None,
            notify_timeout: std::time::Duration::from_millis(5000),
        }
    }
}

/// 校验失败后的状态转移
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchAction {
    /// 保持当前验证码，允许继续尝试
    Retry { remaining: u32 },
    /// 作废当前验证码并自动签发新的
    Reissue,
    /// 已达自动重发上限，必须重新申请
    Exhausted,
}

impl OtpPolicy {
    /// 根据失败次数和已重发次数决定下一步
    pub fn on_mismatch(&self, attempts: u32, resend_count: u32) -> MismatchAction {
        let threshold = self.resend_after_failed_attempts.max(1);
        if attempts < threshold {
            return MismatchAction::Retry {
                remaining: threshold - attempts,
            };
        }

        match self.max_auto_resends {
            Some(cap) if resend_count >= cap => MismatchAction::Exhausted,
            _ => MismatchAction::Reissue,
        }
    }
}

/// 校验结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// 验证通过，记录已被消费
    Verified,
    /// 验证码错误
    Mismatch { remaining: u32 },
    /// 验证码错误，已自动发送新验证码
    NewCodeSent,
}

impl VerifyOutcome {
    /// 将非成功结果转换为对应的错误
    pub fn into_result(self) -> AccessResult<()> {
        match self {
            VerifyOutcome::Verified => Ok(()),
            VerifyOutcome::Mismatch { remaining } => Err(AccessError::OtpMismatch { remaining }),
            VerifyOutcome::NewCodeSent => Err(AccessError::NewOtpSent),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            VerifyOutcome::Verified => "verified",
            VerifyOutcome::Mismatch { .. } => "mismatch",
            VerifyOutcome::NewCodeSent => "new_code_sent",
        }
    }
}

/// 签发结果（不包含验证码本身）
#[derive(Debug, Clone)]
pub struct IssuedOtp {
    pub identifier: String,
    pub purpose: OtpPurpose,
    pub expires_at: DateTime<Utc>,
}

/// 规范化标识符：去除首尾空白并转为小写，必须是邮箱格式
pub fn normalize_identifier(identifier: &str) -> AccessResult<String> {
    let normalized = identifier.trim().to_lowercase();
    if normalized.len() > 254 || !EMAIL_RE.is_match(&normalized) {
        return Err(AccessError::Validation(
            "identifier must be a valid email address".to_string(),
        ));
    }
    Ok(normalized)
}

/// 验证码必须恰好是 6 位 ASCII 数字
pub fn validate_code_format(code: &str) -> AccessResult<&str> {
    let code = code.trim();
    if code.len() != OTP_LENGTH || !code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AccessError::Validation(format!(
            "otp_code must be exactly {OTP_LENGTH} digits"
        )));
    }
    Ok(code)
}

/// 生成均匀分布的 6 位数字验证码
pub fn generate_code() -> String {
    let value: u32 = OsRng.gen_range(0..1_000_000);
    format!("{value:06}")
}

fn codes_match(expected: &str, submitted: &str) -> bool {
    expected.as_bytes().ct_eq(submitted.as_bytes()).into()
}

/// 验证码服务
#[derive(Clone)]
pub struct OtpService {
    store: Arc<dyn OtpStore>,
    notifier: Arc<dyn Notifier>,
    policy: OtpPolicy,
    clock: SharedClock,
}

impl OtpService {
    pub fn new(
        store: Arc<dyn OtpStore>,
        notifier: Arc<dyn Notifier>,
        policy: OtpPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            notifier,
            policy,
            clock,
        }
    }

    /// 签发新验证码并投递
    ///
    /// 覆盖该 (identifier, purpose) 下已有的记录。投递失败或超时时回滚新记录，
    /// 返回 `Notification` 错误。
    pub async fn issue(&self, identifier: &str, purpose: OtpPurpose) -> AccessResult<IssuedOtp> {
        let identifier = normalize_identifier(identifier)?;
        self.issue_normalized(identifier, purpose, None, 0).await
    }

    /// 签发只能用于 `report_id` 的验证码
    pub async fn issue_for_report(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        report_id: &str,
    ) -> AccessResult<IssuedOtp> {
        let identifier = normalize_identifier(identifier)?;
        self.issue_normalized(identifier, purpose, Some(report_id.to_string()), 0)
            .await
    }

    async fn issue_normalized(
        &self,
        identifier: String,
        purpose: OtpPurpose,
        report_id: Option<String>,
        resend_count: u32,
    ) -> AccessResult<IssuedOtp> {
        let record = OtpRecord::new(
            identifier,
            purpose,
            generate_code(),
            self.clock.now(),
            self.policy.ttl,
            resend_count,
        )
        .for_report(report_id);
        self.store.put_otp(&record).await?;

        let delivery = OtpDelivery {
            identifier: record.identifier.clone(),
            purpose,
            code: record.code.clone(),
            expires_at: record.expires_at,
        };

        let delivered =
            match tokio::time::timeout(self.policy.notify_timeout, self.notifier.deliver(&delivery))
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(format!(
                    "delivery timed out after {}ms",
                    self.policy.notify_timeout.as_millis()
                )),
            };

        if let Err(reason) = delivered {
            let removed = self
                .store
                .remove_otp_if(&record.identifier, purpose, &record.otp_id)
                .await?;
            warn!(
                "Failed to deliver {} code to {} via {}: {} (rolled back: {})",
                purpose,
                mask_identifier(&record.identifier),
                self.notifier.name(),
                reason,
                removed
            );
            OTPS_ISSUED
                .with_label_values(&[purpose.as_str(), "notify_failed"])
                .inc();
            return Err(AccessError::Notification(reason));
        }

        info!(
            "Issued {} code for {} (resend #{}), expires at {}",
            purpose,
            mask_identifier(&record.identifier),
            resend_count,
            record.expires_at
        );
        OTPS_ISSUED
            .with_label_values(&[purpose.as_str(), "issued"])
            .inc();

        Ok(IssuedOtp {
            identifier: record.identifier,
            purpose,
            expires_at: record.expires_at,
        })
    }

    /// 校验验证码
    ///
    /// # Errors
    /// - `Validation` - 标识符或验证码格式错误（不访问存储）
    /// - `OtpNotFound` - 没有对应记录
    /// - `OtpExpired` - 已过期或已被使用
    pub async fn verify(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        code: &str,
    ) -> AccessResult<VerifyOutcome> {
        self.verify_scoped(identifier, purpose, code, None).await
    }

    /// 校验绑定到 `report_id` 的验证码
    ///
    /// 绑定到其他报告的验证码按 `OtpNotFound` 处理，不消耗、不计失败次数
    pub async fn verify_for_report(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        code: &str,
        report_id: &str,
    ) -> AccessResult<VerifyOutcome> {
        self.verify_scoped(identifier, purpose, code, Some(report_id))
            .await
    }

    async fn verify_scoped(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        code: &str,
        report_id: Option<&str>,
    ) -> AccessResult<VerifyOutcome> {
        let identifier = normalize_identifier(identifier)?;
        let code = validate_code_format(code)?;

        let result = self
            .verify_normalized(identifier, purpose, code, report_id)
            .await;

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(e) => e.kind(),
        };
        OTP_VERIFICATIONS
            .with_label_values(&[purpose.as_str(), label])
            .inc();

        result
    }

    async fn verify_normalized(
        &self,
        identifier: String,
        purpose: OtpPurpose,
        code: &str,
        report_id: Option<&str>,
    ) -> AccessResult<VerifyOutcome> {
        let record = self
            .store
            .get_otp(&identifier, purpose)
            .await?
            .filter(|record| report_id.is_none_or(|id| record.allows_report(id)))
            .ok_or_else(|| AccessError::OtpNotFound {
                identifier: identifier.clone(),
                purpose: purpose.to_string(),
            })?;

        if !record.is_live(self.clock.now()) {
            debug!(
                "Rejected {} code for {}: consumed={}, expires_at={}",
                purpose,
                mask_identifier(&identifier),
                record.consumed,
                record.expires_at
            );
            return Err(AccessError::OtpExpired);
        }

        if codes_match(&record.code, code) {
            // 并发校验时只有一个调用能完成消费
            if !self
                .store
                .consume_otp(&identifier, purpose, &record.otp_id)
                .await?
            {
                return Err(AccessError::OtpExpired);
            }
            info!(
                "Verified {} code for {}",
                purpose,
                mask_identifier(&identifier)
            );
            return Ok(VerifyOutcome::Verified);
        }

        let attempts = self
            .store
            .record_failed_attempt(&identifier, purpose, &record.otp_id)
            .await?
            .ok_or(AccessError::OtpExpired)?;

        match self.policy.on_mismatch(attempts, record.resend_count) {
            MismatchAction::Retry { remaining } => {
                debug!(
                    "Mismatched {} code for {}, {} attempt(s) remaining",
                    purpose,
                    mask_identifier(&identifier),
                    remaining
                );
                Ok(VerifyOutcome::Mismatch { remaining })
            }
            MismatchAction::Reissue => {
                info!(
                    "Mismatched {} code for {} after {} attempt(s), issuing a new code",
                    purpose,
                    mask_identifier(&identifier),
                    attempts
                );
                self.issue_normalized(
                    identifier,
                    purpose,
                    record.report_id.clone(),
                    record.resend_count + 1,
                )
                .await?;
                Ok(VerifyOutcome::NewCodeSent)
            }
            MismatchAction::Exhausted => {
                warn!(
                    "Auto-resend limit reached for {} ({}), code invalidated",
                    mask_identifier(&identifier),
                    purpose
                );
                self.store
                    .remove_otp_if(&identifier, purpose, &record.otp_id)
                    .await?;
                Ok(VerifyOutcome::Mismatch { remaining: 0 })
            }
        }
    }
}
