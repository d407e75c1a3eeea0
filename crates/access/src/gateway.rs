//! 报告解密网关
//!
//! 两条授权路径（解密验证码 / 解密令牌）都先换取一个 [`Capability`]，
//! 再由唯一的 [`DecryptionGateway::reveal`] 完成解密，因此两条路径得到的明文逐字节相同。

use crate::clock::SharedClock;
use crate::crypto::ReportCipher;
use crate::error::{AccessError, AccessResult};
use crate::metrics::DECRYPTIONS;
use crate::notifier::mask_identifier;
use crate::otp::{IssuedOtp, OtpService, VerifyOutcome, normalize_identifier, validate_code_format};
use crate::report::PlaintextReport;
use crate::storage::ReportStore;
use crate::types::{DecryptionToken, OtpPurpose, StoredReport};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// 解密凭证
#[derive(Debug, Clone)]
pub enum Credential {
    /// 路径 A：解密验证码
    Otp { identifier: String, code: String },
    /// 路径 B：解密令牌
    Token(DecryptionToken),
}

/// 授权路径
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPath {
    Otp,
    Token,
}

impl AccessPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessPath::Otp => "otp",
            AccessPath::Token => "token",
        }
    }
}

impl Credential {
    pub fn path(&self) -> AccessPath {
        match self {
            Credential::Otp { .. } => AccessPath::Otp,
            Credential::Token(_) => AccessPath::Token,
        }
    }
}

/// 解密授权
///
/// 只能由 [`DecryptionGateway::authorize`] 创建，持有已加载的加密报告
#[derive(Debug)]
pub struct Capability {
    report: StoredReport,
    path: AccessPath,
}

impl Capability {
    pub fn path(&self) -> AccessPath {
        self.path
    }
}

/// 解密结果
#[derive(Debug, Clone)]
pub struct RevealedReport {
    pub report_id: String,
    pub path: AccessPath,
    pub plaintext: Vec<u8>,
}

impl RevealedReport {
    pub fn report(&self) -> AccessResult<PlaintextReport> {
        PlaintextReport::from_bytes(&self.plaintext)
    }
}

/// 验证码路径下一次解密尝试的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPhase {
    Idle,
    OtpRequested,
    OtpVerified,
    Decrypted,
}

/// 触发阶段转移的事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessEvent {
    /// 签发了验证码（包括重新申请和自动重发）
    OtpIssued,
    /// 验证码过期或已被使用
    OtpExpired,
    /// 验证码校验通过
    OtpAccepted,
    /// 报告解密完成
    ReportDecrypted,
}

/// 非法阶段转移
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Illegal access transition from {from:?} on {event:?}")]
pub struct IllegalTransition {
    pub from: AccessPhase,
    pub event: AccessEvent,
}

impl AccessPhase {
    /// 纯函数状态转移
    pub fn advance(self, event: AccessEvent) -> Result<AccessPhase, IllegalTransition> {
        use AccessEvent::*;
        use AccessPhase::*;

        match (self, event) {
            (Idle, OtpIssued) | (OtpRequested, OtpIssued) => Ok(OtpRequested),
            (OtpRequested, OtpExpired) => Ok(Idle),
            (OtpRequested, OtpAccepted) => Ok(OtpVerified),
            (OtpVerified, ReportDecrypted) => Ok(Decrypted),
            (from, event) => Err(IllegalTransition { from, event }),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, AccessPhase::Decrypted)
    }
}

fn log_transition(report_id: &str, from: AccessPhase, event: AccessEvent) -> AccessPhase {
    match from.advance(event) {
        Ok(to) => {
            if to.is_terminal() {
                debug!("Report {} access: {:?} -> {:?} (done)", report_id, from, to);
            } else {
                debug!("Report {} access: {:?} -> {:?}", report_id, from, to);
            }
            to
        }
        Err(e) => {
            warn!("Report {} access: {}", report_id, e);
            from
        }
    }
}

/// 解密网关
#[derive(Clone)]
pub struct DecryptionGateway {
    otp: OtpService,
    cipher: Arc<ReportCipher>,
    store: Arc<dyn ReportStore>,
    clock: SharedClock,
}

impl DecryptionGateway {
    pub fn new(
        otp: OtpService,
        cipher: Arc<ReportCipher>,
        store: Arc<dyn ReportStore>,
        clock: SharedClock,
    ) -> Self {
        Self {
            otp,
            cipher,
            store,
            clock,
        }
    }

    /// 为解密 `report_id` 申请验证码，签发的验证码只对这份报告有效
    pub async fn request_otp(&self, identifier: &str, report_id: &str) -> AccessResult<IssuedOtp> {
        normalize_identifier(identifier)?;
        let report = self.load_report(report_id).await?;
        let report_id = report.report.report_id;

        let issued = self
            .otp
            .issue_for_report(identifier, OtpPurpose::ReportDecrypt, &report_id)
            .await?;
        log_transition(&report_id, AccessPhase::Idle, AccessEvent::OtpIssued);
        debug!(
            "Decrypt code for report {} sent to {}",
            report_id,
            mask_identifier(&issued.identifier)
        );
        Ok(issued)
    }

    /// 加载报告，已超出保留期的报告视为不存在
    pub async fn load_report(&self, report_id: &str) -> AccessResult<StoredReport> {
        let report_id = report_id.trim();
        if report_id.is_empty() {
            return Err(AccessError::Validation("report_id is required".to_string()));
        }

        match self.store.get_report(report_id).await? {
            Some(report) if !report.is_expired(self.clock.now()) => Ok(report),
            Some(_) => {
                debug!("Report {} is past its retention window", report_id);
                Err(AccessError::ReportNotFound(report_id.to_string()))
            }
            None => Err(AccessError::ReportNotFound(report_id.to_string())),
        }
    }

    /// 校验凭证，换取解密授权
    pub async fn authorize(
        &self,
        report_id: &str,
        credential: Credential,
    ) -> AccessResult<Capability> {
        let path = credential.path();
        match credential {
            Credential::Otp { identifier, code } => {
                // 先做格式校验，再确认报告存在，最后才消费验证码
                normalize_identifier(&identifier)?;
                validate_code_format(&code)?;
                let report = self.load_report(report_id).await?;
                let report_id = report.report.report_id.clone();

                let outcome = match self
                    .otp
                    .verify_for_report(&identifier, OtpPurpose::ReportDecrypt, &code, &report_id)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(AccessError::OtpExpired) => {
                        log_transition(
                            &report_id,
                            AccessPhase::OtpRequested,
                            AccessEvent::OtpExpired,
                        );
                        return Err(AccessError::OtpExpired);
                    }
                    Err(e) => return Err(e),
                };

                if outcome == VerifyOutcome::NewCodeSent {
                    log_transition(&report_id, AccessPhase::OtpRequested, AccessEvent::OtpIssued);
                }
                outcome.into_result()?;
                log_transition(&report_id, AccessPhase::OtpRequested, AccessEvent::OtpAccepted);

                Ok(Capability { report, path })
            }
            Credential::Token(token) => {
                let report = self.load_report(report_id).await?;
                if !token.matches_digest(&report.token_digest) {
                    return Err(AccessError::InvalidToken(report.report.report_id));
                }
                Ok(Capability { report, path })
            }
        }
    }

    /// 使用授权解密报告
    ///
    /// 完整性校验失败时不返回任何明文
    pub fn reveal(&self, capability: Capability) -> AccessResult<RevealedReport> {
        let Capability { report, path } = capability;
        let report_id = report.report.report_id;
        let plaintext = self
            .cipher
            .decrypt_bound(&report.report.ciphertext, report_id.as_bytes())?;

        if path == AccessPath::Otp {
            log_transition(&report_id, AccessPhase::OtpVerified, AccessEvent::ReportDecrypted);
        }
        info!(
            "Report {} decrypted via {} path ({} bytes)",
            report_id,
            path.as_str(),
            plaintext.len()
        );

        Ok(RevealedReport {
            report_id,
            path,
            plaintext,
        })
    }

    /// 授权并解密
    pub async fn decrypt(
        &self,
        report_id: &str,
        credential: Credential,
    ) -> AccessResult<RevealedReport> {
        let path = credential.path();
        let result = match self.authorize(report_id, credential).await {
            Ok(capability) => self.reveal(capability),
            Err(e) => Err(e),
        };

        let status = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };
        DECRYPTIONS
            .with_label_values(&[path.as_str(), status])
            .inc();

        result
    }

    /// 路径 A：解密验证码
    pub async fn decrypt_with_otp(
        &self,
        identifier: &str,
        code: &str,
        report_id: &str,
    ) -> AccessResult<RevealedReport> {
        self.decrypt(
            report_id,
            Credential::Otp {
                identifier: identifier.to_string(),
                code: code.to_string(),
            },
        )
        .await
    }

    /// 路径 B：解密令牌
    pub async fn decrypt_with_token(
        &self,
        report_id: &str,
        token: DecryptionToken,
    ) -> AccessResult<RevealedReport> {
        self.decrypt(report_id, Credential::Token(token)).await
    }
}
