//! 存储后端抽象接口
//!
//! 验证码与报告分属两个 trait，业务组件只依赖自己需要的那一个。

use crate::error::AccessResult;
use crate::types::{OtpPurpose, OtpRecord, StoredReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// 验证码存储接口
///
/// 记录以 (identifier, purpose) 为键，写入即覆盖，因此同一键最多只有一条记录。
/// 需要原子性的操作都以 `otp_id` 为条件，避免作用到并发签发的新记录上。
#[async_trait]
pub trait OtpStore: Send + Sync {
    /// 查询记录（包括已过期或已使用的）
    async fn get_otp(&self, identifier: &str, purpose: OtpPurpose)
    -> AccessResult<Option<OtpRecord>>;

    /// 写入记录，原子地替换该键下的旧记录
    async fn put_otp(&self, record: &OtpRecord) -> AccessResult<()>;

    /// 删除该键下的记录
    async fn delete_otp(&self, identifier: &str, purpose: OtpPurpose) -> AccessResult<bool>;

    /// 仅当当前记录的 otp_id 匹配时删除（用于签发回滚）
    async fn remove_otp_if(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<bool>;

    /// 仅当 otp_id 匹配且未被使用时标记为已使用
    ///
    /// # Returns
    /// * `Ok(true)` - 本次调用完成了标记
    /// * `Ok(false)` - 记录已被替换或已被使用
    async fn consume_otp(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<bool>;

    /// 失败次数加一，返回新的失败次数
    ///
    /// 记录已被替换或已被使用时返回 `Ok(None)`
    async fn record_failed_attempt(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<Option<u32>>;

    /// 清理过期或已使用的记录，返回清理数量
    async fn cleanup_expired_otps(&self, now: DateTime<Utc>) -> AccessResult<u64>;

    /// 记录总数
    async fn otp_count(&self) -> AccessResult<u64>;
}

/// 加密报告存储接口
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// 写入新报告；报告不可变，report_id 重复视为错误
    async fn put_report(&self, report: &StoredReport) -> AccessResult<()>;

    async fn get_report(&self, report_id: &str) -> AccessResult<Option<StoredReport>>;

    async fn delete_report(&self, report_id: &str) -> AccessResult<bool>;

    /// 清理超过保留期的报告，返回清理数量
    async fn cleanup_expired_reports(&self, now: DateTime<Utc>) -> AccessResult<u64>;

    async fn report_count(&self) -> AccessResult<u64>;
}
