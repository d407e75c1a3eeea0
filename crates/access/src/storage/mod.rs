//! 存储模块
//!
//! 提供两种存储后端：进程内存、SQLite
//!
//! # 设计
//!
//! - `OtpStore` / `ReportStore` trait 定义统一的异步接口
//! - `AccessStorage` enum 封装不同的后端实现
//! - 通过 `StorageConfig` 配置选择和初始化后端

use std::path::Path;

pub mod backend;
pub mod config;
pub mod memory;
pub mod sqlite;

use crate::error::{AccessError, AccessResult};
use crate::types::{OtpPurpose, OtpRecord, StoredReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use backend::{OtpStore, ReportStore};
pub use config::{SqliteConfig, StorageBackend, StorageConfig};
pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// 存储统一接口
#[derive(Clone, Debug)]
pub enum AccessStorage {
    /// 内存存储后端
    Memory(MemoryBackend),

    /// SQLite 存储后端
    Sqlite(Box<SqliteBackend>),
}

impl AccessStorage {
    /// 从配置创建存储实例
    ///
    /// # Arguments
    /// * `config` - 存储配置
    /// * `db_path` - 数据库文件存储目录路径（当 backend = "sqlite" 时必需）
    ///
    /// # Errors
    /// - 缺少对应后端的配置
    /// - 后端初始化失败
    pub async fn from_config<P: AsRef<Path>>(
        config: &StorageConfig,
        db_path: P,
    ) -> AccessResult<Self> {
        match config.backend {
            StorageBackend::Memory => Ok(Self::memory()),
            StorageBackend::Sqlite => {
                let cfg = config
                    .sqlite
                    .as_ref()
                    .ok_or_else(|| AccessError::Config("Missing SQLite config".into()))?;
                let backend = SqliteBackend::new(cfg, db_path.as_ref()).await?;
                Ok(Self::Sqlite(Box::new(backend)))
            }
        }
    }

    pub fn memory() -> Self {
        Self::Memory(MemoryBackend::new())
    }

    /// 后端名称（用于日志和健康检查）
    pub fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory(_) => "memory",
            Self::Sqlite(_) => "sqlite",
        }
    }
}

#[async_trait]
impl OtpStore for AccessStorage {
    async fn get_otp(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> AccessResult<Option<OtpRecord>> {
        match self {
            Self::Memory(b) => b.get_otp(identifier, purpose).await,
            Self::Sqlite(b) => b.get_otp(identifier, purpose).await,
        }
    }

    async fn put_otp(&self, record: &OtpRecord) -> AccessResult<()> {
        match self {
            Self::Memory(b) => b.put_otp(record).await,
            Self::Sqlite(b) => b.put_otp(record).await,
        }
    }

    async fn delete_otp(&self, identifier: &str, purpose: OtpPurpose) -> AccessResult<bool> {
        match self {
            Self::Memory(b) => b.delete_otp(identifier, purpose).await,
            Self::Sqlite(b) => b.delete_otp(identifier, purpose).await,
        }
    }

    async fn remove_otp_if(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<bool> {
        match self {
            Self::Memory(b) => b.remove_otp_if(identifier, purpose, otp_id).await,
            Self::Sqlite(b) => b.remove_otp_if(identifier, purpose, otp_id).await,
        }
    }

    async fn consume_otp(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<bool> {
        match self {
            Self::Memory(b) => b.consume_otp(identifier, purpose, otp_id).await,
            Self::Sqlite(b) => b.consume_otp(identifier, purpose, otp_id).await,
        }
    }

    async fn record_failed_attempt(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<Option<u32>> {
        match self {
            Self::Memory(b) => b.record_failed_attempt(identifier, purpose, otp_id).await,
            Self::Sqlite(b) => b.record_failed_attempt(identifier, purpose, otp_id).await,
        }
    }

    async fn cleanup_expired_otps(&self, now: DateTime<Utc>) -> AccessResult<u64> {
        match self {
            Self::Memory(b) => b.cleanup_expired_otps(now).await,
            Self::Sqlite(b) => b.cleanup_expired_otps(now).await,
        }
    }

    async fn otp_count(&self) -> AccessResult<u64> {
        match self {
            Self::Memory(b) => b.otp_count().await,
            Self::Sqlite(b) => b.otp_count().await,
        }
    }
}

#[async_trait]
impl ReportStore for AccessStorage {
    async fn put_report(&self, report: &StoredReport) -> AccessResult<()> {
        match self {
            Self::Memory(b) => b.put_report(report).await,
            Self::Sqlite(b) => b.put_report(report).await,
        }
    }

    async fn get_report(&self, report_id: &str) -> AccessResult<Option<StoredReport>> {
        match self {
            Self::Memory(b) => b.get_report(report_id).await,
            Self::Sqlite(b) => b.get_report(report_id).await,
        }
    }

    async fn delete_report(&self, report_id: &str) -> AccessResult<bool> {
        match self {
            Self::Memory(b) => b.delete_report(report_id).await,
            Self::Sqlite(b) => b.delete_report(report_id).await,
        }
    }

    async fn cleanup_expired_reports(&self, now: DateTime<Utc>) -> AccessResult<u64> {
        match self {
            Self::Memory(b) => b.cleanup_expired_reports(now).await,
            Self::Sqlite(b) => b.cleanup_expired_reports(now).await,
        }
    }

    async fn report_count(&self) -> AccessResult<u64> {
        match self {
            Self::Memory(b) => b.report_count().await,
            Self::Sqlite(b) => b.report_count().await,
        }
    }
}
