//! 内存存储后端实现
//!
//! 单把锁保护每张表，所有条件更新都在持锁期间完成

use crate::error::{AccessError, AccessResult};
use crate::storage::backend::{OtpStore, ReportStore};
use crate::types::{OtpPurpose, OtpRecord, StoredReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

type OtpKey = (String, OtpPurpose);

/// 内存存储后端
#[derive(Clone, Default)]
pub struct MemoryBackend {
    otps: Arc<Mutex<HashMap<OtpKey, OtpRecord>>>,
    reports: Arc<Mutex<HashMap<String, StoredReport>>>,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend").finish_non_exhaustive()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

fn key(identifier: &str, purpose: OtpPurpose) -> OtpKey {
    (identifier.to_string(), purpose)
}

#[async_trait]
impl OtpStore for MemoryBackend {
    async fn get_otp(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> AccessResult<Option<OtpRecord>> {
        Ok(self.otps.lock().await.get(&key(identifier, purpose)).cloned())
    }

    async fn put_otp(&self, record: &OtpRecord) -> AccessResult<()> {
        let previous = self
            .otps
            .lock()
            .await
            .insert(key(&record.identifier, record.purpose), record.clone());
        if let Some(previous) = previous {
            debug!("Superseded code {} for {}", previous.otp_id, record.purpose);
        }
        Ok(())
    }

    async fn delete_otp(&self, identifier: &str, purpose: OtpPurpose) -> AccessResult<bool> {
        Ok(self
            .otps
            .lock()
            .await
            .remove(&key(identifier, purpose))
            .is_some())
    }

    async fn remove_otp_if(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<bool> {
        let mut otps = self.otps.lock().await;
        let k = key(identifier, purpose);
        if otps.get(&k).is_some_and(|r| r.otp_id == otp_id) {
            otps.remove(&k);
            return Ok(true);
        }
        Ok(false)
    }

    async fn consume_otp(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<bool> {
        let mut otps = self.otps.lock().await;
        match otps.get_mut(&key(identifier, purpose)) {
            Some(record) if record.otp_id == otp_id && !record.consumed => {
                record.consumed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failed_attempt(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<Option<u32>> {
        let mut otps = self.otps.lock().await;
        match otps.get_mut(&key(identifier, purpose)) {
            Some(record) if record.otp_id == otp_id && !record.consumed => {
                record.attempts = record.attempts.saturating_add(1);
                Ok(Some(record.attempts))
            }
            _ => Ok(None),
        }
    }

    async fn cleanup_expired_otps(&self, now: DateTime<Utc>) -> AccessResult<u64> {
        let mut otps = self.otps.lock().await;
        let before = otps.len();
        otps.retain(|_, record| record.is_live(now));
        Ok((before - otps.len()) as u64)
    }

    async fn otp_count(&self) -> AccessResult<u64> {
        Ok(self.otps.lock().await.len() as u64)
    }
}

#[async_trait]
impl ReportStore for MemoryBackend {
    async fn put_report(&self, report: &StoredReport) -> AccessResult<()> {
        let mut reports = self.reports.lock().await;
        if reports.contains_key(&report.report.report_id) {
            return Err(AccessError::Internal(format!(
                "Duplicate report_id {}",
                report.report.report_id
            )));
        }
        reports.insert(report.report.report_id.clone(), report.clone());
        Ok(())
    }

    async fn get_report(&self, report_id: &str) -> AccessResult<Option<StoredReport>> {
        Ok(self.reports.lock().await.get(report_id).cloned())
    }

    async fn delete_report(&self, report_id: &str) -> AccessResult<bool> {
        Ok(self.reports.lock().await.remove(report_id).is_some())
    }

    async fn cleanup_expired_reports(&self, now: DateTime<Utc>) -> AccessResult<u64> {
        let mut reports = self.reports.lock().await;
        let before = reports.len();
        reports.retain(|_, report| !report.is_expired(now));
        Ok((before - reports.len()) as u64)
    }

    async fn report_count(&self) -> AccessResult<u64> {
        Ok(self.reports.lock().await.len() as u64)
    }
}
