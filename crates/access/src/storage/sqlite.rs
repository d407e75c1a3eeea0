//! SQLite 存储后端实现
//!
//! 使用 sqlx 提供原生异步 SQLite 存储支持

use crate::error::{AccessError, AccessResult};
use crate::storage::backend::{OtpStore, ReportStore};
use crate::storage::config::SqliteConfig;
use crate::types::{EncryptedReport, OtpPurpose, OtpRecord, StoredReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, trace};

type OtpRow = (
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    bool,
    i64,
    Option<String>,
);
type ReportRow = (String, String, Vec<u8>, String, i64, Option<i64>);

/// SQLite 存储后端
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}

impl SqliteBackend {
    /// 创建新的 SQLite 后端实例
    ///
    /// # Arguments
    /// * `config` - SQLite 配置
    /// * `db_path` - 数据库文件存储目录路径（来自 AppConfig.sqlite_path）
    pub async fn new(config: &SqliteConfig, db_path: &Path) -> AccessResult<Self> {
        let file = db_path.join(&config.file_name);

        // 创建连接选项并启用 WAL 模式
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", file.display()))
            .map_err(|e| AccessError::Internal(format!("Failed to parse SQLite URL: {e}")))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(|e| AccessError::Internal(format!("Failed to connect to SQLite: {e}")))?;

        let backend = Self { pool };
        backend.init().await?;

        info!(
            "SQLite storage initialized with sqlx: path={}, WAL mode enabled",
            file.display()
        );

        Ok(backend)
    }

    async fn init(&self) -> AccessResult<()> {
        // 主键 (identifier, purpose) 保证每个键最多一条记录
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS otp_codes (
                identifier TEXT NOT NULL,
                purpose TEXT NOT NULL,
                otp_id TEXT NOT NULL,
                code TEXT NOT NULL,
                issued_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                consumed INTEGER NOT NULL DEFAULT 0,
                resend_count INTEGER NOT NULL DEFAULT 0,
                report_id TEXT,
                PRIMARY KEY (identifier, purpose)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AccessError::Internal(format!("Failed to create otp_codes table: {e}")))?;

        // 早期版本的表没有 report_id 列
        let has_report_column = sqlx::query_as::<_, (i64,)>(
            "SELECT 1 FROM pragma_table_info('otp_codes') WHERE name = 'report_id'",
        )
        .fetch_optional(&self.pool)
        .await?
        .is_some();
        if !has_report_column {
            sqlx::query("ALTER TABLE otp_codes ADD COLUMN report_id TEXT")
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    AccessError::Internal(format!("Failed to add otp_codes.report_id: {e}"))
                })?;
            info!("Added report_id column to existing otp_codes table");
        }

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_otp_codes_expires_at ON otp_codes(expires_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| AccessError::Internal(format!("Failed to create index: {e}")))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS encrypted_reports (
                report_id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                ciphertext BLOB NOT NULL,
                token_digest TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                expires_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| {
            AccessError::Internal(format!("Failed to create encrypted_reports table: {e}"))
        })?;

        debug!("SQLite tables and indexes initialized");
        Ok(())
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> AccessResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| AccessError::Internal(format!("Invalid stored timestamp: {ms}")))
}

fn otp_from_row(row: OtpRow) -> AccessResult<OtpRecord> {
    let (
        identifier,
        purpose,
        otp_id,
        code,
        issued_at,
        expires_at,
        attempts,
        consumed,
        resends,
        report_id,
    ) = row;
    let purpose = OtpPurpose::parse(&purpose)
        .ok_or_else(|| AccessError::Internal(format!("Unknown OTP purpose in store: {purpose}")))?;

    Ok(OtpRecord {
        otp_id,
        identifier,
        purpose,
        code,
        issued_at: from_millis(issued_at)?,
        expires_at: from_millis(expires_at)?,
        attempts: attempts.max(0) as u32,
        consumed,
        resend_count: resends.max(0) as u32,
        report_id,
    })
}

fn report_from_row(row: ReportRow) -> AccessResult<StoredReport> {
    let (report_id, user_id, ciphertext, token_digest, created_at, expires_at) = row;
    Ok(StoredReport {
        report: EncryptedReport {
            report_id,
            ciphertext,
            created_at: from_millis(created_at)?,
        },
        user_id,
        token_digest,
        expires_at: expires_at.map(from_millis).transpose()?,
    })
}

#[async_trait]
impl OtpStore for SqliteBackend {
    async fn get_otp(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
    ) -> AccessResult<Option<OtpRecord>> {
        let row = sqlx::query_as::<_, OtpRow>(
            r#"SELECT identifier, purpose, otp_id, code, issued_at, expires_at,
                      attempts, consumed, resend_count, report_id
               FROM otp_codes WHERE identifier = ?1 AND purpose = ?2"#,
        )
        .bind(identifier)
        .bind(purpose.as_str())
        .fetch_optional(&self.pool)
        .await?;

        trace!("OTP lookup for {} ({}): found={}", identifier, purpose, row.is_some());
        row.map(otp_from_row).transpose()
    }

    async fn put_otp(&self, record: &OtpRecord) -> AccessResult<()> {
        sqlx::query(
            r#"INSERT INTO otp_codes (identifier, purpose, otp_id, code, issued_at, expires_at,
                                      attempts, consumed, resend_count, report_id)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
               ON CONFLICT (identifier, purpose) DO UPDATE SET
                   otp_id = excluded.otp_id,
                   code = excluded.code,
                   issued_at = excluded.issued_at,
                   expires_at = excluded.expires_at,
                   attempts = excluded.attempts,
                   consumed = excluded.consumed,
                   resend_count = excluded.resend_count,
                   report_id = excluded.report_id"#,
        )
        .bind(&record.identifier)
        .bind(record.purpose.as_str())
        .bind(&record.otp_id)
        .bind(&record.code)
        .bind(to_millis(record.issued_at))
        .bind(to_millis(record.expires_at))
        .bind(record.attempts as i64)
        .bind(record.consumed)
        .bind(record.resend_count as i64)
        .bind(record.report_id.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_otp(&self, identifier: &str, purpose: OtpPurpose) -> AccessResult<bool> {
        let result = sqlx::query("DELETE FROM otp_codes WHERE identifier = ?1 AND purpose = ?2")
            .bind(identifier)
            .bind(purpose.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_otp_if(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<bool> {
        let result = sqlx::query(
            "DELETE FROM otp_codes WHERE identifier = ?1 AND purpose = ?2 AND otp_id = ?3",
        )
        .bind(identifier)
        .bind(purpose.as_str())
        .bind(otp_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn consume_otp(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<bool> {
        let result = sqlx::query(
            r#"UPDATE otp_codes SET consumed = 1
               WHERE identifier = ?1 AND purpose = ?2 AND otp_id = ?3 AND consumed = 0"#,
        )
        .bind(identifier)
        .bind(purpose.as_str())
        .bind(otp_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_failed_attempt(
        &self,
        identifier: &str,
        purpose: OtpPurpose,
        otp_id: &str,
    ) -> AccessResult<Option<u32>> {
        let row = sqlx::query_as::<_, (i64,)>(
            r#"UPDATE otp_codes SET attempts = attempts + 1
               WHERE identifier = ?1 AND purpose = ?2 AND otp_id = ?3 AND consumed = 0
               RETURNING attempts"#,
        )
        .bind(identifier)
        .bind(purpose.as_str())
        .bind(otp_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(attempts,)| attempts.max(0) as u32))
    }

    async fn cleanup_expired_otps(&self, now: DateTime<Utc>) -> AccessResult<u64> {
        let result = sqlx::query("DELETE FROM otp_codes WHERE expires_at < ?1 OR consumed = 1")
            .bind(to_millis(now))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn otp_count(&self) -> AccessResult<u64> {
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM otp_codes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ReportStore for SqliteBackend {
    async fn put_report(&self, report: &StoredReport) -> AccessResult<()> {
        sqlx::query(
            r#"INSERT INTO encrypted_reports
                   (report_id, user_id, ciphertext, token_digest, created_at, expires_at)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        )
        .bind(&report.report.report_id)
        .bind(&report.user_id)
        .bind(&report.report.ciphertext)
        .bind(&report.token_digest)
        .bind(to_millis(report.report.created_at))
        .bind(report.expires_at.map(to_millis))
        .execute(&self.pool)
        .await?;

        debug!("Stored encrypted report {}", report.report.report_id);
        Ok(())
    }

    async fn get_report(&self, report_id: &str) -> AccessResult<Option<StoredReport>> {
        let row = sqlx::query_as::<_, ReportRow>(
            r#"SELECT report_id, user_id, ciphertext, token_digest, created_at, expires_at
               FROM encrypted_reports WHERE report_id = ?1"#,
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(report_from_row).transpose()
    }

    async fn delete_report(&self, report_id: &str) -> AccessResult<bool> {
        let result = sqlx::query("DELETE FROM encrypted_reports WHERE report_id = ?1")
            .bind(report_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn cleanup_expired_reports(&self, now: DateTime<Utc>) -> AccessResult<u64> {
        let result = sqlx::query(
            "DELETE FROM encrypted_reports WHERE expires_at IS NOT NULL AND expires_at < ?1",
        )
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn report_count(&self) -> AccessResult<u64> {
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM encrypted_reports")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    async fn backend(dir: &Path) -> SqliteBackend {
        SqliteBackend::new(&SqliteConfig::default(), dir)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_otp_round_trip_and_supersede() {
        let temp_dir = tempdir().unwrap();
        let store = backend(temp_dir.path()).await;
        let now = Utc::now();

        let first = OtpRecord::new(
            "alice@example.com".into(),
            OtpPurpose::EmailVerify,
            "123456".into(),
            now,
            Duration::minutes(20),
            0,
        );
        store.put_otp(&first).await.unwrap();

        let loaded = store
            .get_otp("alice@example.com", OtpPurpose::EmailVerify)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.otp_id, first.otp_id);
        assert_eq!(loaded.code, "123456");
        assert_eq!(loaded.expires_at.timestamp_millis(), first.expires_at.timestamp_millis());

        let second = OtpRecord::new(
            "alice@example.com".into(),
            OtpPurpose::EmailVerify,
            "654321".into(),
            now,
            Duration::minutes(20),
            1,
        )
        .for_report(Some("r-9".into()));
        store.put_otp(&second).await.unwrap();
        assert_eq!(store.otp_count().await.unwrap(), 1);

        assert!(
            !store
                .consume_otp("alice@example.com", OtpPurpose::EmailVerify, &first.otp_id)
                .await
                .unwrap()
        );
        assert_eq!(
            store
                .record_failed_attempt("alice@example.com", OtpPurpose::EmailVerify, &second.otp_id)
                .await
                .unwrap(),
            Some(1)
        );
        assert!(
            store
                .consume_otp("alice@example.com", OtpPurpose::EmailVerify, &second.otp_id)
                .await
                .unwrap()
        );
        assert!(
            !store
                .consume_otp("alice@example.com", OtpPurpose::EmailVerify, &second.otp_id)
                .await
                .unwrap()
        );

        let reloaded = store
            .get_otp("alice@example.com", OtpPurpose::EmailVerify)
            .await
            .unwrap()
            .unwrap();
        assert!(reloaded.consumed);
        assert_eq!(reloaded.attempts, 1);
        assert_eq!(reloaded.resend_count, 1);
        assert_eq!(reloaded.report_id.as_deref(), Some("r-9"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consume_succeeds_once() {
        let temp_dir = tempdir().unwrap();
        let store = backend(temp_dir.path()).await;

        let record = OtpRecord::new(
            "racer@example.com".into(),
            OtpPurpose::ReportDecrypt,
            "424242".into(),
            Utc::now(),
            Duration::minutes(20),
            0,
        );
        store.put_otp(&record).await.unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let store = store.clone();
            let otp_id = record.otp_id.clone();
            tasks.spawn(async move {
                store
                    .consume_otp("racer@example.com", OtpPurpose::ReportDecrypt, &otp_id)
                    .await
            });
        }

        let mut consumed = 0;
        while let Some(joined) = tasks.join_next().await {
            if joined.unwrap().unwrap() {
                consumed += 1;
            }
        }
        assert_eq!(consumed, 1);
    }

    #[tokio::test]
    async fn test_report_round_trip() {
        let temp_dir = tempdir().unwrap();
        let store = backend(temp_dir.path()).await;

        let report = StoredReport {
            report: EncryptedReport {
                report_id: "r-1".into(),
                ciphertext: vec![1, 2, 3, 4],
                created_at: Utc::now(),
            },
            user_id: "user_42".into(),
            token_digest: "ab".repeat(32),
            expires_at: None,
        };
        store.put_report(&report).await.unwrap();
        assert!(store.put_report(&report).await.is_err());

        let loaded = store.get_report("r-1").await.unwrap().unwrap();
        assert_eq!(loaded.report.ciphertext, vec![1, 2, 3, 4]);
        assert_eq!(loaded.user_id, "user_42");
        assert_eq!(loaded.expires_at, None);
        assert_eq!(store.report_count().await.unwrap(), 1);

        // 永久保留的报告不会被清理
        assert_eq!(
            store
                .cleanup_expired_reports(Utc::now() + Duration::days(365))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_cleanup_expired_otps() {
        let temp_dir = tempdir().unwrap();
        let store = backend(temp_dir.path()).await;
        let now = Utc::now();

        let stale = OtpRecord::new(
            "old@example.com".into(),
            OtpPurpose::ReportDecrypt,
            "000001".into(),
            now - Duration::minutes(30),
            Duration::minutes(20),
            0,
        );
        let live = OtpRecord::new(
            "new@example.com".into(),
            OtpPurpose::ReportDecrypt,
            "000002".into(),
            now,
            Duration::minutes(20),
            0,
        );
        store.put_otp(&stale).await.unwrap();
        store.put_otp(&live).await.unwrap();

        assert_eq!(store.cleanup_expired_otps(now).await.unwrap(), 1);
        assert!(
            store
                .get_otp("new@example.com", OtpPurpose::ReportDecrypt)
                .await
                .unwrap()
                .is_some()
        );
    }
}
