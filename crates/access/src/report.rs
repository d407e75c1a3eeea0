//! 健康报告生成
//!
//! 从外部数据源汇总用户的饮食、运动、心理健康数据，生成明文报告，
//! 加密后持久化，并签发与报告一一绑定的解密令牌。

use crate::clock::SharedClock;
use crate::crypto::ReportCipher;
use crate::error::{AccessError, AccessResult};
use crate::metrics::REPORTS_GENERATED;
use crate::storage::ReportStore;
use crate::types::{DataSource, DecryptionToken, EncryptedReport, StoredReport};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// 每周建议的中高强度运动分钟数
const WEEKLY_ACTIVE_MINUTES_TARGET: u32 = 150;
/// 热量摄入允许偏离目标的比例
const CALORIE_TOLERANCE: f64 = 0.10;
const LOW_MOOD_THRESHOLD: f64 = 5.0;
const HIGH_STRESS_THRESHOLD: f64 = 7.0;
const MIN_SLEEP_HOURS: f64 = 7.0;

/// 饮食汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DietSummary {
    pub meals_logged: u32,
    pub avg_daily_calories: f64,
    pub calorie_target: f64,
    pub avg_daily_protein_g: f64,
}

/// 运动汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessSummary {
    pub workouts: u32,
    pub weekly_active_minutes: u32,
    pub avg_daily_steps: u32,
}

/// 心理健康汇总（评分为 1-10）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MentalHealthSummary {
    pub check_ins: u32,
    pub avg_mood: f64,
    pub avg_stress: f64,
    pub avg_sleep_hours: f64,
}

/// 某个用户在统计周期内的健康数据汇总
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAggregate {
    pub period_days: u32,
    pub diet: DietSummary,
    pub fitness: FitnessSummary,
    pub mental_health: MentalHealthSummary,
}

/// 解密后的明文报告
///
/// 序列化顺序即字段声明顺序
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaintextReport {
    pub report_id: String,
    pub user_id: String,
    pub generated_at: DateTime<Utc>,
    pub data_source: DataSource,
    pub period_days: u32,
    pub diet: DietSummary,
    pub fitness: FitnessSummary,
    pub mental_health: MentalHealthSummary,
    pub recommendations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

impl PlaintextReport {
    pub fn to_bytes(&self) -> AccessResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> AccessResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| AccessError::Integrity(format!("Decrypted payload is not a report: {e}")))
    }
}

/// 根据汇总数据给出建议
pub fn recommendations(aggregate: &HealthAggregate) -> Vec<String> {
    let mut out = Vec::new();
    let diet = &aggregate.diet;

    if diet.calorie_target > 0.0 {
        let ratio = diet.avg_daily_calories / diet.calorie_target;
        if ratio > 1.0 + CALORIE_TOLERANCE {
            out.push(format!(
                "Average intake of {:.0} kcal/day is above your {:.0} kcal target; consider smaller portions.",
                diet.avg_daily_calories, diet.calorie_target
            ));
        } else if ratio < 1.0 - CALORIE_TOLERANCE {
            out.push(format!(
                "Average intake of {:.0} kcal/day is below your {:.0} kcal target; consider adding a balanced snack.",
                diet.avg_daily_calories, diet.calorie_target
            ));
        }
    }

    if aggregate.fitness.weekly_active_minutes < WEEKLY_ACTIVE_MINUTES_TARGET {
        out.push(format!(
            "Aim for at least {WEEKLY_ACTIVE_MINUTES_TARGET} active minutes per week (currently {}).",
            aggregate.fitness.weekly_active_minutes
        ));
    }

    let mental = &aggregate.mental_health;
    if mental.avg_mood < LOW_MOOD_THRESHOLD {
        out.push("Mood has been low; consider reaching out to someone you trust or a professional.".to_string());
    }
    if mental.avg_stress > HIGH_STRESS_THRESHOLD {
        out.push("Stress levels are high; short breathing or mindfulness sessions may help.".to_string());
    }
    if mental.avg_sleep_hours < MIN_SLEEP_HOURS {
        out.push(format!(
            "Average sleep of {:.1}h is below {MIN_SLEEP_HOURS:.0}h; try a consistent bedtime.",
            mental.avg_sleep_hours
        ));
    }

    if out.is_empty() {
        out.push("All tracked metrics are within target ranges. Keep up the current routine.".to_string());
    }
    out
}

/// 演示数据（用户没有任何健康记录或数据源故障时使用）
pub fn demo_aggregate() -> HealthAggregate {
    HealthAggregate {
        period_days: 30,
        diet: DietSummary {
            meals_logged: 0,
            avg_daily_calories: 2000.0,
            calorie_target: 2000.0,
            avg_daily_protein_g: 60.0,
        },
        fitness: FitnessSummary {
            workouts: 0,
            weekly_active_minutes: 150,
            avg_daily_steps: 8000,
        },
        mental_health: MentalHealthSummary {
            check_ins: 0,
            avg_mood: 7.0,
            avg_stress: 4.0,
            avg_sleep_hours: 7.5,
        },
    }
}

/// 健康数据来源
#[async_trait]
pub trait HealthDataSource: Send + Sync {
    /// 查询用户的健康数据汇总，没有任何记录时返回 `Ok(None)`
    async fn aggregate(&self, user_id: &str) -> AccessResult<Option<HealthAggregate>>;
}

/// 基于内存表的健康数据源，可从 JSON 文件加载
///
/// 文件格式：`{ "user_id": HealthAggregate, ... }`
#[derive(Debug, Default)]
pub struct StaticHealthData {
    records: RwLock<HashMap<String, HealthAggregate>>,
}

impl StaticHealthData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: &Path) -> AccessResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            AccessError::Config(format!(
                "Failed to read health data file {}: {e}",
                path.display()
            ))
        })?;
        let records: HashMap<String, HealthAggregate> = serde_json::from_str(&content)?;
        info!(
            "Loaded health data for {} user(s) from {}",
            records.len(),
            path.display()
        );
        Ok(Self {
            records: RwLock::new(records),
        })
    }

    pub fn insert(&self, user_id: impl Into<String>, aggregate: HealthAggregate) {
        self.records
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id.into(), aggregate);
    }
}

#[async_trait]
impl HealthDataSource for StaticHealthData {
    async fn aggregate(&self, user_id: &str) -> AccessResult<Option<HealthAggregate>> {
        Ok(self
            .records
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(user_id)
            .cloned())
    }
}

/// user_id 校验：非空，最多 128 字符，只允许字母数字和 `_-.@`
pub fn validate_user_id(user_id: &str) -> AccessResult<&str> {
    let user_id = user_id.trim();
    if user_id.is_empty() || user_id.len() > 128 {
        return Err(AccessError::Validation(
            "user_id must be 1-128 characters".to_string(),
        ));
    }
    if !user_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '@'))
    {
        return Err(AccessError::Validation(
            "user_id contains unsupported characters".to_string(),
        ));
    }
    Ok(user_id)
}

/// 一次报告生成的结果
#[derive(Debug, Clone)]
pub struct GeneratedReport {
    pub report: EncryptedReport,
    pub token: DecryptionToken,
    pub data_source: DataSource,
}

/// 报告生成器
#[derive(Clone)]
pub struct ReportGenerator {
    source: Arc<dyn HealthDataSource>,
    cipher: Arc<ReportCipher>,
    store: Arc<dyn ReportStore>,
    clock: SharedClock,
    retention: Option<chrono::Duration>,
}

impl ReportGenerator {
    pub fn new(
        source: Arc<dyn HealthDataSource>,
        cipher: Arc<ReportCipher>,
        store: Arc<dyn ReportStore>,
        clock: SharedClock,
        retention: Option<chrono::Duration>,
    ) -> Self {
        Self {
            source,
            cipher,
            store,
            clock,
            retention,
        }
    }

    /// 生成并加密报告
    ///
    /// 数据源没有该用户的数据或出现故障时仍然生成报告，通过 `data_source` 标记区分。
    pub async fn generate(&self, user_id: &str) -> AccessResult<GeneratedReport> {
        let user_id = validate_user_id(user_id)?;
        let report_id = uuid::Uuid::new_v4().to_string();
        let now = self.clock.now();

        let (data_source, aggregate, notice) = match self.source.aggregate(user_id).await {
            Ok(Some(aggregate)) => (DataSource::RealData, aggregate, None),
            Ok(None) => {
                debug!("No health data for user {}, using demo content", user_id);
                (
                    DataSource::NoDataFound,
                    demo_aggregate(),
                    Some("No health records were found for this user. The figures below are demo data.".to_string()),
                )
            }
            Err(e) => {
                warn!("Health data source failed for user {}: {}", user_id, e);
                (
                    DataSource::Fallback,
                    demo_aggregate(),
                    Some("Health records are temporarily unavailable. The figures below are fallback data.".to_string()),
                )
            }
        };

        let plaintext = PlaintextReport {
            report_id: report_id.clone(),
            user_id: user_id.to_string(),
            generated_at: now,
            data_source,
            period_days: aggregate.period_days,
            recommendations: recommendations(&aggregate),
            diet: aggregate.diet,
            fitness: aggregate.fitness,
            mental_health: aggregate.mental_health,
            notice,
        };

        // 密文绑定 report_id，挪到其他报告下无法解密
        let ciphertext = self
            .cipher
            .encrypt_bound(&plaintext.to_bytes()?, report_id.as_bytes())?;

        let token = DecryptionToken::generate();
        let report = EncryptedReport {
            report_id,
            ciphertext,
            created_at: now,
        };
        self.store
            .put_report(&StoredReport {
                report: report.clone(),
                user_id: user_id.to_string(),
                token_digest: token.digest(),
                expires_at: self.retention.map(|ttl| now + ttl),
            })
            .await?;

        REPORTS_GENERATED
            .with_label_values(&[data_source.as_str()])
            .inc();
        info!(
            "Generated report {} for user {} ({} bytes, data_source={})",
            report.report_id,
            user_id,
            report.ciphertext.len(),
            data_source.as_str()
        );

        Ok(GeneratedReport {
            report,
            token,
            data_source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::storage::MemoryBackend;

    struct BrokenSource;

    #[async_trait]
    impl HealthDataSource for BrokenSource {
        async fn aggregate(&self, _user_id: &str) -> AccessResult<Option<HealthAggregate>> {
            Err(AccessError::Internal("collection offline".to_string()))
        }
    }

    fn sample_aggregate() -> HealthAggregate {
        HealthAggregate {
            period_days: 30,
            diet: DietSummary {
                meals_logged: 84,
                avg_daily_calories: 2600.0,
                calorie_target: 2100.0,
                avg_daily_protein_g: 95.0,
            },
            fitness: FitnessSummary {
                workouts: 6,
                weekly_active_minutes: 90,
                avg_daily_steps: 6400,
            },
            mental_health: MentalHealthSummary {
                check_ins: 20,
                avg_mood: 6.5,
                avg_stress: 7.8,
                avg_sleep_hours: 6.2,
            },
        }
    }

    fn generator(
        source: Arc<dyn HealthDataSource>,
        store: MemoryBackend,
        cipher: Arc<ReportCipher>,
    ) -> ReportGenerator {
        ReportGenerator::new(source, cipher, Arc::new(store), Arc::new(SystemClock), None)
    }

    fn cipher() -> Arc<ReportCipher> {
        Arc::new(ReportCipher::from_key(&ReportCipher::generate_key()).unwrap())
    }

    #[test]
    fn test_recommendations_follow_thresholds() {
        let recs = recommendations(&sample_aggregate());
        assert_eq!(recs.len(), 4);
        assert!(recs[0].contains("above your 2100 kcal target"));
        assert!(recs.iter().any(|r| r.contains("150 active minutes")));
        assert!(recs.iter().any(|r| r.contains("Stress")));
        assert!(recs.iter().any(|r| r.contains("sleep")));

        let healthy = recommendations(&demo_aggregate());
        assert_eq!(healthy.len(), 1);
        assert!(healthy[0].contains("Keep up"));
    }

    #[test]
    fn test_validate_user_id() {
        assert_eq!(validate_user_id(" user_42 ").unwrap(), "user_42");
        assert!(validate_user_id("").is_err());
        assert!(validate_user_id("user 42").is_err());
        assert!(validate_user_id(&"x".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn test_real_data_report() {
        let source = StaticHealthData::new();
        source.insert("user_42", sample_aggregate());
        let store = MemoryBackend::new();
        let cipher = cipher();
        let generator = generator(Arc::new(source), store.clone(), cipher.clone());

        let generated = generator.generate("user_42").await.unwrap();
        assert_eq!(generated.data_source, DataSource::RealData);

        let stored = store
            .get_report(&generated.report.report_id)
            .await
            .unwrap()
            .unwrap();
        assert!(generated.token.matches_digest(&stored.token_digest));
        assert_ne!(stored.token_digest, generated.token.as_str());

        let bytes = cipher
            .decrypt_bound(
                &stored.report.ciphertext,
                generated.report.report_id.as_bytes(),
            )
            .unwrap();
        let report = PlaintextReport::from_bytes(&bytes).unwrap();
        assert_eq!(report.user_id, "user_42");
        assert_eq!(report.diet, sample_aggregate().diet);
        assert!(report.notice.is_none());
    }

    #[tokio::test]
    async fn test_missing_user_yields_demo_report() {
        let cipher = cipher();
        let generator = generator(
            Arc::new(StaticHealthData::new()),
            MemoryBackend::new(),
            cipher.clone(),
        );
        let generated = generator.generate("nobody").await.unwrap();
        assert_eq!(generated.data_source, DataSource::NoDataFound);

        let bytes = cipher
            .decrypt_bound(
                &generated.report.ciphertext,
                generated.report.report_id.as_bytes(),
            )
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["data_source"], "DEMO_DATA_USER_NOT_FOUND");
        assert!(json["notice"].as_str().unwrap().contains("demo data"));
    }

    #[tokio::test]
    async fn test_source_failure_yields_fallback_report() {
        let generator = generator(Arc::new(BrokenSource), MemoryBackend::new(), cipher());
        let generated = generator.generate("user_42").await.unwrap();
        assert_eq!(generated.data_source, DataSource::Fallback);
    }

    #[tokio::test]
    async fn test_retention_sets_expiry() {
        let store = MemoryBackend::new();
        let generator = ReportGenerator::new(
            Arc::new(StaticHealthData::new()),
            cipher(),
            Arc::new(store.clone()),
            Arc::new(SystemClock),
            Some(chrono::Duration::hours(1)),
        );
        let generated = generator.generate("user_7").await.unwrap();
        let stored = store
            .get_report(&generated.report.report_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.expires_at,
            Some(generated.report.created_at + chrono::Duration::hours(1))
        );
    }

    #[tokio::test]
    async fn test_static_data_from_file() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut records = HashMap::new();
        records.insert("user_1".to_string(), sample_aggregate());
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", serde_json::to_string(&records).unwrap()).unwrap();
        file.flush().unwrap();

        let source = StaticHealthData::from_file(file.path()).unwrap();
        assert!(source.aggregate("user_1").await.unwrap().is_some());
        assert!(source.aggregate("user_2").await.unwrap().is_none());
    }
}
