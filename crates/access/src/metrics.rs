//! Prometheus 监控指标
//!
//! 提供全局指标收集和导出功能

use lazy_static::lazy_static;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Once;
use std::time::Instant;

static METRICS_INIT: Once = Once::new();

lazy_static! {
    /// 全局 Prometheus Registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========== 业务指标 ==========

    /// 验证码签发次数
    pub static ref OTPS_ISSUED: IntCounterVec = IntCounterVec::new(
        Opts::new("otps_issued_total", "Total number of one-time codes issued")
            .namespace("reportgate"),
        &["purpose", "status"]
    ).unwrap();

    /// 验证码校验结果
    pub static ref OTP_VERIFICATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("otp_verifications_total", "Total number of one-time code verifications")
            .namespace("reportgate"),
        &["purpose", "outcome"]
    ).unwrap();

    /// 报告生成次数（按数据来源）
    pub static ref REPORTS_GENERATED: IntCounterVec = IntCounterVec::new(
        Opts::new("reports_generated_total", "Total number of encrypted reports generated")
            .namespace("reportgate"),
        &["data_source"]
    ).unwrap();

    /// 报告解密次数（按授权路径）
    pub static ref DECRYPTIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("decryptions_total", "Total number of report decryption attempts")
            .namespace("reportgate"),
        &["path", "status"]
    ).unwrap();

    // ========== 性能指标 ==========

    /// HTTP 请求延迟（秒）
    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("request_duration_seconds", "HTTP request duration in seconds")
            .namespace("reportgate")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        &["path", "status"]
    ).unwrap();

    /// HTTP 请求总数
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("requests_total", "Total number of HTTP requests")
            .namespace("reportgate"),
        &["path", "status"]
    ).unwrap();

    /// 错误次数
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("errors_total", "Total number of errors")
            .namespace("reportgate"),
        &["error_type"]
    ).unwrap();
}

/// 注册所有指标到全局 Registry
///
/// 多次调用是安全的，只有第一次会真正注册
pub fn register_metrics() -> Result<(), prometheus::Error> {
    let mut result = Ok(());

    METRICS_INIT.call_once(|| {
        let register_result = (|| {
            REGISTRY.register(Box::new(OTPS_ISSUED.clone()))?;
            REGISTRY.register(Box::new(OTP_VERIFICATIONS.clone()))?;
            REGISTRY.register(Box::new(REPORTS_GENERATED.clone()))?;
            REGISTRY.register(Box::new(DECRYPTIONS.clone()))?;

            REGISTRY.register(Box::new(REQUEST_DURATION.clone()))?;
            REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
            REGISTRY.register(Box::new(ERRORS_TOTAL.clone()))?;

            Ok::<(), prometheus::Error>(())
        })();

        if let Err(e) = register_result {
            result = Err(e);
        }
    });

    result
}

/// HTTP 请求计时器
pub struct RequestTimer {
    start: Instant,
    path: &'static str,
}

impl RequestTimer {
    pub fn new(path: &'static str) -> Self {
        Self {
            start: Instant::now(),
            path,
        }
    }

    /// 完成计时并记录指标
    pub fn observe(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();
        let status_str = status.to_string();

        REQUEST_DURATION
            .with_label_values(&[self.path, status_str.as_str()])
            .observe(duration);
        REQUESTS_TOTAL
            .with_label_values(&[self.path, status_str.as_str()])
            .inc();
    }
}

/// 导出 Prometheus 文本格式的指标
pub fn export_metrics() -> Result<String, prometheus::Error> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;

    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
