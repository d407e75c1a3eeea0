//! 日志与追踪初始化
//!
//! 日志写到控制台或文件（可按天轮转），启用 `opentelemetry` feature 后
//! 额外挂一层 OTLP 导出。

use reportgate::config::{AppConfig, LogConfig};
use reportgate::error::Result;
use std::path::PathBuf;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, fmt::writer::BoxMakeWriter, prelude::*};

#[cfg(feature = "opentelemetry")]
use opentelemetry::KeyValue;
#[cfg(feature = "opentelemetry")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "opentelemetry")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "opentelemetry")]
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
#[cfg(feature = "opentelemetry")]
use reportgate::error::Error;

/// 日志输出目标
#[derive(Debug, Clone, PartialEq, Eq)]
enum LogTarget {
    Console,
    File { dir: PathBuf, rotate: bool },
}

impl LogTarget {
    fn from_config(log: &LogConfig) -> Self {
        match log.output.as_str() {
            "file" => LogTarget::File {
                dir: PathBuf::from(&log.path),
                rotate: log.rotate,
            },
            _ => LogTarget::Console,
        }
    }

    fn describe(&self) -> String {
        match self {
            LogTarget::Console => "console".to_string(),
            LogTarget::File { dir, rotate: true } => format!("{} (daily rotation)", dir.display()),
            LogTarget::File { dir, rotate: false } => dir.display().to_string(),
        }
    }
}

/// 过滤指令的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterSource {
    Env,
    Config,
    Fallback,
}

/// RUST_LOG 优先，其次是配置，都解析失败时退回 info
fn resolve_filter(env_value: Option<String>, configured: &str) -> (EnvFilter, FilterSource) {
    if let Some(directive) = env_value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
        && let Ok(filter) = EnvFilter::try_new(&directive)
    {
        return (filter, FilterSource::Env);
    }

    match EnvFilter::try_new(configured) {
        Ok(filter) => (filter, FilterSource::Config),
        Err(_) => (EnvFilter::new("info"), FilterSource::Fallback),
    }
}

/// 日志文件名跟随实例名称
fn log_file_name(config: &AppConfig) -> String {
    let name = config.name.trim();
    if name.is_empty() {
        "reportgate.log".to_string()
    } else {
        format!("{name}.log")
    }
}

/// 持有日志写线程和追踪导出器，drop 时刷新
#[derive(Default)]
pub struct ObservabilityGuard {
    #[cfg(feature = "opentelemetry")]
    tracer_provider: Option<SdkTracerProvider>,
    _log_writer: Option<WorkerGuard>,
}

impl Drop for ObservabilityGuard {
    fn drop(&mut self) {
        #[cfg(feature = "opentelemetry")]
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to flush trace exporter: {e:?}");
        }
    }
}

fn make_writer(
    target: &LogTarget,
    file_name: &str,
) -> Result<(BoxMakeWriter, Option<WorkerGuard>)> {
    match target {
        LogTarget::Console => Ok((BoxMakeWriter::new(std::io::stdout), None)),
        LogTarget::File { dir, rotate } => {
            std::fs::create_dir_all(dir)?;
            let (writer, guard) = if *rotate {
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name))
            } else {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(dir.join(file_name))?;
                tracing_appender::non_blocking(file)
            };
            Ok((BoxMakeWriter::new(writer), Some(guard)))
        }
    }
}

/// 按配置安装全局 subscriber
///
/// 重复调用不会报错，已经安装过的 subscriber 保持不变
pub fn init_observability(config: &AppConfig) -> Result<ObservabilityGuard> {
    let mut guard = ObservabilityGuard::default();
    let settings = &config.observability;

    let target = LogTarget::from_config(&settings.log);
    let (writer, writer_guard) = make_writer(&target, &log_file_name(config))?;
    guard._log_writer = writer_guard;

    let (filter, filter_source) =
        resolve_filter(std::env::var("RUST_LOG").ok(), &settings.filter_level);

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_ansi(target == LogTarget::Console)
        .with_writer(writer);

    #[cfg(feature = "opentelemetry")]
    let otel_layer = match build_tracer_provider(config)? {
        Some(provider) => {
            use opentelemetry::trace::TracerProvider as _;
            let tracer = provider.tracer(settings.tracing.service_name.clone());
            guard.tracer_provider = Some(provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };
    #[cfg(not(feature = "opentelemetry"))]
    let otel_layer: Option<tracing_subscriber::layer::Identity> = None;

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .is_ok();

    if installed {
        info!(
            "Logging to {} (filter from {:?}, otlp export: {})",
            target.describe(),
            filter_source,
            settings.tracing.enable
        );
    }

    Ok(guard)
}

#[cfg(feature = "opentelemetry")]
fn build_tracer_provider(config: &AppConfig) -> Result<Option<SdkTracerProvider>> {
    let tracing_cfg = &config.observability.tracing;
    if !tracing_cfg.enable {
        return Ok(None);
    }
    tracing_cfg.validate().map_err(Error::custom)?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(tracing_cfg.endpoint.clone())
        .build()
        .map_err(|e| Error::custom(format!("Failed to build OTLP exporter: {e}")))?;

    let resource = Resource::builder()
        .with_service_name(tracing_cfg.service_name.clone())
        .with_attributes([
            KeyValue::new("service.instance.id", config.name.clone()),
            KeyValue::new("deployment.environment", config.env.clone()),
        ])
        .build();

    let provider = SdkTracerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter)
        .build();

    opentelemetry::global::set_tracer_provider(provider.clone());
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    Ok(Some(provider))
}
