//! 应用配置
//!
//! reportgate 的全部配置项都在这里定义，配置文件使用 TOML 格式。

use report_access::AccessServiceConfig;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// reportgate 主配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    /// 实例名称，用于日志和追踪
    #[serde(default = "default_name")]
    pub name: String,

    /// 运行环境：dev / prod
    #[serde(default = "default_env")]
    pub env: String,

    /// 网络绑定配置
    #[serde(default)]
    pub bind: BindConfig,

    /// SQLite 数据库文件所在目录
    #[serde(
        default = "default_sqlite_path",
        serialize_with = "serialize_pathbuf",
        deserialize_with = "deserialize_pathbuf"
    )]
    pub sqlite_path: PathBuf,

    /// 报告访问服务配置
    #[serde(default)]
    pub access: AccessServiceConfig,

    /// 可观测性配置（日志 + 追踪）
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// 网络绑定配置
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct BindConfig {
    #[serde(default)]
    pub http: HttpBindConfig,
}

/// HTTP 服务绑定配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct HttpBindConfig {
    /// 绑定 IP 地址，通常使用 "0.0.0.0" 监听所有接口
    pub ip: String,

    /// 绑定端口
    pub port: u16,
}

impl Default for HttpBindConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl HttpBindConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.ip, self.port).parse()
    }
}

/// 可观测性配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ObservabilityConfig {
    /// 日志过滤级别，RUST_LOG 环境变量优先
    #[serde(default = "default_filter_level")]
    pub filter_level: String,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub tracing: TracingConfig,
}

/// 日志输出配置
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LogConfig {
    /// 输出目标："console" 或 "file"
    #[serde(default = "default_log_output")]
    pub output: String,

    /// 是否按天轮转（仅 file 模式）
    #[serde(default)]
    pub rotate: bool,

    /// 日志目录（仅 file 模式）
    #[serde(default = "default_log_path")]
    pub path: String,
}

/// OpenTelemetry 追踪配置
///
/// 需要编译时启用 `opentelemetry` feature
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TracingConfig {
    #[serde(default)]
    pub enable: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// OTLP gRPC endpoint
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            filter_level: default_filter_level(),
            log: LogConfig::default(),
            tracing: TracingConfig::default(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            output: default_log_output(),
            rotate: false,
            path: default_log_path(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enable: false,
            service_name: default_service_name(),
            endpoint: default_endpoint(),
        }
    }
}

impl TracingConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.enable {
            if self.endpoint.trim().is_empty() {
                return Err("Tracing endpoint cannot be empty when tracing is enabled".to_string());
            }
            if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
                return Err("Tracing endpoint must start with http:// or https://".to_string());
            }
        }
        Ok(())
    }
}

fn default_name() -> String {
    "reportgate".to_string()
}

fn default_env() -> String {
    "dev".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("database")
}

fn default_log_output() -> String {
    "console".to_string()
}

fn default_log_path() -> String {
    "logs/".to_string()
}

fn default_filter_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "reportgate".to_string()
}

fn default_endpoint() -> String {
    "http://127.0.0.1:4317".to_string()
}

fn serialize_pathbuf<S>(path: &Path, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    path.display().to_string().serialize(serializer)
}

fn deserialize_pathbuf<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Ok(PathBuf::from(s))
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            env: default_env(),
            bind: BindConfig::default(),
            sqlite_path: default_sqlite_path(),
            access: AccessServiceConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let path_ref = path.as_ref();

        if !path_ref.exists() {
            return Err(format!("Configuration file does not exist: {path_ref:?}").into());
        }
        if !path_ref.is_file() {
            return Err(format!("Path is not a valid file: {path_ref:?}").into());
        }

        let content = std::fs::read_to_string(path_ref)?;
        let config: AppConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// 从 TOML 字符串加载配置
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// 将配置序列化为 TOML 字符串
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(self)
    }

    /// 验证配置有效性
    ///
    /// 以 "Warning:" 开头的条目只是警告，不阻止启动
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name cannot be empty".to_string());
        }

        if !matches!(self.env.as_str(), "dev" | "prod" | "test") {
            errors.push(format!(
                "Invalid env '{}'. Must be one of: dev, prod, test",
                self.env
            ));
        }

        if let Err(e) = self.bind.http.socket_addr() {
            errors.push(format!(
                "Invalid bind.http address {}:{}: {e}",
                self.bind.http.ip, self.bind.http.port
            ));
        }

        if self.sqlite_path.as_os_str().is_empty() {
            errors.push("sqlite_path cannot be empty".to_string());
        }

        if !matches!(self.observability.log.output.as_str(), "console" | "file") {
            errors.push(format!(
                "Invalid observability.log.output '{}'. Must be 'console' or 'file'",
                self.observability.log.output
            ));
        }

        if let Err(e) = self.observability.tracing.validate() {
            errors.push(e);
        }

        errors.extend(self.access.validate());

        if self.env == "prod" && self.access.get_key_source().is_none() {
            errors.push(
                "A report key (access.key_file, access.key_env or access.key) is required when env = \"prod\""
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use report_access::{NotifierConfig, StorageBackend};

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.bind.http.port, 8080);
        assert_eq!(config.sqlite_path, PathBuf::from("database"));
        assert_eq!(config.access.storage.backend, StorageBackend::Sqlite);

        // 默认配置只有警告
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().all(|e| e.starts_with("Warning:")));
    }

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
            name = "reportgate-01"
            env = "prod"
            sqlite_path = "/var/lib/reportgate"

            [bind.http]
            ip = "0.0.0.0"
            port = 9000

            [access]
            key_file = "/etc/reportgate/report.key"
            report_ttl_seconds = 604800

            [access.storage]
            backend = "sqlite"

            [access.storage.sqlite]
            file_name = "reports.db"

            [access.otp]
            ttl_seconds = 1200
            max_auto_resends = 5

            [access.notifier]
            kind = "webhook"
            url = "https://mailer.internal/send-otp"

            [observability]
            filter_level = "debug"

            [observability.log]
            output = "file"
            rotate = true
            path = "/var/log/reportgate"
        "#;

        let config = AppConfig::from_toml(toml_str).unwrap();
        assert_eq!(config.name, "reportgate-01");
        assert_eq!(config.bind.http.socket_addr().unwrap().port(), 9000);
        assert_eq!(config.sqlite_path, PathBuf::from("/var/lib/reportgate"));
        assert_eq!(
            config.access.storage.sqlite.as_ref().unwrap().file_name,
            "reports.db"
        );
        assert!(matches!(config.access.notifier, NotifierConfig::Webhook { .. }));
        assert!(config.observability.log.rotate);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_prod_requires_key() {
        let config = AppConfig {
            env: "prod".to_string(),
            ..Default::default()
        };
        let errors = config.validate().unwrap_err();
        assert!(
            errors
                .iter()
                .any(|e| !e.starts_with("Warning:") && e.contains("report key"))
        );
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let mut config = AppConfig {
            env: "staging".to_string(),
            ..Default::default()
        };
        config.bind.http.ip = "not-an-ip".to_string();
        config.observability.log.output = "syslog".to_string();
        config.observability.tracing.enable = true;
        config.observability.tracing.endpoint = "collector:4317".to_string();

        let errors: Vec<_> = config
            .validate()
            .unwrap_err()
            .into_iter()
            .filter(|e| !e.starts_with("Warning:"))
            .collect();
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_toml_round_trip_keeps_access_section() {
        let config = AppConfig::default();
        let text = config.to_toml().unwrap();
        assert!(text.contains("[access"));
        let parsed = AppConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.access.otp.ttl_seconds, 1200);
    }
}
