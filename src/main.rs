//! reportgate 主程序
//!
//! 加载配置，初始化日志与存储，启动报告访问 HTTP 服务

mod cli;
mod observability;

use anyhow::Context;
use clap::Parser;
use observability::init_observability;
use report_access::{ReportCipher, create_access_state, register_metrics};
use reportgate::config::AppConfig;
use reportgate::server;
use std::path::{Path, PathBuf};

use tracing::{error, info, warn};

macro_rules! bootstrap_info {
    ($($arg:tt)*) => {
        println!($($arg)*);
    };
}

macro_rules! bootstrap_error {
    ($($arg:tt)*) => {
        eprintln!($($arg)*);
    };
}

use cli::{Cli, Commands};
use reportgate::error::{Error, Result};

/// Application launcher utilities
struct ApplicationLauncher;

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Test { config_file }) => {
            let config_path =
                ApplicationLauncher::find_config_file(config_file.as_ref().unwrap_or(&cli.config))?;
            ApplicationLauncher::test_config_file(&config_path)
        }
        Some(Commands::Keygen) => {
            println!("{}", ReportCipher::generate_key());
            Ok(())
        }
        None => {
            let config_path = ApplicationLauncher::find_config_file(&cli.config)?;

            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;

            runtime.block_on(ApplicationLauncher::run_application(&config_path))
        }
    }
}

impl ApplicationLauncher {
    /// Find config file with fallback locations
    fn find_config_file(provided_path: &PathBuf) -> Result<PathBuf> {
        if provided_path != Path::new("config.toml") {
            if provided_path.exists() {
                bootstrap_info!("Using provided config file: {:?}", provided_path);
                return Ok(provided_path.clone());
            } else {
                bootstrap_error!("Provided config file not found: {:?}", provided_path);
                return Err(Error::custom(format!(
                    "Config file not found: {provided_path:?}"
                )));
            }
        }

        let fallback_paths = vec![
            PathBuf::from("config.toml"),
            PathBuf::from("/etc/reportgate/config.toml"),
        ];

        bootstrap_info!("Searching for config file in default locations...");

        for path in &fallback_paths {
            if path.exists() {
                bootstrap_info!("Found config file: {:?}", path);
                return Ok(path.clone());
            } else {
                bootstrap_info!("Config not found at: {:?}", path);
            }
        }

        bootstrap_error!("No configuration file found!");
        bootstrap_error!("Please create a config file in one of these locations:");
        for (i, path) in fallback_paths.iter().enumerate() {
            bootstrap_error!("  {}. {:?}", i + 1, path);
        }
        bootstrap_error!("Or specify a custom path with: reportgate --config <path>");

        Err(Error::custom(
            "No configuration file found. Please create one or specify path with --config",
        ))
    }

    /// 测试配置文件是否有效
    fn test_config_file(config_path: &Path) -> Result<()> {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();

        match AppConfig::from_file(config_path) {
            Ok(config) => {
                info!("✅ 配置文件解析成功: {:?}", config_path);

                if let Err(errors) = config.validate() {
                    warn!("配置验证发现问题:");
                    for (i, err) in errors.iter().enumerate() {
                        if err.starts_with("Warning:") {
                            info!("  {}. ⚠️  {}", i + 1, err);
                        } else {
                            error!("  {}. ❌ {}", i + 1, err);
                        }
                    }
                    if errors.iter().any(|e| !e.starts_with("Warning:")) {
                        return Err(Error::service_validation("配置验证失败".to_string()));
                    }
                }

                info!("✅ 配置验证通过");
                Ok(())
            }
            Err(e) => {
                error!("❌ 配置文件解析失败: {}", e);
                Err(Error::service_validation(format!("配置解析失败: {e}")))
            }
        }
    }

    /// 运行应用程序的主入口
    async fn run_application(config_path: &Path) -> Result<()> {
        bootstrap_info!("📄 加载配置文件: {:?}", config_path);

        let config = match AppConfig::from_file(config_path) {
            Ok(config) => {
                bootstrap_info!("✅ 配置加载成功");

                if let Err(errors) = config.validate() {
                    let mut has_critical_errors = false;
                    for (i, err) in errors.iter().enumerate() {
                        if err.starts_with("Warning:") {
                            bootstrap_info!("  {}. ⚠️  {}", i + 1, err);
                        } else {
                            bootstrap_error!("  {}. ❌ {}", i + 1, err);
                            has_critical_errors = true;
                        }
                    }
                    if has_critical_errors {
                        return Err(Error::custom("配置验证失败，请修复上述错误".to_string()));
                    }
                }

                config
            }
            Err(e) => {
                bootstrap_error!("❌ 配置加载失败: {}", e);
                return Err(Error::custom(format!("配置加载失败: {e}")));
            }
        };

        if !config.sqlite_path.exists() {
            std::fs::create_dir_all(&config.sqlite_path).with_context(|| {
                format!(
                    "Failed to create SQLite data directory: {}",
                    config.sqlite_path.display()
                )
            })?;
        }

        let _observability_guard = init_observability(&config)?;

        Self::run_service(config).await
    }

    /// 初始化存储和路由并运行 HTTP 服务
    async fn run_service(config: AppConfig) -> Result<()> {
        info!("🚀 启动 reportgate: name={}, env={}", config.name, config.env);

        if let Err(e) = register_metrics() {
            warn!(
                "Prometheus metrics registration warning (may already be registered): {}",
                e
            );
        }

        let state = create_access_state(&config.access, &config.sqlite_path).await?;
        info!(
            "✅ 报告访问服务初始化完成 (storage={})",
            state.storage.backend_name()
        );

        let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(10);
        setup_ctrl_c_handler(shutdown_tx.clone()).await;

        let listener = server::bind(&config).await?;
        Self::display_service_info(&config);

        let app = server::build_app(state);
        let handle = tokio::spawn(server::serve(listener, app, shutdown_tx.clone()));

        match handle.await {
            Ok(result) => result?,
            Err(e) => {
                error!("Service task terminated unexpectedly: {}", e);
                let _ = shutdown_tx.send(());
                return Err(Error::Task(e));
            }
        }

        info!("🛑 服务已安全关闭");
        Ok(())
    }

    /// 显示服务信息
    fn display_service_info(config: &AppConfig) {
        let base = format!("http://{}:{}", config.bind.http.ip, config.bind.http.port);

        info!("📡 HTTP 服务器监听在: {}", base);
        info!("🔧 可用的API端点:");
        for path in [
            "/request-email-otp",
            "/verify-email-otp",
            "/generate-report",
            "/request-decrypt-otp",
            "/verify-decrypt-otp",
            "/decrypt-with-token",
        ] {
            info!("  - POST {}{}", base, path);
        }
        info!("  - GET  {}/health", base);
        info!("  - GET  {}/metrics", base);
    }
}

/// 设置Ctrl-C信号处理程序
async fn setup_ctrl_c_handler(shutdown_tx: tokio::sync::broadcast::Sender<()>) {
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("无法监听Ctrl-C信号: {}", e);
            return;
        }
        info!("收到Ctrl-C信号，开始优雅关闭...");
        let _ = shutdown_tx.send(());
    });
}
