//! # reportgate
//!
//! 加密健康报告访问服务：邮箱验证码验证、报告加密生成、二次验证解密

pub mod config;
pub mod error;
pub mod server;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{Error, Result};
pub use server::{build_app, http_trace_layer};
