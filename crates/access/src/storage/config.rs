//! 存储后端配置

use serde::{Deserialize, Serialize};

/// 存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// 存储后端类型
    pub backend: StorageBackend,

    /// SQLite 配置（当 backend = "sqlite" 时必需）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqlite: Option<SqliteConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            sqlite: Some(SqliteConfig::default()),
        }
    }
}

/// 存储后端类型枚举
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// 进程内存（重启即丢失，适合开发和测试）
    Memory,
    /// SQLite 数据库
    Sqlite,
}

/// SQLite 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// 数据库文件名，位于 sqlite_path 目录下
    #[serde(default = "default_sqlite_file_name")]
    pub file_name: String,
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            file_name: default_sqlite_file_name(),
        }
    }
}

fn default_sqlite_file_name() -> String {
    "report_access.db".to_string()
}
