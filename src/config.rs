//! 配置模块，负责加载JSON配置文件

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 配置错误
#[derive(Debug, Error)]
#[error("configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

/// 筛选服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenerConfig {
    /// SQLite 数据库路径
    pub database: Option<PathBuf>,
    /// 请求未指定 limit 时的默认值
    pub default_limit: u64,
    /// limit 的上限
    pub max_limit: u64,
    /// 窗口长度上限 (窗口长度会直接嵌入 SQL, 必须有界)
    pub max_window_length: u32,
    /// 衍生指标未指定窗口时读取的历史期数
    pub history_length: u32,
    /// 衍生指标解析的并发数, 1 表示顺序执行
    pub resolver_workers: usize,
    /// 逻辑表名到物理表名的映射
    pub tables: TableMappingConfig,
}

impl Default for ScreenerConfig {
    fn default() -> Self {
        Self {
            database: None,
            default_limit: 100,
            max_limit: 1000,
            max_window_length: 40,
            history_length: 10,
            resolver_workers: 1,
            tables: TableMappingConfig::default(),
        }
    }
}

impl ScreenerConfig {
    /// 从JSON文件加载配置
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();

        // 检查文件是否存在
        if !path_ref.exists() {
            return Err(ConfigError::new(format!(
                "config file not found: {}",
                path_ref.display()
            )));
        }

        // 读取文件内容
        let content = fs::read_to_string(path_ref).map_err(|e| {
            ConfigError::new(format!("cannot read {}: {}", path_ref.display(), e))
        })?;

        // 解析JSON
        let config: ScreenerConfig = serde_json::from_str(&content).map_err(|e| {
            ConfigError::new(format!("cannot parse {}: {}", path_ref.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// 检查取值范围
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.default_limit == 0 || self.default_limit > self.max_limit {
            return Err(ConfigError::new(format!(
                "default_limit must be within 1..={}",
                self.max_limit
            )));
        }
        if self.max_window_length == 0 {
            return Err(ConfigError::new("max_window_length must be positive".into()));
        }
        if self.history_length == 0 || self.history_length > self.max_window_length {
            return Err(ConfigError::new(format!(
                "history_length must be within 1..={}",
                self.max_window_length
            )));
        }
        if self.resolver_workers == 0 {
            return Err(ConfigError::new("resolver_workers must be at least 1".into()));
        }
        self.tables.validate()
    }
}

/// 表映射配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TableMappingConfig {
    /// 逻辑表名到数据库表名的映射
    #[serde(flatten)]
    pub mappings: HashMap<String, String>,
}

impl TableMappingConfig {
    /// 获取逻辑表对应的物理表名，如果不存在则返回逻辑表名本身
    pub fn get_table_name(&self, table: &str) -> String {
        self.mappings
            .get(table)
            .cloned()
            .unwrap_or_else(|| table.to_string())
    }

    /// 获取所有映射
    pub fn get_mappings(&self) -> &HashMap<String, String> {
        &self.mappings
    }

    /// 表名会直接拼接进 SQL, 只接受普通标识符 (最多一个 schema 前缀)
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (table, physical) in &self.mappings {
            if !is_plain_identifier(physical) {
                return Err(ConfigError::new(format!(
                    "table '{}' maps to invalid identifier '{}'",
                    table, physical
                )));
            }
        }
        Ok(())
    }
}

fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
