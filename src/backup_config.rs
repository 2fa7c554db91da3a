//! 数据治理配置模块
//!
//! 提供治理引擎的配置读取，支持：
//! - 数据目录 / 备份目录 / 导出目录
//! - 最大备份数限制（保留策略）
//! - 事件通道容量、检查点间隔
//! - 旧版聊天数据库路径
//!
//! 加载顺序：`.env` -> 环境变量（`DSTU_GOVERNANCE__*`）-> 可选 TOML 文件。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::data_governance::backup::AssetBackupConfig;
use crate::data_governance::{GovernanceError, GovernanceResult};

/// 环境变量前缀
const ENV_PREFIX: &str = "DSTU_GOVERNANCE";

/// 治理引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct GovernanceConfig {
    /// 应用数据根目录（数据库位于 `<data_dir>/databases/`）
    pub data_dir: PathBuf,

    /// 自定义备份目录（None 表示 `<data_dir>/backups`）
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,

    /// 自定义导出目录（None 表示 `<data_dir>/exports`）
    #[serde(default)]
    pub export_dir: Option<PathBuf>,

    /// 最大完整备份数量，0 表示不限制
    #[serde(default = "default_max_backup_count")]
    pub max_backup_count: u32,

    /// 进度事件通道容量
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,

    /// 每处理多少个条目持久化一次检查点
    #[serde(default = "default_checkpoint_interval_items")]
    pub checkpoint_interval_items: u64,

    /// 旧版错题/聊天数据库（None 表示 `<data_dir>/mistakes.db`）
    #[serde(default)]
    pub legacy_database_path: Option<PathBuf>,

    /// 已结束任务在内存中保留的秒数
    #[serde(default = "default_job_retention_secs")]
    pub job_retention_secs: u64,

    /// 磁盘空间预检倍数（需要 预估大小 * 倍数 的可用空间）
    #[serde(default = "default_min_free_space_multiplier")]
    pub min_free_space_multiplier: u64,

    /// 默认 ZIP 压缩级别（0 = 仅存储）
    #[serde(default = "default_compression_level")]
    pub default_compression_level: u32,

    /// 资产备份配置
    #[serde(default)]
    pub assets: AssetBackupConfig,
}

fn default_max_backup_count() -> u32 {
    5
}

fn default_event_channel_capacity() -> usize {
    64
}

fn default_checkpoint_interval_items() -> u64 {
    1
}

fn default_job_retention_secs() -> u64 {
    300
}

fn default_min_free_space_multiplier() -> u64 {
    2
}

fn default_compression_level() -> u32 {
    6
}

impl GovernanceConfig {
    /// 以默认值构造（测试和嵌入场景使用）
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            backup_dir: None,
            export_dir: None,
            max_backup_count: default_max_backup_count(),
            event_channel_capacity: default_event_channel_capacity(),
            checkpoint_interval_items: default_checkpoint_interval_items(),
            legacy_database_path: None,
            job_retention_secs: default_job_retention_secs(),
            min_free_space_multiplier: default_min_free_space_multiplier(),
            default_compression_level: default_compression_level(),
            assets: AssetBackupConfig::default(),
        }
    }

    /// 从环境变量和可选配置文件加载
    ///
    /// `config_file` 为不带扩展名的路径（如 `config/governance`），文件不存在时跳过。
    pub fn from_env_and_file(config_file: Option<&Path>) -> GovernanceResult<Self> {
        dotenvy::dotenv().ok();
        let mut builder = config::Config::builder().add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .list_separator(",")
                .try_parsing(true),
        );
        if let Some(path) = config_file {
            let with_ext = path.with_extension("toml");
            if with_ext.exists() || path.exists() {
                builder = builder.add_source(config::File::from(path.to_path_buf()).required(false));
            }
        }
        let loaded = builder
            .build()
            .map_err(|e| GovernanceError::Configuration(format!("加载配置失败: {}", e)))?;
        let cfg: GovernanceConfig = loaded
            .try_deserialize()
            .map_err(|e| GovernanceError::Configuration(format!("解析配置失败: {}", e)))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// 校验配置合法性
    pub fn validate(&self) -> GovernanceResult<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(GovernanceError::Configuration(
                "data_dir 不能为空".to_string(),
            ));
        }
        if self.event_channel_capacity == 0 {
            return Err(GovernanceError::Configuration(
                "event_channel_capacity 必须大于 0".to_string(),
            ));
        }
        if self.checkpoint_interval_items == 0 {
            return Err(GovernanceError::Configuration(
                "checkpoint_interval_items 必须大于 0".to_string(),
            ));
        }
        if self.default_compression_level > 9 {
            return Err(GovernanceError::Configuration(format!(
                "default_compression_level 超出范围 (0-9): {}",
                self.default_compression_level
            )));
        }
        Ok(())
    }

    pub fn databases_dir(&self) -> PathBuf {
        self.data_dir.join("databases")
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    pub fn export_dir(&self) -> PathBuf {
        self.export_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("exports"))
    }

    /// 任务持久化目录
    pub fn jobs_dir(&self) -> PathBuf {
        self.data_dir.join("jobs")
    }

    /// 审计库路径（不属于受治理的数据库集合）
    pub fn audit_db_path(&self) -> PathBuf {
        self.databases_dir().join("audit.db")
    }

    pub fn legacy_database_path(&self) -> PathBuf {
        self.legacy_database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("mistakes.db"))
    }

    /// 保留数量（None 表示不限制）
    pub fn retention_limit(&self) -> Option<usize> {
        match self.max_backup_count {
            0 => None,
            n => Some(n as usize),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use tempfile::TempDir;

    #[test]
    fn test_default_paths_derive_from_data_dir() {
        let cfg = GovernanceConfig::new("/data");
        assert_eq!(cfg.backup_dir(), PathBuf::from("/data/backups"));
        assert_eq!(cfg.export_dir(), PathBuf::from("/data/exports"));
        assert_eq!(cfg.audit_db_path(), PathBuf::from("/data/databases/audit.db"));
        assert_eq!(cfg.legacy_database_path(), PathBuf::from("/data/mistakes.db"));
        assert_eq!(cfg.retention_limit(), Some(5));
    }

    #[test]
    fn test_zero_max_backup_count_means_unlimited() {
        let mut cfg = GovernanceConfig::new("/data");
        cfg.max_backup_count = 0;
        assert_eq!(cfg.retention_limit(), None);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = GovernanceConfig::new("/data");
        cfg.default_compression_level = 12;
        assert_matches!(cfg.validate(), Err(GovernanceError::Configuration(_)));

        let mut cfg = GovernanceConfig::new("/data");
        cfg.event_channel_capacity = 0;
        assert_matches!(cfg.validate(), Err(GovernanceError::Configuration(_)));
    }

    #[test]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("governance.toml");
        std::fs::write(
            &file,
            format!(
                "data_dir = {:?}\nmax_backup_count = 3\ndefault_compression_level = 0\n",
                dir.path().to_string_lossy()
            ),
        )
        .unwrap();

        let cfg = GovernanceConfig::from_env_and_file(Some(&file)).unwrap();
        assert_eq!(cfg.max_backup_count, 3);
        assert_eq!(cfg.default_compression_level, 0);
        assert_eq!(cfg.event_channel_capacity, 64);
    }
}
