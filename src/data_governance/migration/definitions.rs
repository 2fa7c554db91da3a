//! # Migration Definitions (迁移定义)
//!
//! 每个迁移的元数据定义，包含验证配置。
//!
//! ## 版本号说明
//!
//! Refinery 从文件名解析版本（如 `V20260130__init.sql` -> 版本 20260130）。
//! `MigrationDef.refinery_version` 应与 Refinery 解析结果一致，用于本地验证辅助。
//! 权威版本以 `refinery_schema_history` 表为准。

use crate::data_governance::schema_registry::DatabaseId;

/// 迁移定义
///
/// 注意：此结构主要用于**迁移后验证**，版本由 Refinery 管理。
#[derive(Debug, Clone)]
pub struct MigrationDef {
    /// Refinery 解析的版本号（如文件名 V20260130__init.sql -> 20260130）
    pub refinery_version: i32,
    /// 迁移名称（与文件名中 __ 后的部分对应）
    pub name: &'static str,
    /// SQL 内容（使用 include_str! 嵌入，仅用于本地参考）
    pub sql: &'static str,
    /// 迁移后必须存在的表
    pub expected_tables: &'static [&'static str],
    /// 迁移后必须存在的索引
    pub expected_indexes: &'static [&'static str],
}

impl MigrationDef {
    pub const fn new(refinery_version: i32, name: &'static str, sql: &'static str) -> Self {
        Self {
            refinery_version,
            name,
            sql,
            expected_tables: &[],
            expected_indexes: &[],
        }
    }

    /// 设置预期表
    pub const fn with_expected_tables(mut self, tables: &'static [&'static str]) -> Self {
        self.expected_tables = tables;
        self
    }

    /// 设置预期索引
    pub const fn with_expected_indexes(mut self, indexes: &'static [&'static str]) -> Self {
        self.expected_indexes = indexes;
        self
    }
}

/// 迁移定义集合（每个数据库一个）
pub struct MigrationSet {
    pub database: DatabaseId,
    /// 迁移定义列表（按 refinery_version 排序）
    pub migrations: &'static [MigrationDef],
}

impl MigrationSet {
    /// 获取指定 Refinery 版本的迁移验证配置
    pub fn get(&self, refinery_version: i32) -> Option<&MigrationDef> {
        self.migrations
            .iter()
            .find(|m| m.refinery_version == refinery_version)
    }

    /// 获取所有待执行的迁移（refinery_version > current_version）
    pub fn pending(&self, current_version: i32) -> impl Iterator<Item = &MigrationDef> {
        self.migrations
            .iter()
            .filter(move |m| m.refinery_version > current_version)
    }

    /// 获取最新的 refinery_version
    pub fn latest_version(&self) -> i32 {
        self.migrations
            .last()
            .map(|m| m.refinery_version)
            .unwrap_or(0)
    }

    pub const fn count(&self) -> usize {
        self.migrations.len()
    }
}
