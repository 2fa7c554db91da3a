//! # Schema Registry (结构演进状态模块)
//!
//! 记录所有数据库的版本状态、依赖关系、迁移历史。
//!
//! ## 设计原则
//!
//! **派生视图，非文件源**：
//! - 权威数据源：各数据库内的 `refinery_schema_history` 表
//! - SchemaRegistry：从各数据库实时聚合，作为缓存视图
//! - 不单独持久化 registry.json，避免双源不一致
//!
//! ## Refinery 表结构
//!
//! Refinery 自动创建的 `refinery_schema_history` 表：
//! - `version`: INTEGER - 迁移版本号
//! - `name`: TEXT - 迁移名称（如 V20260130__init）
//! - `applied_on`: TEXT - 应用时间（ISO 8601 格式）
//! - `checksum`: TEXT - SQL 内容的校验和

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// 数据库标识（治理范围内的数据库）
///
/// 每个数据库位于 `<data_dir>/databases/<id>.db`。
/// 审计库 `audit.db` 与旧版 `mistakes.db` 不在治理集合内。
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseId {
    Vfs,
    ChatV2,
    Notes,
    Graph,
    Vectors,
}

impl DatabaseId {
    /// 声明顺序（拓扑排序时同层按此顺序输出）
    pub const ALL: [DatabaseId; 5] = [
        DatabaseId::Vfs,
        DatabaseId::ChatV2,
        DatabaseId::Notes,
        DatabaseId::Graph,
        DatabaseId::Vectors,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseId::Vfs => "vfs",
            DatabaseId::ChatV2 => "chat_v2",
            DatabaseId::Notes => "notes",
            DatabaseId::Graph => "graph",
            DatabaseId::Vectors => "vectors",
        }
    }

    pub fn parse(s: &str) -> Option<DatabaseId> {
        match s {
            "vfs" => Some(DatabaseId::Vfs),
            "chat_v2" => Some(DatabaseId::ChatV2),
            "notes" => Some(DatabaseId::Notes),
            "graph" => Some(DatabaseId::Graph),
            "vectors" => Some(DatabaseId::Vectors),
            _ => None,
        }
    }

    /// 数据库文件名
    pub fn file_name(&self) -> String {
        format!("{}.db", self.as_str())
    }

    /// 数据库在数据目录下的路径
    pub fn path_in(&self, data_dir: &Path) -> PathBuf {
        data_dir.join("databases").join(self.file_name())
    }

    /// 返回此数据库依赖的其他数据库（必须先迁移）
    pub fn dependencies(&self) -> &'static [DatabaseId] {
        match self {
            DatabaseId::Vfs => &[],
            DatabaseId::ChatV2 => &[DatabaseId::Vfs], // 聊天附件引用 VFS 资源
            DatabaseId::Notes => &[DatabaseId::Vfs],
            DatabaseId::Graph => &[DatabaseId::Notes],
            DatabaseId::Vectors => &[DatabaseId::Vfs],
        }
    }

    /// 返回所有数据库 ID（按依赖顺序排序）
    pub fn all_ordered() -> Vec<DatabaseId> {
        match DependencyGraph::default().topological_order() {
            Ok(order) => order,
            Err(e) => {
                warn!("[SchemaRegistry] 默认依赖图无法排序，回退声明顺序: {}", e);
                Self::ALL.to_vec()
            }
        }
    }
}

impl std::fmt::Display for DatabaseId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 数据库依赖图
///
/// 默认图来自 [`DatabaseId::dependencies`]；测试和嵌入场景可以注入自定义图。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyGraph {
    edges: BTreeMap<DatabaseId, Vec<DatabaseId>>,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        let edges = DatabaseId::ALL
            .iter()
            .map(|id| (*id, id.dependencies().to_vec()))
            .collect();
        Self { edges }
    }
}

impl DependencyGraph {
    /// 自定义依赖边（未出现的数据库视为无依赖）
    pub fn with_edges(edges: &[(DatabaseId, DatabaseId)]) -> Self {
        let mut map: BTreeMap<DatabaseId, Vec<DatabaseId>> =
            DatabaseId::ALL.iter().map(|id| (*id, Vec::new())).collect();
        for (from, to) in edges {
            map.entry(*from).or_default().push(*to);
        }
        Self { edges: map }
    }

    pub fn dependencies_of(&self, id: DatabaseId) -> &[DatabaseId] {
        self.edges.get(&id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// 拓扑排序（依赖在前）
    ///
    /// 存在环时返回 `DependencyCycle`，携带环上尚未排序的数据库。
    pub fn topological_order(&self) -> Result<Vec<DatabaseId>, SchemaRegistryError> {
        let mut ordered: Vec<DatabaseId> = Vec::with_capacity(DatabaseId::ALL.len());
        while ordered.len() < DatabaseId::ALL.len() {
            let next = DatabaseId::ALL.iter().copied().find(|id| {
                !ordered.contains(id)
                    && self
                        .dependencies_of(*id)
                        .iter()
                        .all(|dep| ordered.contains(dep))
            });
            match next {
                Some(id) => ordered.push(id),
                None => {
                    let remaining: Vec<DatabaseId> = DatabaseId::ALL
                        .iter()
                        .copied()
                        .filter(|id| !ordered.contains(id))
                        .collect();
                    return Err(SchemaRegistryError::DependencyCycle(remaining));
                }
            }
        }
        Ok(ordered)
    }
}

/// 数据库状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStatus {
    pub id: DatabaseId,
    /// 当前 schema 版本
    pub schema_version: u32,
    /// 迁移历史
    pub migration_history: Vec<MigrationRecord>,
    /// 当前 schema 的 checksum
    pub checksum: String,
    /// 最后更新时间
    pub updated_at: String,
}

/// 迁移记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: u32,
    pub name: String,
    /// SQL 内容的 checksum
    pub checksum: String,
    pub applied_at: String,
}

/// Schema 注册表
///
/// **注意**：这是一个派生视图，从各数据库实时聚合生成。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaRegistry {
    pub databases: HashMap<DatabaseId, DatabaseStatus>,
    /// 全局版本（各库版本的最小值，最慢的库决定全局版本）
    pub global_version: u64,
    /// 聚合时间
    pub aggregated_at: String,
}

/// Refinery 迁移历史表名
pub const REFINERY_SCHEMA_HISTORY_TABLE: &str = "refinery_schema_history";

impl SchemaRegistry {
    pub fn new() -> Self {
        Self {
            databases: HashMap::new(),
            global_version: 0,
            aggregated_at: chrono::Utc::now().to_rfc3339(),
        }
    }

    /// 从各数据库实时聚合状态
    pub fn aggregate_from_databases<'a, I>(connections: I) -> Result<Self, SchemaRegistryError>
    where
        I: Iterator<Item = (DatabaseId, &'a Connection)>,
    {
        let mut registry = Self::new();
        let now = chrono::Utc::now().to_rfc3339();

        for (db_id, conn) in connections {
            debug!("[SchemaRegistry] 聚合数据库状态: {}", db_id);
            let status = Self::read_database_status(db_id, conn)?;
            registry.databases.insert(db_id, status);
        }

        registry.global_version = registry.calculate_global_version();
        registry.aggregated_at = now;

        info!(
            "[SchemaRegistry] 聚合完成: {} 个数据库, 全局版本: {}",
            registry.databases.len(),
            registry.global_version
        );

        Ok(registry)
    }

    /// 从单个数据库连接读取状态（无迁移历史表时为版本 0）
    pub fn read_database_status(
        db_id: DatabaseId,
        conn: &Connection,
    ) -> Result<DatabaseStatus, SchemaRegistryError> {
        if !table_exists(conn, REFINERY_SCHEMA_HISTORY_TABLE)? {
            return Ok(DatabaseStatus {
                id: db_id,
                schema_version: 0,
                migration_history: vec![],
                checksum: String::new(),
                updated_at: String::new(),
            });
        }

        let migration_history = read_migration_records(conn)?;
        let schema_version = migration_history
            .iter()
            .map(|r| r.version)
            .max()
            .unwrap_or(0);
        let checksum = calculate_aggregated_checksum(&migration_history);
        let updated_at = migration_history
            .iter()
            .map(|r| r.applied_at.as_str())
            .max()
            .unwrap_or("")
            .to_string();

        Ok(DatabaseStatus {
            id: db_id,
            schema_version,
            migration_history,
            checksum,
            updated_at,
        })
    }

    pub fn get_status(&self, id: &DatabaseId) -> Option<&DatabaseStatus> {
        self.databases.get(id)
    }

    pub fn get_schema_version(&self, id: &DatabaseId) -> Option<u32> {
        self.databases.get(id).map(|s| s.schema_version)
    }

    /// 检查依赖关系
    ///
    /// 依赖缺失或依赖版本为 0 而自身已初始化时，视为未满足。
    pub fn check_dependencies(&self, graph: &DependencyGraph) -> Result<(), SchemaRegistryError> {
        for id in graph.topological_order()? {
            let Some(current) = self.databases.get(&id) else {
                continue;
            };
            for dep in graph.dependencies_of(id) {
                match self.databases.get(dep) {
                    Some(dep_status)
                        if dep_status.schema_version > 0 || current.schema_version == 0 => {}
                    _ => {
                        return Err(SchemaRegistryError::DependencyNotSatisfied {
                            database: id,
                            missing_dependency: *dep,
                        })
                    }
                }
            }
        }
        Ok(())
    }

    /// 计算全局版本
    ///
    /// 全局版本 = 所有数据库中的最小版本；没有数据库时为 0
    pub fn calculate_global_version(&self) -> u64 {
        self.databases
            .values()
            .map(|s| s.schema_version as u64)
            .min()
            .unwrap_or(0)
    }

    pub fn needs_migration(&self, db_id: &DatabaseId, target_version: u32) -> bool {
        match self.databases.get(db_id) {
            Some(status) => status.schema_version < target_version,
            None => true,
        }
    }

    /// 获取所有数据库的版本摘要
    pub fn get_summary(&self) -> BTreeMap<String, u32> {
        self.databases
            .iter()
            .map(|(id, status)| (id.as_str().to_string(), status.schema_version))
            .collect()
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// 检查表是否存在
pub fn table_exists(conn: &Connection, table_name: &str) -> Result<bool, SchemaRegistryError> {
    let sql = "SELECT name FROM sqlite_master WHERE type='table' AND name = ?1";
    let result: Option<String> = conn
        .query_row(sql, [table_name], |row| row.get(0))
        .optional()
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;
    Ok(result.is_some())
}

/// 读取当前 schema 版本（`refinery_schema_history` 不存在时为 0）
pub fn read_schema_version(conn: &Connection) -> Result<u32, SchemaRegistryError> {
    if !table_exists(conn, REFINERY_SCHEMA_HISTORY_TABLE)? {
        return Ok(0);
    }
    let version: Option<i64> = conn
        .query_row(
            "SELECT MAX(version) FROM refinery_schema_history",
            [],
            |row| row.get(0),
        )
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;
    Ok(version.unwrap_or(0) as u32)
}

fn read_migration_records(conn: &Connection) -> Result<Vec<MigrationRecord>, SchemaRegistryError> {
    let sql = format!(
        "SELECT version, name, applied_on, checksum FROM {} ORDER BY version ASC",
        REFINERY_SCHEMA_HISTORY_TABLE
    );
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;
    let records = stmt
        .query_map([], |row| {
            Ok(MigrationRecord {
                version: row.get::<_, i64>(0)? as u32,
                name: row.get(1)?,
                applied_at: row.get(2)?,
                checksum: row.get(3)?,
            })
        })
        .map_err(|e| SchemaRegistryError::Database(e.to_string()))?;

    let mut result = Vec::new();
    for record in records {
        result.push(record.map_err(|e| SchemaRegistryError::Database(e.to_string()))?);
    }
    Ok(result)
}

/// 将所有迁移的 checksum 按版本顺序拼接后计算 SHA-256
fn calculate_aggregated_checksum(records: &[MigrationRecord]) -> String {
    if records.is_empty() {
        return String::new();
    }
    let mut sorted: Vec<_> = records.iter().collect();
    sorted.sort_by_key(|r| r.version);
    let combined = sorted
        .iter()
        .map(|r| format!("{}:{}", r.version, r.checksum))
        .collect::<Vec<_>>()
        .join("|");

    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    hex::encode(hasher.finalize())
}

/// Schema Registry 错误类型
#[derive(Debug, thiserror::Error)]
pub enum SchemaRegistryError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Dependency cycle detected among: {0:?}")]
    DependencyCycle(Vec<DatabaseId>),

    #[error("Dependency not satisfied: {database} requires {missing_dependency}")]
    DependencyNotSatisfied {
        database: DatabaseId,
        missing_dependency: DatabaseId,
    },
}

impl From<rusqlite::Error> for SchemaRegistryError {
    fn from(err: rusqlite::Error) -> Self {
        SchemaRegistryError::Database(err.to_string())
    }
}
