//! # 数据库句柄
//!
//! 治理引擎只通过 [`Database`] trait 接触受治理的数据库：
//! 一致性快照（dump）、从快照恢复（restore_from）、版本读取与完整性检查。
//! 默认实现 [`SqliteDatabase`] 基于 SQLite Online Backup API。

use rusqlite::backup::{Backup, StepResult};
use rusqlite::{Connection, OpenFlags};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::schema_registry::{self, DatabaseId};

/// 数据库操作错误
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("SQLite error on {database}: {source}")]
    Sqlite {
        database: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("IO error on {database}: {source}")]
    Io {
        database: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Integrity check failed on {database}: {detail}")]
    Integrity { database: String, detail: String },

    #[error("Snapshot not found: {0}")]
    SnapshotNotFound(PathBuf),
}

impl DatabaseError {
    fn sqlite(id: DatabaseId, source: rusqlite::Error) -> Self {
        DatabaseError::Sqlite {
            database: id.as_str().to_string(),
            source,
        }
    }

    fn io(id: DatabaseId, source: std::io::Error) -> Self {
        DatabaseError::Io {
            database: id.as_str().to_string(),
            source,
        }
    }
}

/// 受治理数据库的抽象句柄
///
/// 除 `id` 与 `live_path` 外都有基于 SQLite 的默认实现，
/// 测试可以包装 [`SqliteDatabase`] 只覆盖需要注入故障的方法。
pub trait Database: Send + Sync {
    fn id(&self) -> DatabaseId;

    /// 线上数据库文件路径
    fn live_path(&self) -> &Path;

    fn exists(&self) -> bool {
        self.live_path().exists()
    }

    /// 打开读写连接（父目录不存在时创建）
    fn open(&self) -> Result<Connection, DatabaseError> {
        if let Some(parent) = self.live_path().parent() {
            fs::create_dir_all(parent).map_err(|e| DatabaseError::io(self.id(), e))?;
        }
        Connection::open(self.live_path()).map_err(|e| DatabaseError::sqlite(self.id(), e))
    }

    /// 将 WAL 内容写回主库文件
    fn checkpoint(&self) -> Result<(), DatabaseError> {
        if !self.exists() {
            return Ok(());
        }
        let conn = self.open()?;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")
            .map_err(|e| DatabaseError::sqlite(self.id(), e))
    }

    /// 生成时间点一致的快照文件，返回快照大小
    fn dump(&self, dest: &Path) -> Result<u64, DatabaseError> {
        self.checkpoint()?;
        let src = self.open()?;
        backup_connection_to(self.id(), &src, dest)?;
        fs::metadata(dest)
            .map(|m| m.len())
            .map_err(|e| DatabaseError::io(self.id(), e))
    }

    /// 用快照文件替换线上数据
    fn restore_from(&self, snapshot: &Path) -> Result<(), DatabaseError> {
        if !snapshot.exists() {
            return Err(DatabaseError::SnapshotNotFound(snapshot.to_path_buf()));
        }
        if self.exists() {
            self.checkpoint()?;
            remove_sidecars(self.id(), self.live_path())?;
        }
        let src = Connection::open_with_flags(snapshot, OpenFlags::SQLITE_OPEN_READ_ONLY)
            .map_err(|e| DatabaseError::sqlite(self.id(), e))?;
        let mut dest = self.open()?;
        {
            let backup =
                Backup::new(&src, &mut dest).map_err(|e| DatabaseError::sqlite(self.id(), e))?;
            backup
                .run_to_completion(100, Duration::from_millis(50), None)
                .map_err(|e| DatabaseError::sqlite(self.id(), e))?;
        }
        debug!("[Database] 已从快照恢复: {} <- {:?}", self.id(), snapshot);
        Ok(())
    }

    /// 删除线上数据库文件（回滚"恢复前不存在"的数据库）
    fn remove(&self) -> Result<(), DatabaseError> {
        if self.exists() {
            fs::remove_file(self.live_path()).map_err(|e| DatabaseError::io(self.id(), e))?;
        }
        remove_sidecars(self.id(), self.live_path())
    }

    fn schema_version(&self) -> Result<u32, DatabaseError> {
        if !self.exists() {
            return Ok(0);
        }
        let conn = self.open()?;
        schema_registry::read_schema_version(&conn).map_err(|e| DatabaseError::Integrity {
            database: self.id().as_str().to_string(),
            detail: e.to_string(),
        })
    }

    fn integrity_check(&self) -> Result<(), DatabaseError> {
        let conn = self.open()?;
        run_integrity_check(self.id(), &conn)
    }
}

/// SQLite 数据库句柄
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    id: DatabaseId,
    path: PathBuf,
}

impl SqliteDatabase {
    pub fn new(id: DatabaseId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
        }
    }

    /// 标准布局：`<data_dir>/databases/<id>.db`
    pub fn in_data_dir(id: DatabaseId, data_dir: &Path) -> Self {
        Self::new(id, id.path_in(data_dir))
    }
}

impl Database for SqliteDatabase {
    fn id(&self) -> DatabaseId {
        self.id
    }

    fn live_path(&self) -> &Path {
        &self.path
    }
}

/// 受治理的数据库集合（按依赖顺序）
#[derive(Clone)]
pub struct DatabaseSet {
    databases: Vec<Arc<dyn Database>>,
}

impl DatabaseSet {
    /// 数据目录下的标准五库
    pub fn standard(data_dir: &Path) -> Self {
        let databases = DatabaseId::all_ordered()
            .into_iter()
            .map(|id| Arc::new(SqliteDatabase::in_data_dir(id, data_dir)) as Arc<dyn Database>)
            .collect();
        Self { databases }
    }

    /// 自定义集合（会按依赖顺序重排）
    pub fn from_databases(mut databases: Vec<Arc<dyn Database>>) -> Self {
        let order = DatabaseId::all_ordered();
        databases.sort_by_key(|db| order.iter().position(|id| *id == db.id()).unwrap_or(usize::MAX));
        Self { databases }
    }

    /// 替换某个数据库的句柄（测试注入故障使用）
    pub fn replace(&mut self, database: Arc<dyn Database>) {
        if let Some(slot) = self.databases.iter_mut().find(|d| d.id() == database.id()) {
            *slot = database;
        } else {
            self.databases.push(database);
        }
    }

    pub fn get(&self, id: DatabaseId) -> Option<&Arc<dyn Database>> {
        self.databases.iter().find(|d| d.id() == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Database>> {
        self.databases.iter()
    }

    pub fn ids(&self) -> Vec<DatabaseId> {
        self.databases.iter().map(|d| d.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

/// 使用 Backup API 将连接内容复制到目标文件
///
/// 分批复制（每次 100 页），源库繁忙时等待 50ms 重试。
/// 目标文件使用 DELETE 日志模式，保证快照是单一文件。
pub fn backup_connection_to(id: DatabaseId, src: &Connection, dest: &Path) -> Result<(), DatabaseError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| DatabaseError::io(id, e))?;
    }
    if dest.exists() {
        fs::remove_file(dest).map_err(|e| DatabaseError::io(id, e))?;
    }
    let mut dest_conn = Connection::open(dest).map_err(|e| DatabaseError::sqlite(id, e))?;
    {
        let backup = Backup::new(src, &mut dest_conn).map_err(|e| DatabaseError::sqlite(id, e))?;
        loop {
            match backup.step(100).map_err(|e| DatabaseError::sqlite(id, e))? {
                StepResult::Done => break,
                StepResult::More => {}
                _ => std::thread::sleep(Duration::from_millis(50)),
            }
        }
    }
    dest_conn
        .execute_batch("PRAGMA journal_mode=DELETE")
        .map_err(|e| DatabaseError::sqlite(id, e))?;
    Ok(())
}

/// 执行 `PRAGMA integrity_check`
pub fn run_integrity_check(id: DatabaseId, conn: &Connection) -> Result<(), DatabaseError> {
    let result: String = conn
        .query_row("PRAGMA integrity_check", [], |row| row.get(0))
        .map_err(|e| DatabaseError::sqlite(id, e))?;
    if result == "ok" {
        Ok(())
    } else {
        Err(DatabaseError::Integrity {
            database: id.as_str().to_string(),
            detail: result,
        })
    }
}

/// 只读打开快照文件
pub fn open_snapshot_read_only(id: DatabaseId, path: &Path) -> Result<Connection, DatabaseError> {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| DatabaseError::sqlite(id, e))
}

fn remove_sidecars(id: DatabaseId, path: &Path) -> Result<(), DatabaseError> {
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        let sidecar = PathBuf::from(sidecar);
        if sidecar.exists() {
            fs::remove_file(&sidecar).map_err(|e| DatabaseError::io(id, e))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn seed(db: &SqliteDatabase, value: &str) {
        let conn = db.open().unwrap();
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; CREATE TABLE IF NOT EXISTS kv (k TEXT PRIMARY KEY, v TEXT);",
        )
        .unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO kv (k, v) VALUES ('key', ?1)",
            [value],
        )
        .unwrap();
    }

    fn read(db: &SqliteDatabase) -> String {
        db.open()
            .unwrap()
            .query_row("SELECT v FROM kv WHERE k = 'key'", [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_dump_and_restore_round_trip() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::in_data_dir(DatabaseId::Notes, dir.path());
        seed(&db, "old");

        let snapshot = dir.path().join("snap").join("notes.db");
        let size = db.dump(&snapshot).unwrap();
        assert!(size > 0);

        seed(&db, "new");
        assert_eq!(read(&db), "new");

        db.restore_from(&snapshot).unwrap();
        assert_eq!(read(&db), "old");
        db.integrity_check().unwrap();
    }

    #[test]
    fn test_restore_from_missing_snapshot_fails() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::in_data_dir(DatabaseId::Vfs, dir.path());
        let err = db.restore_from(&dir.path().join("missing.db")).unwrap_err();
        assert!(matches!(err, DatabaseError::SnapshotNotFound(_)));
    }

    #[test]
    fn test_schema_version_of_missing_database_is_zero() {
        let dir = TempDir::new().unwrap();
        let db = SqliteDatabase::in_data_dir(DatabaseId::Graph, dir.path());
        assert_eq!(db.schema_version().unwrap(), 0);
        assert!(!db.exists());
    }

    #[test]
    fn test_standard_set_is_dependency_ordered() {
        let dir = TempDir::new().unwrap();
        let set = DatabaseSet::standard(dir.path());
        assert_eq!(set.len(), 5);
        assert_eq!(set.ids(), DatabaseId::all_ordered());
    }
}
