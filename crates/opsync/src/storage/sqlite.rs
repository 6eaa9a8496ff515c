use crate::config::StorageConfig;
use crate::frame::Frame;
use crate::op::Op;
use crate::storage::{Storage, StorageError};
use crate::uuid::Uuid;
use crate::version::VersionVector;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, params};
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite implementation of the [`Storage`] trait.
///
/// Ops are rows keyed by (object, event) in textual form; event tokens are
/// zero-trimmed Base64x64, so SQLite's text ordering is event order.
pub struct SqliteStorage {
    pool: DbPool,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self, StorageError> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = rusqlite::Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::create_schema(&conn)?;
        }

        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder().max_size(4).build(manager)?;

        Ok(SqliteStorage { pool })
    }

    fn create_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            r#"
            -- op log, keyed by (object, event stamp)
            CREATE TABLE IF NOT EXISTS ops (
                object TEXT NOT NULL,
                event TEXT NOT NULL,
                op TEXT NOT NULL,
                PRIMARY KEY (object, event)
            );

            -- one compacted state frame per object
            CREATE TABLE IF NOT EXISTS snapshots (
                object TEXT PRIMARY KEY,
                frame TEXT NOT NULL
            );

            -- per-object version vector
            CREATE TABLE IF NOT EXISTS versions (
                object TEXT NOT NULL,
                origin TEXT NOT NULL,
                value INTEGER NOT NULL,
                PRIMARY KEY (object, origin)
            );
            "#,
        )
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl Storage for SqliteStorage {
    fn load_vv(&self, object: &Uuid) -> Result<VersionVector, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT origin, value FROM versions WHERE object = ?")?;
        let rows = stmt.query_map([object.to_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut vv = VersionVector::new();
        for row in rows {
            let (origin, value) = row?;
            let origin = origin
                .parse()
                .map_err(crate::frame::MalformedFrame::Token)?;
            vv.add(origin, value as u64);
        }
        Ok(vv)
    }

    fn save_vv(&self, object: &Uuid, vv: &VersionVector) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        for (origin, value) in vv.iter() {
            conn.execute(
                "INSERT OR REPLACE INTO versions (object, origin, value) VALUES (?, ?, ?)",
                params![object.to_string(), origin.to_string(), value as i64],
            )?;
        }
        Ok(())
    }

    fn append(&self, object: &Uuid, ops: &[Op]) -> Result<(), StorageError> {
        let conn = self.pool.get()?;
        for op in ops {
            conn.execute(
                "INSERT OR IGNORE INTO ops (object, event, op) VALUES (?, ?, ?)",
                params![
                    object.to_string(),
                    op.event.to_string(),
                    Frame::op_text(op)
                ],
            )?;
        }
        Ok(())
    }

    fn tail(&self, object: &Uuid) -> Result<Vec<Op>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT op FROM ops WHERE object = ? ORDER BY event")?;
        let rows = stmt.query_map([object.to_string()], |row| row.get::<_, String>(0))?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(Frame::parse_op_text(&row?)?);
        }
        Ok(ops)
    }

    fn load_snapshot(&self, object: &Uuid) -> Result<Option<Frame>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT frame FROM snapshots WHERE object = ?")?;
        let result = stmt.query_row([object.to_string()], |row| row.get::<_, String>(0));

        match result {
            Ok(text) => Ok(Some(Frame::parse_text(&text)?)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn compact(&self, object: &Uuid, state: &Frame) -> Result<(), StorageError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (object, frame) VALUES (?, ?)",
            params![object.to_string(), state.to_text()],
        )?;
        tx.execute("DELETE FROM ops WHERE object = ?", [object.to_string()])?;
        tx.commit()?;
        Ok(())
    }

    fn objects(&self) -> Result<Vec<Uuid>, StorageError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT object FROM versions
             UNION SELECT object FROM ops
             UNION SELECT object FROM snapshots",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut objects = Vec::new();
        for row in rows {
            objects.push(
                row?.parse()
                    .map_err(crate::frame::MalformedFrame::Token)?,
            );
        }
        Ok(objects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> SqliteStorage {
        let config = StorageConfig {
            db_path: PathBuf::new(),
            sqlite_cache_size: 1000,
            sqlite_busy_timeout: 5000,
        };
        SqliteStorage::open(dir.path().join("test.db"), &config).unwrap()
    }

    #[test]
    fn test_append_tail_roundtrip() {
        let temp = TempDir::new().unwrap();
        let storage = open(&temp);
        let object: Uuid = "doc".parse().unwrap();

        let b = Frame::parse_op_text("*lww#doc@2-X:k\t=2;").unwrap();
        let a = Frame::parse_op_text("*lww#doc@1-X:k\t=1;").unwrap();
        storage.append(&object, &[b.clone(), a.clone()]).unwrap();

        // ordered by event despite append order
        assert_eq!(storage.tail(&object).unwrap(), vec![a, b]);
    }

    #[test]
    fn test_vv_roundtrip() {
        let temp = TempDir::new().unwrap();
        let storage = open(&temp);
        let object: Uuid = "doc".parse().unwrap();

        let mut vv = VersionVector::new();
        vv.see(&"1CQAn5-X".parse().unwrap());
        vv.see(&"7-Y".parse().unwrap());
        storage.save_vv(&object, &vv).unwrap();

        assert_eq!(storage.load_vv(&object).unwrap(), vv);
        assert_eq!(storage.objects().unwrap(), vec![object]);
    }

    #[test]
    fn test_compact_replaces_tail() {
        let temp = TempDir::new().unwrap();
        let storage = open(&temp);
        let object: Uuid = "doc".parse().unwrap();

        let op = Frame::parse_op_text("*lww#doc@1-X:k\t=1;").unwrap();
        storage.append(&object, &[op]).unwrap();

        let state = Frame::parse_text("*lww#doc@1-X!\n:k\t=1,\n\n").unwrap();
        storage.compact(&object, &state).unwrap();

        assert!(storage.tail(&object).unwrap().is_empty());
        assert_eq!(storage.load_snapshot(&object).unwrap(), Some(state));

        // reopen and read back
        drop(storage);
        let storage = open(&temp);
        assert!(storage.load_snapshot(&object).unwrap().is_some());
    }
}
