//! Local SQLite database that replicated SQL actions are applied to.
//!
//! Uses `rusqlite` with the `bundled` feature. The connection lives behind a
//! `Mutex`; commands are applied one at a time in log order, so contention is
//! limited to the apply path.
//!
//! The database is derived state: it is recreated empty at startup and
//! rebuilt by replaying the replicated log.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::types::ValueRef;
use rusqlite::{Batch, Connection};

/// A node-local SQLite database.
pub struct SqlDatabase {
    conn: Mutex<Connection>,
}

impl SqlDatabase {
    /// Discard any database at `path` and open an empty one in its place.
    pub fn open_fresh(path: &Path) -> anyhow::Result<Self> {
        for suffix in ["", "-wal", "-shm", "-journal"] {
            let mut file = path.as_os_str().to_owned();
            file.push(suffix);
            match std::fs::remove_file(&file) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        let db = Self {
            conn: Mutex::new(Connection::open(path)?),
        };
        db.apply_pragmas()?;
        Ok(db)
    }

    /// In-memory database, for tests.
    pub fn in_memory() -> anyhow::Result<Self> {
        let db = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        db.apply_pragmas()?;
        Ok(db)
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(())
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("database mutex poisoned"))
    }

    /// Run every statement in `sql` and render result rows as text.
    ///
    /// Rows are printed one per line with columns separated by `|`, the way
    /// the `sqlite3` shell prints them. Statements before a failing one stay
    /// applied.
    pub fn execute(&self, sql: &str) -> anyhow::Result<String> {
        let conn = self.lock()?;
        let mut batch = Batch::new(&conn, sql);
        let mut output = String::new();

        while let Some(mut stmt) = batch.next()? {
            let columns = stmt.column_count();
            if columns == 0 {
                stmt.execute([])?;
                continue;
            }
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                for i in 0..columns {
                    if i > 0 {
                        output.push('|');
                    }
                    render_value(row.get_ref(i)?, &mut output);
                }
                output.push('\n');
            }
        }
        Ok(output)
    }
}

fn render_value(value: ValueRef<'_>, out: &mut String) {
    match value {
        ValueRef::Null => {}
        ValueRef::Integer(i) => out.push_str(&i.to_string()),
        ValueRef::Real(f) => out.push_str(&f.to_string()),
        ValueRef::Text(t) => out.push_str(&String::from_utf8_lossy(t)),
        ValueRef::Blob(b) => out.push_str(&String::from_utf8_lossy(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_renders_rows() {
        let db = SqlDatabase::in_memory().unwrap();
        let out = db
            .execute(
                "CREATE TABLE ctf3 (name TEXT, score INTEGER, ratio REAL);
                 INSERT INTO ctf3 VALUES ('siddarth', 10, 0.5), ('gdb', 3, NULL);
                 SELECT name, score, ratio FROM ctf3 ORDER BY score DESC;",
            )
            .unwrap();
        assert_eq!(out, "siddarth|10|0.5\ngdb|3|\n");
    }

    #[test]
    fn test_execute_without_rows_is_empty() {
        let db = SqlDatabase::in_memory().unwrap();
        assert_eq!(db.execute("CREATE TABLE t (x INTEGER)").unwrap(), "");
        assert_eq!(db.execute("INSERT INTO t VALUES (1)").unwrap(), "");
        assert_eq!(db.execute("SELECT x FROM t").unwrap(), "1\n");
    }

    #[test]
    fn test_execute_reports_errors() {
        let db = SqlDatabase::in_memory().unwrap();
        let err = db.execute("SELECT * FROM missing").unwrap_err();
        assert!(err.to_string().contains("no such table"));

        let err = db.execute("NOT EVEN SQL").unwrap_err();
        assert!(err.to_string().contains("syntax error"));
    }

    #[test]
    fn test_statements_before_failure_stay_applied() {
        let db = SqlDatabase::in_memory().unwrap();
        assert!(db
            .execute("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1); BOGUS;")
            .is_err());
        assert_eq!(db.execute("SELECT count(*) FROM t").unwrap(), "1\n");
    }

    #[test]
    fn test_open_fresh_discards_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sqlcluster.db");
        {
            let db = SqlDatabase::open_fresh(&path).unwrap();
            db.execute("CREATE TABLE t (x INTEGER); INSERT INTO t VALUES (1);")
                .unwrap();
        }
        let db = SqlDatabase::open_fresh(&path).unwrap();
        assert!(db.execute("SELECT x FROM t").is_err());
    }
}
