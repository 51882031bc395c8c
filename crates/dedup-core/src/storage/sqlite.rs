use crate::error::{Error, Result};
use rusqlite::{params, Connection, OpenFlags, Transaction, TransactionBehavior};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Value of `PRAGMA user_version` for the current layout.
pub const SCHEMA_VERSION: i64 = 1;

const REQUIRED_TABLES: [&str; 4] = ["files", "duplicates", "directories", "metadata"];
const SQLITE_HEADER: &[u8; 16] = b"SQLite format 3\0";

/// The metadata store: one SQLite file per workspace.
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
}

impl Store {
    /// Create a new workspace file. Fails if anything already exists at `path`.
    pub fn create(path: &Path, workspace_name: &str) -> Result<Self> {
        if path.exists() {
            return Err(Error::WorkspaceExists(path.to_path_buf()));
        }
        let conn = Connection::open(path)?;
        let store = Store {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.configure_pragmas()?;
        store.init_schema(workspace_name)?;
        debug!("Created workspace store at {}", path.display());
        Ok(store)
    }

    /// Open an existing workspace file for reading and writing.
    ///
    /// The file is validated before use; a damaged or foreign file is reported as
    /// [`Error::CorruptWorkspace`] and left untouched.
    pub fn open(path: &Path) -> Result<Self> {
        check_header(path)?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| corrupt(path, e))?;
        let store = Store {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.validate(path)?;
        store.configure_pragmas()?;
        debug!("Opened workspace store at {}", path.display());
        Ok(store)
    }

    /// Separate read-only connection for concurrent readers. WAL mode gives it
    /// a consistent snapshot that never includes a partially written chunk.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        check_header(path)?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| corrupt(path, e))?;
        let store = Store {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.validate(path)?;
        store
            .conn
            .execute_batch("PRAGMA busy_timeout = 5000; PRAGMA query_only = ON;")?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Store { conn, path: None };
        store.configure_pragmas()?;
        store.init_schema("in-memory")?;
        Ok(store)
    }

    fn configure_pragmas(&self) -> Result<()> {
        self.conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA cache_size = -64000;
             PRAGMA busy_timeout = 5000;",
        )?;
        debug!("SQLite pragmas configured (WAL mode, 64MB cache)");
        Ok(())
    }

    fn init_schema(&self, workspace_name: &str) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(include_str!("schema.sql"))?;
        tx.execute(
            "INSERT OR IGNORE INTO metadata (id, workspace_name, created_at) VALUES (1, ?1, ?2)",
            params![workspace_name, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        tx.commit()?;
        debug!("SQLite schema initialized (version {})", SCHEMA_VERSION);
        Ok(())
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let check: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get(0))
            .map_err(|e| corrupt(path, e))?;
        if check != "ok" {
            return Err(Error::CorruptWorkspace {
                path: path.to_path_buf(),
                reason: format!("integrity check failed: {}", check),
            });
        }

        let version: i64 = self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .map_err(|e| corrupt(path, e))?;
        if version == 0 {
            return Err(Error::CorruptWorkspace {
                path: path.to_path_buf(),
                reason: "not a dedup workspace".to_string(),
            });
        }
        if version != SCHEMA_VERSION {
            return Err(Error::UnsupportedSchema {
                found: version,
                expected: SCHEMA_VERSION,
            });
        }

        for table in REQUIRED_TABLES {
            let exists: i64 = self
                .conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                    params![table],
                    |row| row.get(0),
                )
                .map_err(|e| corrupt(path, e))?;
            if exists == 0 {
                return Err(Error::CorruptWorkspace {
                    path: path.to_path_buf(),
                    reason: format!("missing table '{}'", table),
                });
            }
        }
        Ok(())
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Location of the workspace file; `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` inside a single write transaction.
    ///
    /// Everything `f` does through this store commits together when it returns
    /// `Ok`; an `Err` (or a panic) rolls the whole unit back.
    pub fn in_transaction<T>(&self, f: impl FnOnce(&Store) -> Result<T>) -> Result<T> {
        let tx = Transaction::new_unchecked(&self.conn, TransactionBehavior::Immediate)?;
        let value = f(self)?;
        tx.commit()?;
        Ok(value)
    }
}

fn check_header(path: &Path) -> Result<()> {
    if !path.exists() {
        return Err(Error::WorkspaceNotFound(path.to_path_buf()));
    }
    let mut header = [0u8; 16];
    let mut file = File::open(path)?;
    let read = file.read(&mut header)?;
    if read < header.len() || &header != SQLITE_HEADER {
        return Err(Error::CorruptWorkspace {
            path: path.to_path_buf(),
            reason: "missing SQLite header".to_string(),
        });
    }
    Ok(())
}

fn corrupt(path: &Path, err: rusqlite::Error) -> Error {
    Error::CorruptWorkspace {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}
