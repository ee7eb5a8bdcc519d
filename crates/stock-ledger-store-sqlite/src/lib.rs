use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, DatabaseName, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stock_ledger_core::{GatewayError, PersistenceGateway};
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS kv_blobs (
  key TEXT PRIMARY KEY CHECK (length(key) > 0),
  value_json TEXT NOT NULL CHECK (json_valid(value_json)),
  updated_at TEXT NOT NULL
);
";

/// `SQLite`-backed [`PersistenceGateway`]: one row per key, whole blob per write.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlobSummary {
    pub key: String,
    pub bytes: usize,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub blobs: Vec<BlobSummary>,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a SQLite-backed blob store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open the store and bring its schema up to date.
    ///
    /// # Errors
    /// Returns an error when opening or migrating fails.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.conn.lock();
        schema_status_on(&conn)
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&conn)?;
        if version == 0 {
            let tx = conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            tracing::info!(version = 1, "applied sqlite schema migration");
        } else if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Read the JSON blob stored under `key`.
    ///
    /// # Errors
    /// Returns an error when the lookup fails or the stored text is not valid JSON.
    pub fn get_blob(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.lock();
        let raw = conn
            .query_row("SELECT value_json FROM kv_blobs WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .with_context(|| format!("failed to read blob `{key}`"))?;

        match raw {
            Some(json) => {
                let value = serde_json::from_str(&json)
                    .with_context(|| format!("failed to deserialize stored blob `{key}`"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Replace the blob stored under `key` in a single transaction.
    ///
    /// # Errors
    /// Returns an error when serialization or the transactional write fails.
    pub fn put_blob(&self, key: &str, blob: &Value) -> Result<()> {
        let json = serde_json::to_string(blob)
            .with_context(|| format!("failed to serialize blob `{key}`"))?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().context("failed to start transaction")?;
        tx.execute(
            "INSERT INTO kv_blobs(key, value_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json,
                                            updated_at = excluded.updated_at",
            params![key, json, now_rfc3339()?],
        )
        .with_context(|| format!("failed to persist blob `{key}`"))?;
        tx.commit().context("failed to commit blob transaction")?;
        tracing::debug!(key, bytes = json.len(), "persisted blob");
        Ok(())
    }

    /// List stored keys with their size and last write time.
    ///
    /// # Errors
    /// Returns an error when the listing query fails.
    pub fn list_blobs(&self) -> Result<Vec<BlobSummary>> {
        let conn = self.conn.lock();
        list_blobs_on(&conn)
    }

    /// Run quick-check plus schema status and a blob inventory.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let conn = self.conn.lock();
        let quick_check_message: String = conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = schema_status_on(&conn)?;
        let blobs = if schema_status.current_version >= 1 {
            list_blobs_on(&conn)?
        } else {
            Vec::new()
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            blobs,
            schema_status,
        })
    }

    /// Write a consistent copy of the database to `out_file`.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .lock()
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }
}

impl PersistenceGateway for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<Value>, GatewayError> {
        self.get_blob(key).map_err(|err| GatewayError::new(key, format!("{err:#}")))
    }

    fn set(&self, key: &str, blob: &Value) -> Result<(), GatewayError> {
        self.put_blob(key, blob).map_err(|err| GatewayError::new(key, format!("{err:#}")))
    }
}

fn schema_status_on(conn: &Connection) -> Result<SchemaStatus> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;
    let recorded = current_schema_version(conn)?;
    let (current_version, inferred_from_legacy) =
        if recorded == 0 && table_exists(conn, "kv_blobs")? { (1, true) } else { (recorded, false) };
    let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
        ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
    } else {
        Vec::new()
    };

    Ok(SchemaStatus {
        current_version,
        target_version: LATEST_SCHEMA_VERSION,
        pending_versions,
        inferred_from_legacy,
    })
}

fn list_blobs_on(conn: &Connection) -> Result<Vec<BlobSummary>> {
    let mut stmt = conn
        .prepare("SELECT key, length(value_json), updated_at FROM kv_blobs ORDER BY key ASC")
        .context("failed to prepare blob listing")?;
    let rows = stmt.query_map([], |row| {
        Ok(BlobSummary {
            key: row.get(0)?,
            bytes: usize::try_from(row.get::<_, i64>(1)?).unwrap_or_default(),
            updated_at: row.get(2)?,
        })
    })?;

    let mut blobs = Vec::new();
    for row in rows {
        blobs.push(row?);
    }
    Ok(blobs)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
