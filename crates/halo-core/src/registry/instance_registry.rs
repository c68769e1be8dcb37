//! SQLite-backed registry of running instances.

use crate::config::RegistryConfig;
use crate::identity::InstanceIdentity;
use crate::platform::{is_process_alive, process_start_time};
use crate::{HaloError, Result};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

/// A claimed instance name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceEntry {
    pub bus_id: String,
    pub name: String,
    pub pid: u32,
    pub port: u16,
    pub started_at: String,
    pub version: Option<String>,
    /// Kernel start time of `pid` when the claim was made, where known.
    pub start_time: Option<u64>,
}

impl InstanceEntry {
    /// Loopback address of the instance's control service.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.port))
    }

    pub fn is_alive(&self) -> bool {
        owner_alive(self.pid, self.start_time)
    }
}

/// Whether the process that claimed a row is still running.
///
/// A PID that now belongs to a process started at a different time has
/// been recycled, and the row is stale.
fn owner_alive(pid: u32, start_time: Option<u64>) -> bool {
    if !is_process_alive(pid) {
        return false;
    }
    match (start_time, process_start_time(pid)) {
        (Some(recorded), Some(current)) => recorded == current,
        _ => true,
    }
}

/// SQLite-backed registry for instance names.
///
/// Uses WAL mode for concurrent access across processes and
/// `Arc<Mutex<Connection>>` for sharing within a process.
#[derive(Clone)]
pub struct InstanceRegistry {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("path", &self.path)
            .finish()
    }
}

impl InstanceRegistry {
    /// Open the registry at the default session location.
    pub fn open() -> Result<Self> {
        let db_path = crate::platform::registry_db_path()?;
        Self::open_at(&db_path)
    }

    /// Open the registry at a specific path.
    ///
    /// Creates the database and parent directories if they don't exist.
    pub fn open_at(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HaloError::io_with_path(e, parent))?;
            }
        }

        let conn = Connection::open(db_path)?;
        Self::configure_connection(&conn)?;
        Self::ensure_schema(&conn)?;

        debug!("Opened instance registry at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: db_path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn configure_connection(conn: &Connection) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA temp_store=MEMORY;",
            RegistryConfig::BUSY_TIMEOUT_MS,
        ))?;
        Ok(())
    }

    fn ensure_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS instances (
                bus_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                pid INTEGER NOT NULL,
                port INTEGER NOT NULL,
                started_at TEXT NOT NULL,
                version TEXT,
                start_time INTEGER
            );",
        )?;

        // Registries created before start times were recorded lack the column.
        let has_start_time: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('instances') WHERE name = 'start_time'",
            [],
            |row| row.get(0),
        )?;
        if !has_start_time {
            conn.execute_batch("ALTER TABLE instances ADD COLUMN start_time INTEGER;")?;
        }
        Ok(())
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| HaloError::Database {
            message: "Failed to acquire registry connection lock".to_string(),
            source: None,
        })
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceEntry> {
        Ok(InstanceEntry {
            bus_id: row.get(0)?,
            name: row.get(1)?,
            pid: row.get(2)?,
            port: row.get(3)?,
            started_at: row.get(4)?,
            version: row.get(5)?,
            start_time: row.get(6)?,
        })
    }

    /// Claim `identity` for the process `pid` serving on `port`.
    ///
    /// First live claimant wins. A row left behind by a dead process is
    /// overwritten. The read and the write share one `IMMEDIATE`
    /// transaction, so two processes racing for a name serialize on the
    /// database write lock.
    pub fn claim(&self, identity: &InstanceIdentity, pid: u32, port: u16) -> Result<InstanceEntry> {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(u32, Option<u64>)> = tx
            .query_row(
                "SELECT pid, start_time FROM instances WHERE bus_id = ?1",
                params![identity.bus_id()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((owner, owner_start)) = existing {
            if owner_alive(owner, owner_start) {
                return Err(HaloError::RegistrationConflict {
                    name: identity.name().to_string(),
                    pid: owner,
                });
            }
            debug!(
                "Replacing stale registration for {} (PID {} is gone)",
                identity.bus_id(),
                owner
            );
        }

        let entry = InstanceEntry {
            bus_id: identity.bus_id().to_string(),
            name: identity.name().to_string(),
            pid,
            port,
            started_at: Utc::now().to_rfc3339(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            start_time: process_start_time(pid),
        };

        tx.execute(
            "INSERT OR REPLACE INTO instances
                (bus_id, name, pid, port, started_at, version, start_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.bus_id,
                entry.name,
                entry.pid,
                entry.port,
                entry.started_at,
                entry.version,
                entry.start_time
            ],
        )?;
        tx.commit()?;

        info!(
            "Claimed {} for PID {} on port {}",
            entry.bus_id, entry.pid, entry.port
        );

        Ok(entry)
    }

    /// Drop the claim on `identity`, but only if `pid` still owns it.
    pub fn release(&self, identity: &InstanceIdentity, pid: u32) -> Result<bool> {
        let conn = self.lock_conn()?;
        let rows = conn.execute(
            "DELETE FROM instances WHERE bus_id = ?1 AND pid = ?2",
            params![identity.bus_id(), pid],
        )?;

        if rows > 0 {
            debug!("Released {}", identity.bus_id());
        }

        Ok(rows > 0)
    }

    /// Live registration for `identity`, if any.
    pub fn lookup(&self, identity: &InstanceIdentity) -> Result<Option<InstanceEntry>> {
        let conn = self.lock_conn()?;
        let entry = conn
            .query_row(
                "SELECT bus_id, name, pid, port, started_at, version, start_time
                 FROM instances WHERE bus_id = ?1",
                params![identity.bus_id()],
                Self::row_to_entry,
            )
            .optional()?;

        Ok(entry.filter(InstanceEntry::is_alive))
    }

    /// All live registrations whose bus id sits under `namespace`.
    pub fn list_live(&self, namespace: &str) -> Result<Vec<InstanceEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT bus_id, name, pid, port, started_at, version, start_time
             FROM instances ORDER BY bus_id",
        )?;

        let rows = stmt.query_map([], Self::row_to_entry)?;

        let mut entries = Vec::new();
        for row in rows {
            let entry = row?;
            if InstanceIdentity::from_bus_id(namespace, &entry.bus_id).is_some()
                && entry.is_alive()
            {
                entries.push(entry);
            }
        }

        Ok(entries)
    }

    /// Remove rows whose process is gone or whose PID was recycled.
    pub fn cleanup_stale(&self) -> Result<usize> {
        let conn = self.lock_conn()?;

        let mut stmt = conn.prepare("SELECT bus_id, pid, start_time FROM instances")?;
        let entries: Vec<(String, u32, Option<u64>)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .filter_map(|r| r.ok())
            .collect();
        drop(stmt);

        let mut removed = 0;
        for (bus_id, pid, start_time) in &entries {
            if !owner_alive(*pid, *start_time) {
                removed += conn.execute(
                    "DELETE FROM instances WHERE bus_id = ?1 AND pid = ?2",
                    params![bus_id, pid],
                )?;
                debug!("Cleaned up stale instance {} (PID {} dead)", bus_id, pid);
            }
        }

        Ok(removed)
    }
}
