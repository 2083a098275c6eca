//! Persistence collaborators for [`NpcMemory`].
//!
//! The store only needs load-before-first-use and save-after-mutation, so
//! the boundary is the small [`MemoryPersistence`] trait. Two backends ship:
//!
//! - [`SqlitePersistence`] keeps one row per NPC:
//!
//!   ```sql
//!   CREATE TABLE IF NOT EXISTS npc_memories (
//!       npc_id       TEXT PRIMARY KEY,
//!       data         BLOB NOT NULL,
//!       encoding     TEXT NOT NULL,
//!       memory_count INTEGER NOT NULL,
//!       updated_at   TEXT NOT NULL,
//!       checksum     TEXT
//!   );
//!   ```
//!
//!   The blob is JSON or bincode; the encoding is recorded per row so a
//!   config change never strands old saves. A CRC-32 of the blob detects
//!   corruption on load.
//! - [`InMemoryPersistence`] for tests and demos, with an injectable save
//!   failure.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, params};
use tracing::{debug, info, warn};

use crate::config::{BlobEncoding, PersistenceBackend, PersistenceConfig};
use crate::error::{Result, SimError};
use crate::memory::NpcMemory;
use crate::types::NpcId;

/// Load/save boundary between the store and durable storage.
pub trait MemoryPersistence: Send + Sync + fmt::Debug {
    /// Load `npc`'s memory, `None` if never saved.
    ///
    /// # Errors
    /// Backend or decoding failure.
    fn load_npc_memory(&self, npc: NpcId) -> Result<Option<NpcMemory>>;

    /// Save (upsert) `npc`'s memory.
    ///
    /// # Errors
    /// Backend or encoding failure. Nothing is considered durable on error.
    fn save_npc_memory(&self, npc: NpcId, memory: &NpcMemory) -> Result<()>;

    /// Remove `npc`'s memory. Returns whether anything was stored.
    ///
    /// # Errors
    /// Backend failure.
    fn delete_npc_memory(&self, npc: NpcId) -> Result<bool>;

    /// Every NPC with saved memory.
    ///
    /// # Errors
    /// Backend failure.
    fn list_npcs(&self) -> Result<Vec<NpcId>>;

    /// Periodic housekeeping (integrity check, backups).
    ///
    /// # Errors
    /// Backend failure.
    fn maintain(&self) -> Result<MaintenanceReport> {
        Ok(MaintenanceReport::default())
    }
}

/// What [`MemoryPersistence::maintain`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Integrity check result, `None` if the backend has none.
    pub integrity_ok: Option<bool>,
    /// Whether a rotating backup was written.
    pub backup_created: bool,
}

/// Open the backend named by `config`.
///
/// # Errors
/// Returns `SimError::Database` if the SQLite file cannot be opened.
pub fn open_persistence(config: &PersistenceConfig) -> Result<Arc<dyn MemoryPersistence>> {
    Ok(match config.backend {
        PersistenceBackend::Sqlite => Arc::new(SqlitePersistence::open(&config.path, config)?),
        PersistenceBackend::Memory => Arc::new(InMemoryPersistence::new()),
    })
}

// ---------------------------------------------------------------------------
// Encoding & checksum
// ---------------------------------------------------------------------------

fn crc32_hex(data: &[u8]) -> String {
    const POLY: u32 = 0xEDB8_8320;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        crc ^= u32::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 == 1 { (crc >> 1) ^ POLY } else { crc >> 1 };
        }
    }
    format!("{:08x}", !crc)
}

const fn encoding_name(encoding: BlobEncoding) -> &'static str {
    match encoding {
        BlobEncoding::Json => "json",
        BlobEncoding::Bincode => "bincode",
    }
}

fn encode(memory: &NpcMemory, encoding: BlobEncoding) -> Result<Vec<u8>> {
    match encoding {
        BlobEncoding::Json => serde_json::to_vec(memory).map_err(|e| SimError::Serialization(e.to_string())),
        BlobEncoding::Bincode => bincode::serialize(memory).map_err(|e| SimError::Serialization(e.to_string())),
    }
}

fn decode(data: &[u8], encoding: &str) -> Result<NpcMemory> {
    match encoding {
        "json" => serde_json::from_slice(data).map_err(|e| SimError::Serialization(e.to_string())),
        "bincode" => bincode::deserialize(data).map_err(|e| SimError::Serialization(e.to_string())),
        other => Err(SimError::Serialization(format!("unknown blob encoding '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// SqlitePersistence
// ---------------------------------------------------------------------------

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS npc_memories (
    npc_id       TEXT PRIMARY KEY,
    data         BLOB NOT NULL,
    encoding     TEXT NOT NULL,
    memory_count INTEGER NOT NULL,
    updated_at   TEXT NOT NULL,
    checksum     TEXT
);";

/// SQLite-backed [`MemoryPersistence`].
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
    config: PersistenceConfig,
    db_path: PathBuf,
}

impl fmt::Debug for SqlitePersistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlitePersistence")
            .field("db_path", &self.db_path)
            .field("encoding", &self.config.encoding)
            .finish_non_exhaustive()
    }
}

impl SqlitePersistence {
    /// Open (or create) the database at `path`.
    ///
    /// # Errors
    /// Returns `SimError::Database` on SQLite failures.
    pub fn open<P: AsRef<Path>>(path: P, config: &PersistenceConfig) -> Result<Self> {
        let db_path = path.as_ref().to_path_buf();
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(&db_path, flags)?;

        if config.wal_mode {
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        }
        conn.execute_batch("PRAGMA synchronous = NORMAL; PRAGMA busy_timeout = 5000;")?;
        conn.execute_batch(SCHEMA)?;

        info!(path = %db_path.display(), wal = config.wal_mode, "NPC memory database opened");
        Ok(Self {
            conn: Mutex::new(conn),
            config: config.clone(),
            db_path,
        })
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns `SimError::Database` on SQLite failures.
    pub fn open_in_memory(config: &PersistenceConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config: config.clone(),
            db_path: PathBuf::from(":memory:"),
        })
    }

    /// Database file path (`:memory:` for in-memory databases).
    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Number of saved NPCs.
    ///
    /// # Errors
    /// Returns `SimError::Database` on SQLite failures.
    pub fn npc_count(&self) -> Result<usize> {
        let count: i64 = self
            .conn
            .lock()
            .query_row("SELECT COUNT(*) FROM npc_memories", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Copy the database to `dest` with SQLite's online-backup API.
    ///
    /// # Errors
    /// Returns `SimError::Database` on SQLite failures.
    pub fn backup<P: AsRef<Path>>(&self, dest: P) -> Result<()> {
        let start = Instant::now();
        let mut target = Connection::open(dest.as_ref())?;
        let conn = self.conn.lock();
        let backup = rusqlite::backup::Backup::new(&conn, &mut target)?;
        backup.run_to_completion(256, std::time::Duration::from_millis(50), None)?;
        info!(
            dest = %dest.as_ref().display(),
            elapsed_ms = start.elapsed().as_millis(),
            "Database backup completed"
        );
        Ok(())
    }

    /// Write `<db>.bak.1`, shifting older backups up and keeping at most
    /// `backup_count`. Returns whether a backup was written.
    ///
    /// # Errors
    /// Returns `SimError::Database` or `SimError::Io` on failure.
    pub fn create_rotating_backup(&self) -> Result<bool> {
        let max = self.config.backup_count;
        if self.db_path.as_os_str() == ":memory:" || max == 0 {
            return Ok(false);
        }
        for i in (1..max).rev() {
            let src = self.backup_path(i);
            if src.exists() {
                std::fs::rename(&src, self.backup_path(i + 1))?;
            }
        }
        let overflow = self.backup_path(max + 1);
        if overflow.exists() {
            std::fs::remove_file(&overflow)?;
        }
        self.backup(self.backup_path(1))?;
        Ok(true)
    }

    fn backup_path(&self, n: u32) -> PathBuf {
        let mut name = self.db_path.as_os_str().to_owned();
        name.push(format!(".bak.{n}"));
        PathBuf::from(name)
    }

    /// Run `PRAGMA integrity_check`.
    ///
    /// # Errors
    /// Returns `SimError::Database` if the check itself fails.
    pub fn integrity_check(&self) -> Result<bool> {
        let result: String = self
            .conn
            .lock()
            .query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        Ok(result == "ok")
    }
}

impl MemoryPersistence for SqlitePersistence {
    fn load_npc_memory(&self, npc: NpcId) -> Result<Option<NpcMemory>> {
        let start = Instant::now();
        let row: Option<(Vec<u8>, String, Option<String>)> = {
            let conn = self.conn.lock();
            let mut stmt =
                conn.prepare_cached("SELECT data, encoding, checksum FROM npc_memories WHERE npc_id = ?1")?;
            stmt.query_row(params![npc.0.to_string()], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .optional()?
        };
        let Some((data, encoding, stored)) = row else {
            return Ok(None);
        };

        if let Some(expected) = stored.filter(|_| self.config.checksum_enabled) {
            let actual = crc32_hex(&data);
            if expected != actual {
                warn!(npc = %npc, expected = %expected, actual = %actual, "Checksum mismatch, refusing corrupt save");
                return Err(SimError::Serialization(format!(
                    "checksum mismatch for NPC {npc}: stored {expected}, computed {actual}"
                )));
            }
        }

        let memory = decode(&data, &encoding)?;
        debug!(
            npc = %npc,
            memories = memory.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Loaded NPC memory"
        );
        Ok(Some(memory))
    }

    fn save_npc_memory(&self, npc: NpcId, memory: &NpcMemory) -> Result<()> {
        let start = Instant::now();
        let data = encode(memory, self.config.encoding)?;
        let checksum = self.config.checksum_enabled.then(|| crc32_hex(&data));
        let count = i64::try_from(memory.len()).unwrap_or(i64::MAX);

        self.conn.lock().execute(
            "INSERT INTO npc_memories (npc_id, data, encoding, memory_count, updated_at, checksum)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(npc_id) DO UPDATE SET
                data = excluded.data,
                encoding = excluded.encoding,
                memory_count = excluded.memory_count,
                updated_at = excluded.updated_at,
                checksum = excluded.checksum",
            params![
                npc.0.to_string(),
                data,
                encoding_name(self.config.encoding),
                count,
                Utc::now().to_rfc3339(),
                checksum
            ],
        )?;

        debug!(
            npc = %npc,
            memories = memory.len(),
            bytes = data.len(),
            elapsed_us = start.elapsed().as_micros(),
            "Saved NPC memory"
        );
        Ok(())
    }

    fn delete_npc_memory(&self, npc: NpcId) -> Result<bool> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM npc_memories WHERE npc_id = ?1", params![npc.0.to_string()])?;
        Ok(deleted > 0)
    }

    fn list_npcs(&self) -> Result<Vec<NpcId>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached("SELECT npc_id FROM npc_memories ORDER BY npc_id")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut npcs = Vec::new();
        for row in rows {
            let id = row?;
            match uuid::Uuid::parse_str(&id) {
                Ok(uuid) => npcs.push(NpcId(uuid)),
                Err(_) => warn!(id = %id, "Skipping row with invalid NPC id"),
            }
        }
        Ok(npcs)
    }

    fn maintain(&self) -> Result<MaintenanceReport> {
        let integrity_ok = self.integrity_check()?;
        if !integrity_ok {
            warn!(path = %self.db_path.display(), "Integrity check failed, skipping backup");
            return Ok(MaintenanceReport {
                integrity_ok: Some(false),
                backup_created: false,
            });
        }
        let backup_created = self.create_rotating_backup()?;
        Ok(MaintenanceReport {
            integrity_ok: Some(true),
            backup_created,
        })
    }
}

/// Turns `QueryReturnedNoRows` into `Ok(None)`.
trait OptionalExt<T> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> std::result::Result<Option<T>, rusqlite::Error> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryPersistence
// ---------------------------------------------------------------------------

/// Process-local [`MemoryPersistence`].
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    rows: Mutex<HashMap<NpcId, NpcMemory>>,
    fail_saves: AtomicBool,
    saves: AtomicU64,
}

impl InMemoryPersistence {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save fail with an I/O error (or stop doing so).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::Release);
    }

    /// Successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::Acquire)
    }

    /// Copy of what is stored for `npc`.
    #[must_use]
    pub fn stored(&self, npc: NpcId) -> Option<NpcMemory> {
        self.rows.lock().get(&npc).cloned()
    }
}

impl MemoryPersistence for InMemoryPersistence {
    fn load_npc_memory(&self, npc: NpcId) -> Result<Option<NpcMemory>> {
        Ok(self.stored(npc))
    }

    fn save_npc_memory(&self, npc: NpcId, memory: &NpcMemory) -> Result<()> {
        if self.fail_saves.load(Ordering::Acquire) {
            return Err(SimError::Io(std::io::Error::other("injected save failure")));
        }
        self.rows.lock().insert(npc, memory.clone());
        self.saves.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn delete_npc_memory(&self, npc: NpcId) -> Result<bool> {
        Ok(self.rows.lock().remove(&npc).is_some())
    }

    fn list_npcs(&self) -> Result<Vec<NpcId>> {
        let mut npcs: Vec<NpcId> = self.rows.lock().keys().copied().collect();
        npcs.sort_unstable();
        Ok(npcs)
    }
}
