//! The semantic store (spec §4.3, component C3): persistent structured
//! state backed by `rusqlite` (bundled SQLite), the persistence engine
//! this crate's domain consistently reaches for (see `DESIGN.md`).
//!
//! Single-writer access (§5 "Shared resource policy") is enforced two
//! ways: `rusqlite::Connection` itself serializes statement execution
//! behind a `Mutex`, and an advisory file lock (`fs4`) on the database
//! path serializes concurrent *processes*. All writes for one public
//! operation run inside one [`rusqlite::Transaction`], which is what
//! gives §4.3's "partial state is never visible across operation
//! boundaries" for free.

mod comments;
mod commands;
mod entities;
mod extramural;
mod firewall;
mod integrity;
mod rotation;
mod schema;

pub use integrity::IntegrityViolation;

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs4::fs_std::FileExt;
use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::{MeshError, MeshResult};

/// Environment variable overriding the store location (§4.3, §6).
pub const STORE_PATH_ENV: &str = "WG_FRIEND_DB";

/// Centralizes the store path and the §3 allocator range overrides,
/// rather than scattering `env::var` calls through the orchestrator
/// (§9 "Global process state": caller-constructed context, not a
/// process-level singleton).
#[derive(Clone, Debug)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl StoreConfig {
    /// Resolves `WG_FRIEND_DB`, falling back to a well-known path in the
    /// invoking user's home directory (§4.3).
    pub fn from_env() -> MeshResult<StoreConfig> {
        let path = match std::env::var_os(STORE_PATH_ENV) {
            Some(p) => PathBuf::from(p),
            None => {
                let home = std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                home.join(".wg-friend").join("store.sqlite3")
            }
        };
        Ok(StoreConfig { path })
    }
}

/// The single-writer semantic store.
pub struct Store {
    conn: Mutex<Connection>,
    /// Held for the lifetime of the store to serialize cross-process
    /// writers on the database path (§5). `None` for in-memory stores
    /// used in tests, which can't be shared across processes anyway.
    _lock: Option<File>,
}

impl Store {
    /// Opens (creating if absent) the store at `config.path`, taking the
    /// advisory file lock and applying the schema.
    pub fn open(config: &StoreConfig) -> MeshResult<Store> {
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let lock = acquire_lock(&config.path)?;
        let conn = Connection::open(&config.path)?;
        let store = Store {
            conn: Mutex::new(conn),
            _lock: Some(lock),
        };
        store.init()?;
        info!(path = %config.path.display(), "opened semantic store");
        Ok(store)
    }

    /// An in-process, in-memory store for tests (§4.3's "Store" round-trip
    /// law tests use this to avoid filesystem fixtures).
    pub fn open_memory() -> MeshResult<Store> {
        let conn = Connection::open_in_memory()?;
        let store = Store {
            conn: Mutex::new(conn),
            _lock: None,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> MeshResult<()> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(schema::SCHEMA_SQL)?;
        debug!("applied schema");
        // chmod 600 (§4.3, §6), skipped for in-memory stores (no file).
        #[cfg(unix)]
        if let Some(path) = conn.path() {
            if !path.is_empty() && path != ":memory:" {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(meta) = std::fs::metadata(path) {
                    let mut perms = meta.permissions();
                    perms.set_mode(0o600);
                    let _ = std::fs::set_permissions(path, perms);
                }
            }
        }
        Ok(())
    }

    /// Runs `f` inside one transaction, committing only if `f` succeeds
    /// (§4.3 atomicity guarantee).
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> MeshResult<T>,
    ) -> MeshResult<T> {
        let mut conn = self.conn.lock().expect("store mutex poisoned");
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

fn acquire_lock(db_path: &Path) -> MeshResult<File> {
    let lock_path = db_path.with_extension("lock");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)?;
    file.try_lock_exclusive().map_err(|e| {
        MeshError::StoreLocked(format!(
            "another process holds the store lock at {}: {e}",
            lock_path.display()
        ))
    })?;
    Ok(file)
}
