//! Durable per-device message cache.
//!
//! The store opens lazily on first use. If that first open fails the cache
//! switches itself off for the rest of the process and every call returns
//! [`CacheError::Disabled`]; callers log and fall through to the server.

pub mod migrations;
pub mod queries;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use tracing::{error, info, warn};

use crate::error::{CacheError, CacheResult};

enum CacheState {
    /// `None` opens an in-memory store.
    Unopened(Option<PathBuf>),
    Open(Connection),
    Disabled,
}

/// Single shared store per device. Safe to share between chat views; every
/// batch write is one transaction.
pub struct MessageCache {
    state: Mutex<CacheState>,
}

impl MessageCache {
    /// Cache backed by a file. Nothing touches disk until the first call.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            state: Mutex::new(CacheState::Unopened(Some(path.into()))),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            state: Mutex::new(CacheState::Unopened(None)),
        }
    }

    /// A cache that is off from the start.
    pub fn disabled() -> Self {
        Self {
            state: Mutex::new(CacheState::Disabled),
        }
    }

    /// Whether the store is usable, opening it if needed.
    pub fn is_enabled(&self) -> bool {
        self.with_conn(|_| Ok(())).is_ok()
    }

    /// Run `f` against the cache on the blocking pool. Async callers go
    /// through here so SQLite work never runs on a runtime worker.
    pub async fn blocking<F, T>(self: &Arc<Self>, f: F) -> CacheResult<T>
    where
        F: FnOnce(&MessageCache) -> CacheResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let cache = self.clone();
        tokio::task::spawn_blocking(move || f(&cache))
            .await
            .map_err(|e| {
                error!("Cache spawn_blocking join error: {}", e);
                CacheError::Worker(e.to_string())
            })?
    }

    pub(crate) fn with_conn<F, T>(&self, f: F) -> CacheResult<T>
    where
        F: FnOnce(&mut Connection) -> CacheResult<T>,
    {
        let mut state = self.state.lock().map_err(|_| CacheError::Disabled)?;

        if let CacheState::Unopened(path) = &*state {
            let opened = open_connection(path.as_ref());
            *state = match opened {
                Ok(conn) => CacheState::Open(conn),
                Err(e) => {
                    warn!("Local cache unavailable, continuing without it: {}", e);
                    CacheState::Disabled
                }
            };
        }

        match &mut *state {
            CacheState::Open(conn) => f(conn),
            _ => Err(CacheError::Disabled),
        }
    }
}

fn open_connection(path: Option<&PathBuf>) -> rusqlite::Result<Connection> {
    let conn = match path {
        Some(path) => {
            let conn = Connection::open(path)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            info!("Message cache opened at {}", path.display());
            conn
        }
        None => Connection::open_in_memory()?,
    };

    migrations::run(&conn)?;
    Ok(conn)
}
