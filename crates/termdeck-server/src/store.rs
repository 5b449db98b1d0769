use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{error, info};

use crate::error::ServerError;

/// Persisted metadata and last transcript snapshot of one terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRow {
    pub id: String,
    pub deck_id: String,
    pub title: String,
    pub command: Option<String>,
    pub buffer: String,
    /// Unix milliseconds.
    pub created_at: i64,
}

/// SQLite-backed terminal table.
///
/// rusqlite is synchronous; callers on the runtime keep individual calls
/// short and push bulk snapshots through `spawn_blocking`.
pub struct TerminalStore {
    conn: Mutex<Connection>,
}

impl TerminalStore {
    /// Open (or create) the store at `path`. A file that fails the integrity
    /// check is moved aside to `<name>.corrupt-<unix-ms>` and replaced by a
    /// fresh, empty store.
    pub fn open(path: &Path) -> Result<Self, ServerError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ServerError::StoreCorrupted {
                path: path.to_path_buf(),
                reason: format!("cannot create data directory: {e}"),
            })?;
        }

        let conn = match open_checked(path) {
            Ok(conn) => conn,
            Err(reason) => {
                let quarantined = quarantine(path).map_err(|e| ServerError::StoreCorrupted {
                    path: path.to_path_buf(),
                    reason: format!("{reason}; quarantine failed: {e}"),
                })?;
                error!(
                    path = %path.display(),
                    quarantined = %quarantined.display(),
                    "terminal store failed integrity check ({reason}); starting fresh"
                );
                open_checked(path).map_err(|reason| ServerError::StoreCorrupted {
                    path: path.to_path_buf(),
                    reason,
                })?
            }
        };

        let store = Self {
            conn: Mutex::new(conn),
        };
        let count = store.count()?;
        if count > 0 {
            info!(count, path = %path.display(), "loaded terminal store");
        }
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, ServerError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, row: &TerminalRow) -> Result<(), ServerError> {
        self.lock().execute(
            "INSERT OR REPLACE INTO terminals (id, deck_id, title, command, buffer, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                row.id,
                row.deck_id,
                row.title,
                row.command,
                row.buffer,
                row.created_at
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TerminalRow>, ServerError> {
        let row = self
            .lock()
            .query_row(
                "SELECT id, deck_id, title, command, buffer, created_at
                 FROM terminals WHERE id = ?1",
                [id],
                row_to_terminal,
            )
            .optional()?;
        Ok(row)
    }

    /// All rows, oldest first.
    pub fn load_all(&self) -> Result<Vec<TerminalRow>, ServerError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, deck_id, title, command, buffer, created_at
             FROM terminals ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map([], row_to_terminal)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete(&self, id: &str) -> Result<bool, ServerError> {
        let changed = self
            .lock()
            .execute("DELETE FROM terminals WHERE id = ?1", [id])?;
        Ok(changed > 0)
    }

    /// Write every `(id, buffer)` pair in one transaction. Ids without a row
    /// are skipped. Returns how many rows were updated.
    pub fn save_buffers(&self, buffers: &[(String, String)]) -> Result<usize, ServerError> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut updated = 0;
        {
            let mut stmt = tx.prepare("UPDATE terminals SET buffer = ?2 WHERE id = ?1")?;
            for (id, buffer) in buffers {
                updated += stmt.execute(params![id, buffer])?;
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    pub fn count(&self) -> Result<usize, ServerError> {
        let count: i64 = self
            .lock()
            .query_row("SELECT COUNT(*) FROM terminals", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

fn row_to_terminal(row: &rusqlite::Row<'_>) -> rusqlite::Result<TerminalRow> {
    Ok(TerminalRow {
        id: row.get(0)?,
        deck_id: row.get(1)?,
        title: row.get(2)?,
        command: row.get(3)?,
        buffer: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS terminals (
            id          TEXT PRIMARY KEY NOT NULL,
            deck_id     TEXT NOT NULL,
            title       TEXT NOT NULL,
            command     TEXT,
            buffer      TEXT NOT NULL DEFAULT '',
            created_at  INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_terminals_deck ON terminals(deck_id);",
    )
}

fn open_checked(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| e.to_string())?;
    let verdict: String = conn
        .query_row("PRAGMA quick_check", [], |row| row.get(0))
        .map_err(|e| e.to_string())?;
    if verdict != "ok" {
        return Err(format!("quick_check: {verdict}"));
    }
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| e.to_string())?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(|e| e.to_string())?;
    init_schema(&conn).map_err(|e| e.to_string())?;
    Ok(conn)
}

/// Move a damaged database (and its WAL sidecars) out of the way.
fn quarantine(path: &Path) -> std::io::Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let mut target = path.as_os_str().to_owned();
    target.push(format!(".corrupt-{stamp}"));
    let target = PathBuf::from(target);
    fs::rename(path, &target)?;
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = path.as_os_str().to_owned();
        sidecar.push(suffix);
        match fs::remove_file(PathBuf::from(sidecar)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(target)
}

pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
