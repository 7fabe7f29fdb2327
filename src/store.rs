use crate::app_dirs::AppDirs;
use crate::guard::{ProctorEventKind, ProctoringEvent};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Which deadline a session row describes. `Dwell` is the Gate minimum
/// wait, `Exam` the main timer; both use the same storage path so both
/// are reload-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum DeadlineKind {
    Dwell,
    Exam,
}

impl DeadlineKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Dwell" => Some(Self::Dwell),
            "Exam" => Some(Self::Exam),
            _ => None,
        }
    }
}

/// A persisted absolute end instant. Immutable for a (session, kind) pair
/// until the session reaches a terminal phase.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDeadline {
    pub session_id: String,
    pub kind: DeadlineKind,
    pub ends_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("storage failure: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Durable persistence keyed by session_id: deadlines plus the append-only
/// proctoring event log. `put_deadline_if_absent` and `clear_session` are
/// the only writes to the deadline rows and are atomic per session.
pub trait SessionStore {
    /// Insert unless a deadline for this (session, kind) already exists;
    /// returns the stored deadline, so an existing one wins unchanged.
    fn put_deadline_if_absent(
        &mut self,
        deadline: &SessionDeadline,
    ) -> Result<SessionDeadline, StoreError>;

    fn get_deadline(
        &self,
        session_id: &str,
        kind: DeadlineKind,
    ) -> Result<Option<SessionDeadline>, StoreError>;

    /// Remove the session's deadlines and event log. Terminal phases only.
    fn clear_session(&mut self, session_id: &str) -> Result<(), StoreError>;

    fn append_event(&mut self, session_id: &str, event: &ProctoringEvent)
        -> Result<(), StoreError>;

    /// Events for the session in recording order.
    fn events(&self, session_id: &str) -> Result<Vec<ProctoringEvent>, StoreError>;

    /// Mark every recorded event for the session as acknowledged.
    fn acknowledge_events(&mut self, session_id: &str) -> Result<(), StoreError>;
}

/// SQLite-backed store. Any durable keyed store qualifies per the design;
/// this mirrors how the rest of the app already persists state.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open the store at the platform state directory.
    pub fn new() -> Result<Self, StoreError> {
        let db_path = AppDirs::db_path().unwrap_or_else(|| PathBuf::from("invigil_sessions.db"));
        Self::open(db_path)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("failed to create directory: {e}")))?;
        }

        let conn = Connection::open(path)?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS session_deadlines (
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                ends_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (session_id, kind)
            )
            "#,
            [],
        )?;

        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS proctoring_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                occurred_at TEXT NOT NULL,
                acknowledged BOOLEAN NOT NULL DEFAULT 0
            )
            "#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_proctoring_events_session
             ON proctoring_events(session_id)",
            [],
        )?;

        Ok(SqliteStore { conn })
    }

    fn parse_row(
        session_id: String,
        kind: String,
        ends_at: String,
        created_at: String,
    ) -> Result<SessionDeadline, StoreError> {
        let kind = DeadlineKind::parse(&kind)
            .ok_or_else(|| StoreError::Backend(format!("unknown deadline kind: {kind}")))?;
        let ends_at = parse_instant(&ends_at)?;
        let created_at = parse_instant(&created_at)?;
        Ok(SessionDeadline {
            session_id,
            kind,
            ends_at,
            created_at,
        })
    }
}

fn parse_instant(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Backend(format!("bad timestamp {s:?}: {e}")))
}

impl SessionStore for SqliteStore {
    fn put_deadline_if_absent(
        &mut self,
        deadline: &SessionDeadline,
    ) -> Result<SessionDeadline, StoreError> {
        // INSERT OR IGNORE keeps the first writer's row, which is exactly
        // the idempotence the timer needs across reloads and extra tabs.
        self.conn.execute(
            r#"
            INSERT OR IGNORE INTO session_deadlines (session_id, kind, ends_at, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                deadline.session_id,
                deadline.kind.to_string(),
                deadline.ends_at.to_rfc3339(),
                deadline.created_at.to_rfc3339(),
            ],
        )?;

        self.get_deadline(&deadline.session_id, deadline.kind)?
            .ok_or_else(|| StoreError::Backend("deadline vanished after insert".into()))
    }

    fn get_deadline(
        &self,
        session_id: &str,
        kind: DeadlineKind,
    ) -> Result<Option<SessionDeadline>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT session_id, kind, ends_at, created_at
            FROM session_deadlines
            WHERE session_id = ?1 AND kind = ?2
            "#,
        )?;

        let mut rows = stmt.query(params![session_id, kind.to_string()])?;
        match rows.next()? {
            Some(row) => {
                let deadline = Self::parse_row(row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)?;
                Ok(Some(deadline))
            }
            None => Ok(None),
        }
    }

    fn clear_session(&mut self, session_id: &str) -> Result<(), StoreError> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "DELETE FROM session_deadlines WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.execute(
            "DELETE FROM proctoring_events WHERE session_id = ?1",
            params![session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn append_event(
        &mut self,
        session_id: &str,
        event: &ProctoringEvent,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            r#"
            INSERT INTO proctoring_events (session_id, kind, occurred_at, acknowledged)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![
                session_id,
                event.kind.to_string(),
                event.occurred_at.to_rfc3339(),
                event.acknowledged,
            ],
        )?;
        Ok(())
    }

    fn events(&self, session_id: &str) -> Result<Vec<ProctoringEvent>, StoreError> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT kind, occurred_at, acknowledged
            FROM proctoring_events
            WHERE session_id = ?1
            ORDER BY id ASC
            "#,
        )?;

        let rows = stmt.query_map([session_id], |row| {
            let kind: String = row.get(0)?;
            let occurred_at: String = row.get(1)?;
            let acknowledged: bool = row.get(2)?;
            Ok((kind, occurred_at, acknowledged))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (kind, occurred_at, acknowledged) = row?;
            let kind = ProctorEventKind::parse(&kind)
                .ok_or_else(|| StoreError::Backend(format!("unknown event kind: {kind}")))?;
            events.push(ProctoringEvent {
                kind,
                occurred_at: parse_instant(&occurred_at)?,
                acknowledged,
            });
        }
        Ok(events)
    }

    fn acknowledge_events(&mut self, session_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE proctoring_events SET acknowledged = 1 WHERE session_id = ?1",
            params![session_id],
        )?;
        Ok(())
    }
}

/// In-memory store for tests. Clones share state, so a test can rebuild a
/// controller over the "same" store to simulate a reload.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    deadlines: HashMap<(String, DeadlineKind), SessionDeadline>,
    events: HashMap<String, Vec<ProctoringEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemoryStore {
    fn put_deadline_if_absent(
        &mut self,
        deadline: &SessionDeadline,
    ) -> Result<SessionDeadline, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let key = (deadline.session_id.clone(), deadline.kind);
        Ok(inner.deadlines.entry(key).or_insert_with(|| deadline.clone()).clone())
    }

    fn get_deadline(
        &self,
        session_id: &str,
        kind: DeadlineKind,
    ) -> Result<Option<SessionDeadline>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.deadlines.get(&(session_id.to_string(), kind)).cloned())
    }

    fn clear_session(&mut self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.deadlines.retain(|(id, _), _| id != session_id);
        inner.events.remove(session_id);
        Ok(())
    }

    fn append_event(
        &mut self,
        session_id: &str,
        event: &ProctoringEvent,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .events
            .entry(session_id.to_string())
            .or_default()
            .push(event.clone());
        Ok(())
    }

    fn events(&self, session_id: &str) -> Result<Vec<ProctoringEvent>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.events.get(session_id).cloned().unwrap_or_default())
    }

    fn acknowledge_events(&mut self, session_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(events) = inner.events.get_mut(session_id) {
            for event in events {
                event.acknowledged = true;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn deadline(session_id: &str, kind: DeadlineKind, end_min: u32) -> SessionDeadline {
        let created_at = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        SessionDeadline {
            session_id: session_id.to_string(),
            kind,
            ends_at: Utc.with_ymd_and_hms(2026, 3, 2, 10, end_min, 0).unwrap(),
            created_at,
        }
    }

    fn event(kind: ProctorEventKind) -> ProctoringEvent {
        ProctoringEvent::new(kind, Utc.with_ymd_and_hms(2026, 3, 2, 10, 5, 0).unwrap())
    }

    #[test]
    fn memory_put_if_absent_keeps_first_writer() {
        let mut store = MemoryStore::new();
        let first = deadline("s1", DeadlineKind::Exam, 30);
        let second = deadline("s1", DeadlineKind::Exam, 59);

        assert_eq!(store.put_deadline_if_absent(&first).unwrap(), first);
        assert_eq!(store.put_deadline_if_absent(&second).unwrap(), first);
    }

    #[test]
    fn memory_clones_share_state() {
        let mut store = MemoryStore::new();
        store
            .put_deadline_if_absent(&deadline("s1", DeadlineKind::Dwell, 1))
            .unwrap();

        let view = store.clone();
        assert!(view.get_deadline("s1", DeadlineKind::Dwell).unwrap().is_some());
    }

    #[test]
    fn memory_clear_removes_deadlines_and_events() {
        let mut store = MemoryStore::new();
        store
            .put_deadline_if_absent(&deadline("s1", DeadlineKind::Exam, 30))
            .unwrap();
        store
            .append_event("s1", &event(ProctorEventKind::WindowBlur))
            .unwrap();

        store.clear_session("s1").unwrap();
        assert!(store.get_deadline("s1", DeadlineKind::Exam).unwrap().is_none());
        assert!(store.events("s1").unwrap().is_empty());
    }

    #[test]
    fn memory_events_append_in_order_and_acknowledge() {
        let mut store = MemoryStore::new();
        store
            .append_event("s1", &event(ProctorEventKind::FullscreenExit))
            .unwrap();
        store
            .append_event("s1", &event(ProctorEventKind::TabHidden))
            .unwrap();

        let events = store.events("s1").unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ProctorEventKind::FullscreenExit);
        assert_eq!(events[1].kind, ProctorEventKind::TabHidden);
        assert!(events.iter().all(|e| !e.acknowledged));

        store.acknowledge_events("s1").unwrap();
        assert!(store.events("s1").unwrap().iter().all(|e| e.acknowledged));
    }

    #[test]
    fn sqlite_round_trips_deadlines_and_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");

        let mut store = SqliteStore::open(&path).unwrap();
        let put = deadline("s1", DeadlineKind::Exam, 30);
        assert_eq!(store.put_deadline_if_absent(&put).unwrap(), put);
        store
            .append_event("s1", &event(ProctorEventKind::WindowBlur))
            .unwrap();
        drop(store);

        // Reopen: everything must have survived.
        let mut store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_deadline("s1", DeadlineKind::Exam).unwrap(), Some(put.clone()));
        let events = store.events("s1").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ProctorEventKind::WindowBlur);

        // Second writer loses.
        let late = deadline("s1", DeadlineKind::Exam, 59);
        assert_eq!(store.put_deadline_if_absent(&late).unwrap(), put);

        store.clear_session("s1").unwrap();
        assert!(store.get_deadline("s1", DeadlineKind::Exam).unwrap().is_none());
        assert!(store.events("s1").unwrap().is_empty());
    }
}
