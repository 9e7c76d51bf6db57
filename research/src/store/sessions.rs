//! Session rows

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{parse_phase, parse_time, Database, StoreError, StoreResult};
use crate::model::{Phase, Session, SessionSummary};

pub(super) fn format_time(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const SESSION_COLUMNS: &str = r#"
    s.id, s.query, s.language, s.phase, s.error,
    s.created_at, s.updated_at, s.completed_at,
    st.plan, st.agent_progress, st.results, st.final_report, st.revision_feedback
"#;

const SUMMARY_COLUMNS: &str = r#"
    id, query, language, phase, error, created_at, updated_at, completed_at
"#;

/// Columns as stored, decoded after the statement finishes
struct RawSession {
    summary: RawSummary,
    plan: Option<String>,
    agent_progress: Option<String>,
    results: Option<String>,
    final_report: Option<String>,
    revision_feedback: Option<String>,
}

struct RawSummary {
    id: String,
    query: String,
    language: String,
    phase: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
    completed_at: Option<String>,
}

impl RawSummary {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            query: row.get(1)?,
            language: row.get(2)?,
            phase: row.get(3)?,
            error: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            completed_at: row.get(7)?,
        })
    }

    fn decode(self) -> StoreResult<SessionSummary> {
        Ok(SessionSummary {
            id: self.id,
            query: self.query,
            language: self.language,
            phase: parse_phase(&self.phase)?,
            error: self.error,
            created_at: parse_time(&self.created_at)?,
            updated_at: parse_time(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_time).transpose()?,
        })
    }
}

impl RawSession {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            summary: RawSummary::from_row(row)?,
            plan: row.get(8)?,
            agent_progress: row.get(9)?,
            results: row.get(10)?,
            final_report: row.get(11)?,
            revision_feedback: row.get(12)?,
        })
    }

    fn decode(self) -> StoreResult<Session> {
        let summary = self.summary.decode()?;
        let plan = match self.plan {
            Some(json) => serde_json::from_str(&json)?,
            None => None,
        };
        let agent_progress = match self.agent_progress {
            Some(json) => serde_json::from_str(&json)?,
            None => Default::default(),
        };
        let results = match self.results {
            Some(json) => serde_json::from_str(&json)?,
            None => Vec::new(),
        };

        Ok(Session {
            id: summary.id,
            query: summary.query,
            language: summary.language,
            phase: summary.phase,
            plan,
            agent_progress,
            results,
            final_report: self.final_report,
            revision_feedback: self.revision_feedback,
            error: summary.error,
            created_at: summary.created_at,
            updated_at: summary.updated_at,
            completed_at: summary.completed_at,
        })
    }
}

/// Serialized state columns of a session
struct StateColumns {
    plan: Option<String>,
    agent_progress: String,
    results: String,
}

impl StateColumns {
    fn encode(session: &Session) -> StoreResult<Self> {
        Ok(Self {
            plan: session.plan.as_ref().map(serde_json::to_string).transpose()?,
            agent_progress: serde_json::to_string(&session.agent_progress)?,
            results: serde_json::to_string(&session.results)?,
        })
    }
}

impl Database {
    pub(super) fn insert_session(&self, session: &Session) -> StoreResult<()> {
        let state = StateColumns::encode(session)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM sessions WHERE id = ?1)",
            [&session.id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(StoreError::AlreadyExists(session.id.clone()));
        }

        tx.execute(
            r#"
            INSERT INTO sessions (id, query, language, phase, error, created_at, updated_at, completed_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                session.id,
                session.query,
                session.language,
                session.phase.to_string(),
                session.error,
                format_time(&session.created_at),
                format_time(&session.updated_at),
                session.completed_at.as_ref().map(format_time),
            ],
        )?;
        tx.execute(
            r#"
            INSERT INTO session_state (session_id, plan, agent_progress, results, final_report, revision_feedback)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                session.id,
                state.plan,
                state.agent_progress,
                state.results,
                session.final_report,
                session.revision_feedback,
            ],
        )?;

        tx.commit()?;
        tracing::debug!(session_id = %session.id, "Created session");
        Ok(())
    }

    pub(super) fn replace_session(&self, session: &Session) -> StoreResult<()> {
        let state = StateColumns::encode(session)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let updated = tx.execute(
            r#"
            UPDATE sessions
            SET query = ?2, language = ?3, phase = ?4, error = ?5,
                created_at = ?6, updated_at = ?7, completed_at = ?8
            WHERE id = ?1
            "#,
            params![
                session.id,
                session.query,
                session.language,
                session.phase.to_string(),
                session.error,
                format_time(&session.created_at),
                format_time(&session.updated_at),
                session.completed_at.as_ref().map(format_time),
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::NotFound(session.id.clone()));
        }

        tx.execute(
            r#"
            INSERT INTO session_state (session_id, plan, agent_progress, results, final_report, revision_feedback)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(session_id) DO UPDATE SET
                plan = excluded.plan,
                agent_progress = excluded.agent_progress,
                results = excluded.results,
                final_report = excluded.final_report,
                revision_feedback = excluded.revision_feedback
            "#,
            params![
                session.id,
                state.plan,
                state.agent_progress,
                state.results,
                session.final_report,
                session.revision_feedback,
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    pub(super) fn fetch_session(&self, id: &str) -> StoreResult<Option<Session>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!(
                    "SELECT {} FROM sessions s LEFT JOIN session_state st ON st.session_id = s.id WHERE s.id = ?1",
                    SESSION_COLUMNS
                ),
                [id],
                RawSession::from_row,
            )
            .optional()?
        };
        raw.map(RawSession::decode).transpose()
    }

    pub(super) fn list_sessions(&self, limit: usize) -> StoreResult<Vec<Session>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sessions s LEFT JOIN session_state st ON st.session_id = s.id \
                 ORDER BY s.updated_at DESC LIMIT ?1",
                SESSION_COLUMNS
            ))?;
            let rows = stmt
                .query_map([limit as i64], RawSession::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(RawSession::decode).collect()
    }

    pub(super) fn session_summary(&self, id: &str) -> StoreResult<Option<SessionSummary>> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {} FROM sessions WHERE id = ?1", SUMMARY_COLUMNS),
                [id],
                RawSummary::from_row,
            )
            .optional()?
        };
        raw.map(RawSummary::decode).transpose()
    }

    pub(super) fn summaries(&self, limit: usize, phase: Option<Phase>) -> StoreResult<Vec<SessionSummary>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sessions WHERE (?1 IS NULL OR phase = ?1) \
                 ORDER BY updated_at DESC LIMIT ?2",
                SUMMARY_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![phase.map(|p| p.to_string()), limit as i64],
                    RawSummary::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };
        rows.into_iter().map(RawSummary::decode).collect()
    }

    pub(super) fn resolve_prefix(&self, prefix: &str) -> StoreResult<Option<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT id FROM sessions WHERE substr(id, 1, length(?1)) = ?1 LIMIT 10")?;
        let ids = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        match ids.len() {
            0 => Ok(None),
            1 => Ok(ids.into_iter().next()),
            count => Err(StoreError::AmbiguousPrefix {
                prefix: prefix.to_string(),
                count,
            }),
        }
    }

    pub(super) fn delete_session(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM checkpoints WHERE session_id = ?1", [id])?;
        tx.execute("DELETE FROM session_state WHERE session_id = ?1", [id])?;
        let deleted = tx.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
        tx.commit()?;
        Ok(deleted > 0)
    }
}
