//! Checkpoint rows
//!
//! One row per session. Saving replaces the row inside a transaction, so a
//! crash mid-write leaves the previous checkpoint readable.

use rusqlite::{params, OptionalExtension};

use super::sessions::format_time;
use super::{Database, StoreResult};
use crate::model::Checkpoint;

impl Database {
    pub(super) fn write_checkpoint(&self, checkpoint: &Checkpoint) -> StoreResult<()> {
        let data = serde_json::to_string(checkpoint)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO checkpoints (session_id, phase, data, checkpoint_time)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(session_id) DO UPDATE SET
                phase = excluded.phase,
                data = excluded.data,
                checkpoint_time = excluded.checkpoint_time
            "#,
            params![
                checkpoint.session_id,
                checkpoint.phase.to_string(),
                data,
                format_time(&checkpoint.checkpoint_time),
            ],
        )?;
        tx.commit()?;

        tracing::debug!(
            session_id = %checkpoint.session_id,
            completed = checkpoint.completed_item_ids.len(),
            pending = checkpoint.pending_item_ids.len(),
            "Checkpoint written"
        );
        Ok(())
    }

    pub(super) fn read_checkpoint(&self, session_id: &str) -> StoreResult<Option<Checkpoint>> {
        let data: Option<String> = {
            let conn = self.conn.lock();
            conn.query_row(
                "SELECT data FROM checkpoints WHERE session_id = ?1",
                [session_id],
                |row| row.get(0),
            )
            .optional()?
        };

        match data {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}
