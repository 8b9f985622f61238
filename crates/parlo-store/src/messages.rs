use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{MessageStatus, VoiceMessage};

const SELECT_COLUMNS: &str = "id, sender_id, recipient_id, file_path, file_size, \
     duration_seconds, audio_format, total_chunks, chunks_received, \
     status, created_at, transmitted_at, delivered_at, listened_at";

impl Database {
    pub fn create_message(&self, msg: &VoiceMessage) -> Result<()> {
        self.conn().execute(
            "INSERT INTO voice_messages (
                id, sender_id, recipient_id, file_path, file_size,
                duration_seconds, audio_format, total_chunks, chunks_received,
                status, created_at, transmitted_at, delivered_at, listened_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                msg.id.to_string(),
                msg.sender_id.to_string(),
                msg.recipient_id.to_string(),
                msg.file_path,
                msg.file_size,
                msg.duration_secs,
                msg.audio_format,
                msg.total_chunks,
                msg.chunks_received,
                msg.status.as_str(),
                msg.created_at.to_rfc3339(),
                msg.transmitted_at.map(|t| t.to_rfc3339()),
                msg.delivered_at.map(|t| t.to_rfc3339()),
                msg.listened_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    pub fn get_message(&self, id: Uuid) -> Result<VoiceMessage> {
        self.conn()
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM voice_messages WHERE id = ?1"),
                params![id.to_string()],
                read_row,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })?
            .into_message()
    }

    /// Messages addressed to `recipient_id`, newest first.
    pub fn list_by_recipient(
        &self,
        recipient_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<VoiceMessage>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM voice_messages
             WHERE recipient_id = ?1
             ORDER BY created_at DESC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(params![recipient_id.to_string(), limit, offset], read_row)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_message()?);
        }
        Ok(messages)
    }

    /// Update the mutable fields of a message record.
    ///
    /// Enforces the forward-only status lattice; a downgrade attempt fails
    /// with [`StoreError::InvalidTransition`] and leaves the row untouched.
    pub fn update_message(
        &self,
        id: Uuid,
        chunks_received: u32,
        status: MessageStatus,
        transmitted_at: Option<DateTime<Utc>>,
        delivered_at: Option<DateTime<Utc>>,
        listened_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let current = self.get_message(id)?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }

        let affected = self.conn().execute(
            "UPDATE voice_messages
             SET chunks_received = ?2,
                 status = ?3,
                 transmitted_at = COALESCE(?4, transmitted_at),
                 delivered_at = COALESCE(?5, delivered_at),
                 listened_at = COALESCE(?6, listened_at)
             WHERE id = ?1",
            params![
                id.to_string(),
                chunks_received,
                status.as_str(),
                transmitted_at.map(|t| t.to_rfc3339()),
                delivered_at.map(|t| t.to_rfc3339()),
                listened_at.map(|t| t.to_rfc3339()),
            ],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// Update just the status, keeping everything else in place.
    pub fn update_status(&self, id: Uuid, status: MessageStatus) -> Result<()> {
        let current = self.get_message(id)?;
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }

        let affected = self.conn().execute(
            "UPDATE voice_messages SET status = ?2 WHERE id = ?1",
            params![id.to_string(), status.as_str()],
        )?;

        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    pub fn delete_message(&self, id: Uuid) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM voice_messages WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }
}

/// One `voice_messages` row as stored, before parsing the text columns.
struct MessageRow {
    id: String,
    sender_id: String,
    recipient_id: String,
    file_path: String,
    file_size: i64,
    duration_secs: Option<i64>,
    audio_format: String,
    total_chunks: u32,
    chunks_received: u32,
    status: String,
    created_at: String,
    transmitted_at: Option<String>,
    delivered_at: Option<String>,
    listened_at: Option<String>,
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        sender_id: row.get(1)?,
        recipient_id: row.get(2)?,
        file_path: row.get(3)?,
        file_size: row.get(4)?,
        duration_secs: row.get(5)?,
        audio_format: row.get(6)?,
        total_chunks: row.get(7)?,
        chunks_received: row.get(8)?,
        status: row.get(9)?,
        created_at: row.get(10)?,
        transmitted_at: row.get(11)?,
        delivered_at: row.get(12)?,
        listened_at: row.get(13)?,
    })
}

impl MessageRow {
    fn into_message(self) -> Result<VoiceMessage> {
        Ok(VoiceMessage {
            id: Uuid::parse_str(&self.id)?,
            sender_id: Uuid::parse_str(&self.sender_id)?,
            recipient_id: Uuid::parse_str(&self.recipient_id)?,
            file_path: self.file_path,
            file_size: self.file_size,
            duration_secs: self.duration_secs,
            audio_format: self.audio_format,
            total_chunks: self.total_chunks,
            chunks_received: self.chunks_received,
            status: MessageStatus::from_str(&self.status)?,
            created_at: parse_ts(&self.created_at)?,
            transmitted_at: self.transmitted_at.as_deref().map(parse_ts).transpose()?,
            delivered_at: self.delivered_at.as_deref().map(parse_ts).transpose()?,
            listened_at: self.listened_at.as_deref().map(parse_ts).transpose()?,
        })
    }
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}
