//! Message history and reactions.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde_json::{Map, Value};

use crosswire_shared::protocol::Message;

use crate::database::{parse_text, parse_ts, ts, Database};
use crate::error::{not_found, Result, StoreError};
use crate::models::Reaction;
use crate::repository::MessageRepository;

const MESSAGE_COLUMNS: &str = "id, channel_id, sender_id, sender_nickname, type, content,
     reply_to_id, timestamp, original_sender_id";

impl MessageRepository for Database {
    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    fn create_message(&self, message: &Message) -> Result<()> {
        let content = serde_json::to_string(&message.content)?;
        let timestamp = message.timestamp.unwrap_or_else(Utc::now);

        self.conn().execute(
            "INSERT INTO messages (id, channel_id, sender_id, sender_nickname, type, content,
                                   reply_to_id, timestamp, original_sender_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id,
                message.channel_id,
                message.sender_id,
                message.sender_nickname,
                message.kind.as_str(),
                content,
                message.reply_to_id,
                ts(&timestamp),
                message.original_sender_id,
            ],
        )?;
        Ok(())
    }

    fn get_message(&self, id: &str) -> Result<Message> {
        self.conn()
            .query_row(
                &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
                params![id],
                row_to_message,
            )
            .map_err(not_found)
    }

    fn update_message(&self, message: &Message) -> Result<()> {
        let content = serde_json::to_string(&message.content)?;
        let changed = self.conn().execute(
            "UPDATE messages SET content = ?2, reply_to_id = ?3 WHERE id = ?1",
            params![message.id, content, message.reply_to_id],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn delete_message(&self, id: &str) -> Result<bool> {
        let conn = self.conn();
        conn.execute("DELETE FROM reactions WHERE message_id = ?1", params![id])?;
        let affected = conn.execute("DELETE FROM messages WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    fn messages_for_channel(
        &self,
        channel_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ?1
             ORDER BY timestamp ASC
             LIMIT ?2 OFFSET ?3"
        ))?;

        let rows = stmt.query_map(
            params![channel_id, limit as i64, offset as i64],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn messages_since(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE channel_id = ?1 AND timestamp > ?2
             ORDER BY timestamp ASC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(params![channel_id, ts(&since), limit as i64], row_to_message)?;

        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    // ------------------------------------------------------------------
    // Reactions
    // ------------------------------------------------------------------

    fn add_reaction(&self, reaction: &Reaction) -> Result<bool> {
        let inserted = self.conn().execute(
            "INSERT OR IGNORE INTO reactions (message_id, member_id, emoji, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                reaction.message_id,
                reaction.member_id,
                reaction.emoji,
                ts(&reaction.created_at),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn remove_reaction(&self, message_id: &str, member_id: &str, emoji: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM reactions WHERE message_id = ?1 AND member_id = ?2 AND emoji = ?3",
            params![message_id, member_id, emoji],
        )?;
        Ok(affected > 0)
    }

    fn reactions_for(&self, message_id: &str) -> Result<Vec<Reaction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT message_id, member_id, emoji, created_at
             FROM reactions
             WHERE message_id = ?1
             ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map(params![message_id], |row| {
            let created: String = row.get(3)?;
            Ok(Reaction {
                message_id: row.get(0)?,
                member_id: row.get(1)?,
                emoji: row.get(2)?,
                created_at: parse_ts(3, &created)?,
            })
        })?;

        let mut reactions = Vec::new();
        for row in rows {
            reactions.push(row?);
        }
        Ok(reactions)
    }
}

impl Database {
    /// Timestamp of the newest stored message in a channel, if any.
    pub fn latest_message_timestamp(&self, channel_id: &str) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT MAX(timestamp) FROM messages WHERE channel_id = ?1",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();

        raw.map(|s| parse_ts(0, &s).map_err(StoreError::from))
            .transpose()
    }
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let kind: String = row.get(4)?;
    let content: String = row.get(5)?;
    let timestamp: String = row.get(7)?;

    let content: Map<String, Value> = serde_json::from_str(&content).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Message {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        sender_id: row.get(2)?,
        sender_nickname: row.get(3)?,
        kind: parse_text(4, &kind)?,
        content,
        reply_to_id: row.get(6)?,
        timestamp: Some(parse_ts(7, &timestamp)?),
        original_sender_id: row.get(8)?,
    })
}
