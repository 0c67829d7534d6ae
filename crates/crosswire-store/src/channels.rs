//! CRUD operations for [`Channel`] records.

use rusqlite::params;

use crate::database::{parse_text, parse_ts, ts, Database};
use crate::error::{not_found, Result};
use crate::models::Channel;
use crate::repository::ChannelRepository;

const CHANNEL_COLUMNS: &str = "id, name, description, password_hash, salt, encryption_key,
     key_version, max_members, transport_mode, created_at, updated_at";

impl ChannelRepository for Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    fn create_channel(&self, channel: &Channel) -> Result<()> {
        self.conn().execute(
            "INSERT INTO channels (id, name, description, password_hash, salt, encryption_key,
                                   key_version, max_members, transport_mode, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                channel.id,
                channel.name,
                channel.description,
                channel.password_hash,
                channel.salt,
                channel.encryption_key,
                channel.key_version,
                channel.max_members as i64,
                channel.transport_mode.as_str(),
                ts(&channel.created_at),
                ts(&channel.updated_at),
            ],
        )?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    fn get_channel(&self, id: &str) -> Result<Channel> {
        self.conn()
            .query_row(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1"),
                params![id],
                row_to_channel,
            )
            .map_err(not_found)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    fn update_channel(&self, channel: &Channel) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE channels
             SET name = ?2, description = ?3, password_hash = ?4, salt = ?5,
                 encryption_key = ?6, key_version = ?7, max_members = ?8,
                 transport_mode = ?9, updated_at = ?10
             WHERE id = ?1",
            params![
                channel.id,
                channel.name,
                channel.description,
                channel.password_hash,
                channel.salt,
                channel.encryption_key,
                channel.key_version,
                channel.max_members as i64,
                channel.transport_mode.as_str(),
                ts(&channel.updated_at),
            ],
        )?;
        if changed == 0 {
            return Err(crate::StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    fn delete_channel(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM channels WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }
}

// ----------------------------------------------------------------------
// Row mapping
// ----------------------------------------------------------------------

fn row_to_channel(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let max_members: i64 = row.get(7)?;
    let mode: String = row.get(8)?;
    let created: String = row.get(9)?;
    let updated: String = row.get(10)?;

    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        password_hash: row.get(3)?,
        salt: row.get(4)?,
        encryption_key: row.get(5)?,
        key_version: row.get(6)?,
        max_members: max_members.max(0) as usize,
        transport_mode: parse_text(8, &mode)?,
        created_at: parse_ts(9, &created)?,
        updated_at: parse_ts(10, &updated)?,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use crosswire_shared::types::TransportMode;

    pub(crate) fn sample_channel(id: &str) -> Channel {
        let now = Utc::now();
        Channel {
            id: id.to_string(),
            name: "ops".to_string(),
            description: String::new(),
            password_hash: "00ff".to_string(),
            salt: vec![1, 2, 3],
            encryption_key: vec![7u8; 32],
            key_version: 1,
            max_members: 100,
            transport_mode: TransportMode::Https,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_channel_crud() {
        let db = Database::open_in_memory().unwrap();
        let mut channel = sample_channel("chan-1");

        db.create_channel(&channel).unwrap();
        let loaded = db.get_channel("chan-1").unwrap();
        assert_eq!(loaded.encryption_key, vec![7u8; 32]);
        assert_eq!(loaded.transport_mode, TransportMode::Https);

        channel.name = "ops-renamed".into();
        channel.key_version = 2;
        db.update_channel(&channel).unwrap();
        let loaded = db.get_channel("chan-1").unwrap();
        assert_eq!(loaded.name, "ops-renamed");
        assert_eq!(loaded.key_version, 2);

        assert!(db.delete_channel("chan-1").unwrap());
        assert!(matches!(
            db.get_channel("chan-1"),
            Err(crate::StoreError::NotFound)
        ));
    }
}
