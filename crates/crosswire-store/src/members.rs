//! CRUD operations for [`Member`] records.

use chrono::{DateTime, Utc};
use rusqlite::params;

use crosswire_shared::types::UserStatus;

use crate::database::{parse_text, parse_ts, ts, Database};
use crate::error::{not_found, Result, StoreError};
use crate::models::Member;
use crate::repository::MemberRepository;

const MEMBER_COLUMNS: &str = "id, channel_id, nickname, public_key, role, status,
     joined_at, last_seen_at, last_heartbeat";

impl MemberRepository for Database {
    fn create_member(&self, member: &Member) -> Result<()> {
        self.conn().execute(
            "INSERT INTO members (id, channel_id, nickname, public_key, role, status,
                                  joined_at, last_seen_at, last_heartbeat)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                member.id,
                member.channel_id,
                member.nickname,
                member.public_key,
                member.role.as_str(),
                member.status.as_str(),
                ts(&member.joined_at),
                ts(&member.last_seen_at),
                ts(&member.last_heartbeat),
            ],
        )?;
        Ok(())
    }

    fn get_member(&self, id: &str) -> Result<Member> {
        self.conn()
            .query_row(
                &format!("SELECT {MEMBER_COLUMNS} FROM members WHERE id = ?1"),
                params![id],
                row_to_member,
            )
            .map_err(not_found)
    }

    fn update_member(&self, member: &Member) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE members
             SET nickname = ?2, public_key = ?3, role = ?4, status = ?5,
                 last_seen_at = ?6, last_heartbeat = ?7
             WHERE id = ?1",
            params![
                member.id,
                member.nickname,
                member.public_key,
                member.role.as_str(),
                member.status.as_str(),
                ts(&member.last_seen_at),
                ts(&member.last_heartbeat),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn update_member_status(&self, id: &str, status: UserStatus, at: DateTime<Utc>) -> Result<()> {
        let changed = self.conn().execute(
            "UPDATE members SET status = ?2, last_seen_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), ts(&at)],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    fn delete_member(&self, id: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM members WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    fn members_for_channel(&self, channel_id: &str) -> Result<Vec<Member>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MEMBER_COLUMNS} FROM members
             WHERE channel_id = ?1
             ORDER BY joined_at ASC"
        ))?;

        let rows = stmt.query_map(params![channel_id], row_to_member)?;

        let mut members = Vec::new();
        for row in rows {
            members.push(row?);
        }
        Ok(members)
    }
}

fn row_to_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<Member> {
    let role: String = row.get(4)?;
    let status: String = row.get(5)?;
    let joined: String = row.get(6)?;
    let seen: String = row.get(7)?;
    let heartbeat: String = row.get(8)?;

    Ok(Member {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        nickname: row.get(2)?,
        public_key: row.get(3)?,
        role: parse_text(4, &role)?,
        status: parse_text(5, &status)?,
        joined_at: parse_ts(6, &joined)?,
        last_seen_at: parse_ts(7, &seen)?,
        last_heartbeat: parse_ts(8, &heartbeat)?,
    })
}
