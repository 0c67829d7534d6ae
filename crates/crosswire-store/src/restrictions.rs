//! Mutes and bans.
//!
//! Restrictions are stored with an explicit `kind` column; the legacy
//! `BANNED:` reason prefix is only interpreted on input (see
//! [`Restriction::from_reason`]).

use chrono::Utc;
use rusqlite::params;

use crate::database::{parse_text, parse_ts, ts, Database};
use crate::error::Result;
use crate::models::Restriction;
use crate::repository::RestrictionRepository;

impl RestrictionRepository for Database {
    fn upsert_restriction(&self, restriction: &Restriction) -> Result<()> {
        self.conn().execute(
            "INSERT INTO restrictions (channel_id, member_id, kind, reason, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (channel_id, member_id) DO UPDATE SET
                kind = excluded.kind,
                reason = excluded.reason,
                created_at = excluded.created_at,
                expires_at = excluded.expires_at",
            params![
                restriction.channel_id,
                restriction.member_id,
                restriction.kind.as_str(),
                restriction.reason,
                ts(&restriction.created_at),
                restriction.expires_at.as_ref().map(ts),
            ],
        )?;
        Ok(())
    }

    fn delete_restriction(&self, channel_id: &str, member_id: &str) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM restrictions WHERE channel_id = ?1 AND member_id = ?2",
            params![channel_id, member_id],
        )?;
        Ok(affected > 0)
    }

    fn active_restrictions(&self, channel_id: &str) -> Result<Vec<Restriction>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT channel_id, member_id, kind, reason, created_at, expires_at
             FROM restrictions
             WHERE channel_id = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        )?;

        let rows = stmt.query_map(params![channel_id, ts(&Utc::now())], row_to_restriction)?;

        let mut restrictions = Vec::new();
        for row in rows {
            restrictions.push(row?);
        }
        Ok(restrictions)
    }
}

fn row_to_restriction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Restriction> {
    let kind: String = row.get(2)?;
    let created: String = row.get(4)?;
    let expires: Option<String> = row.get(5)?;

    Ok(Restriction {
        channel_id: row.get(0)?,
        member_id: row.get(1)?,
        kind: parse_text(2, &kind)?,
        reason: row.get(3)?,
        created_at: parse_ts(4, &created)?,
        expires_at: expires.map(|s| parse_ts(5, &s)).transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RestrictionKind;
    use chrono::Duration;

    #[test]
    fn test_restriction_upsert_and_expiry_filter() {
        let db = Database::open_in_memory().unwrap();

        db.upsert_restriction(&Restriction::mute("c", "member_1", "noise", None))
            .unwrap();
        // Replacing a mute with a ban keeps a single row.
        db.upsert_restriction(&Restriction::ban("c", "member_1", "abuse", None))
            .unwrap();
        db.upsert_restriction(&Restriction::mute(
            "c",
            "member_2",
            "",
            Some(Utc::now() - Duration::minutes(1)),
        ))
        .unwrap();

        let active = db.active_restrictions("c").unwrap();
        assert_eq!(active.len(), 1);
        assert!(active[0].is_ban());
        assert_eq!(active[0].reason, "abuse");

        assert!(db.delete_restriction("c", "member_1").unwrap());
        assert!(db.active_restrictions("c").unwrap().is_empty());
    }

    #[test]
    fn test_unknown_kind_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        db.conn()
            .execute(
                "INSERT INTO restrictions (channel_id, member_id, kind, reason, created_at, expires_at)
                 VALUES ('c', 'member_1', 'shadowban', '', ?1, NULL)",
                params![ts(&Utc::now())],
            )
            .unwrap();

        assert!(matches!(
            db.active_restrictions("c"),
            Err(crate::error::StoreError::Sqlite(_))
        ));
        assert_eq!("ban".parse::<RestrictionKind>(), Ok(RestrictionKind::Ban));
        assert!("shadowban".parse::<RestrictionKind>().is_err());
    }
}
