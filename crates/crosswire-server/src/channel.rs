//! The hosted channel: its record, its members and their restrictions.
//!
//! Members and restrictions are cached in memory and written through to the
//! repository. Each map sits behind its own lock and no method holds both.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crosswire_shared::constants::SERVER_ID;
use crosswire_shared::types::{Role, UserStatus};
use crosswire_store::{
    Channel, ChannelRepository, Member, MemberRepository, Repository, Restriction,
    RestrictionRepository, StoreError,
};

use crate::config::ServerConfig;
use crate::error::{Result, ServerError};
use crate::events::{EventBus, EventType};
use crate::keyring::ChannelSecrets;

pub struct ChannelManager {
    repo: Arc<dyn Repository>,
    events: EventBus,
    channel: RwLock<Channel>,
    members: RwLock<HashMap<String, Member>>,
    restrictions: RwLock<HashMap<String, Restriction>>,
}

fn expiry_after(duration: Option<Duration>) -> Result<Option<chrono::DateTime<Utc>>> {
    duration
        .map(|d| {
            chrono::Duration::from_std(d)
                .map(|d| Utc::now() + d)
                .map_err(|_| ServerError::BadRequest("duration out of range".into()))
        })
        .transpose()
}

impl ChannelManager {
    /// Load the configured channel or create it, then load its members and
    /// active restrictions and make sure the `server` member exists.
    ///
    /// Refuses to start when a stored channel's key does not match the key
    /// `secrets` derives from the configured password.
    pub async fn initialize(
        repo: Arc<dyn Repository>,
        events: EventBus,
        config: &ServerConfig,
        secrets: &ChannelSecrets,
        server_public_key: [u8; 32],
    ) -> Result<Self> {
        let channel = match repo.get_channel(&config.channel_id) {
            Ok(channel) => {
                if !secrets.matches_stored(&channel.encryption_key) {
                    return Err(ServerError::Crypto(
                        "configured password does not match the stored channel key".into(),
                    ));
                }
                info!(channel = %channel.id, name = %channel.name, "loaded existing channel");
                channel
            }
            Err(StoreError::NotFound) => {
                let now = Utc::now();
                let channel = Channel {
                    id: config.channel_id.clone(),
                    name: config.channel_name.clone(),
                    description: String::new(),
                    password_hash: secrets.password_hash.clone(),
                    salt: secrets.salt.clone(),
                    encryption_key: secrets.key.to_vec(),
                    key_version: 1,
                    max_members: config.max_members,
                    transport_mode: config.transport_mode,
                    created_at: now,
                    updated_at: now,
                };
                repo.create_channel(&channel)?;
                info!(channel = %channel.id, name = %channel.name, "created channel");
                channel
            }
            Err(e) => return Err(e.into()),
        };

        let mut members = HashMap::new();
        for mut member in repo.members_for_channel(&channel.id)? {
            // Nobody is connected before the transport starts.
            if member.id != SERVER_ID && member.status != UserStatus::Offline {
                member.status = UserStatus::Offline;
                repo.update_member_status(&member.id, UserStatus::Offline, member.last_seen_at)?;
            }
            members.insert(member.id.clone(), member);
        }

        let server_member = match members.get(SERVER_ID) {
            Some(existing) => {
                let mut m = existing.clone();
                m.public_key = Some(server_public_key.to_vec());
                m.status = UserStatus::Online;
                m.role = Role::Admin;
                m.last_seen_at = Utc::now();
                repo.update_member(&m)?;
                m
            }
            None => {
                let mut m = Member::new(SERVER_ID, &channel.id, "Server", Role::Admin);
                m.public_key = Some(server_public_key.to_vec());
                repo.create_member(&m)?;
                m
            }
        };
        members.insert(SERVER_ID.to_string(), server_member);
        info!(count = members.len(), "loaded members");

        let restrictions: HashMap<String, Restriction> = repo
            .active_restrictions(&channel.id)?
            .into_iter()
            .map(|r| (r.member_id.clone(), r))
            .collect();
        if !restrictions.is_empty() {
            info!(count = restrictions.len(), "loaded active restrictions");
        }

        Ok(Self {
            repo,
            events,
            channel: RwLock::new(channel),
            members: RwLock::new(members),
            restrictions: RwLock::new(restrictions),
        })
    }

    pub async fn channel(&self) -> Channel {
        self.channel.read().await.clone()
    }

    pub async fn channel_id(&self) -> String {
        self.channel.read().await.id.clone()
    }

    pub async fn update_channel(&self, name: Option<String>, max_members: Option<usize>) -> Result<Channel> {
        if max_members == Some(0) {
            return Err(ServerError::BadRequest("max members must be positive".into()));
        }
        let updated = {
            let mut channel = self.channel.write().await;
            if let Some(name) = name {
                channel.name = name;
            }
            if let Some(max) = max_members {
                channel.max_members = max;
            }
            channel.updated_at = Utc::now();
            self.repo.update_channel(&channel)?;
            channel.clone()
        };
        info!(name = %updated.name, max_members = updated.max_members, "channel updated");
        self.events.publish(
            EventType::ChannelUpdated,
            json!({ "channel": updated.info() }),
        );
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Membership
    // -----------------------------------------------------------------------

    /// Members other than the synthetic server member.
    pub async fn total_count(&self) -> usize {
        self.members
            .read()
            .await
            .keys()
            .filter(|id| id.as_str() != SERVER_ID)
            .count()
    }

    pub async fn online_count(&self) -> usize {
        self.members
            .read()
            .await
            .values()
            .filter(|m| m.id != SERVER_ID && m.status.is_present())
            .count()
    }

    pub async fn add_member(&self, mut member: Member) -> Result<()> {
        let (channel_id, max_members) = {
            let channel = self.channel.read().await;
            (channel.id.clone(), channel.max_members)
        };
        if self.total_count().await >= max_members {
            return Err(ServerError::Capacity("channel is full".into()));
        }
        if self.has_member(&member.id).await {
            return Err(ServerError::Policy("member already exists".into()));
        }

        member.channel_id = channel_id.clone();
        self.repo.create_member(&member)?;
        self.members
            .write()
            .await
            .insert(member.id.clone(), member.clone());

        info!(member = %member.id, nickname = %member.nickname, "member added");
        self.events.publish(
            EventType::MemberJoined,
            json!({ "member": member.info(), "channel_id": channel_id }),
        );
        Ok(())
    }

    pub async fn remove_member(&self, member_id: &str, reason: &str) -> Result<Member> {
        let member = self.take_member(member_id).await?;
        info!(member = %member_id, nickname = %member.nickname, reason, "member removed");
        self.events.publish(
            EventType::MemberLeft,
            json!({ "member": member.info(), "reason": reason }),
        );
        Ok(member)
    }

    async fn take_member(&self, member_id: &str) -> Result<Member> {
        if member_id == SERVER_ID {
            return Err(ServerError::Forbidden("the server member cannot be removed".into()));
        }
        if !self.has_member(member_id).await {
            return Err(ServerError::NotFound(format!("member {member_id}")));
        }
        self.repo.delete_member(member_id)?;
        self.members
            .write()
            .await
            .remove(member_id)
            .ok_or_else(|| ServerError::NotFound(format!("member {member_id}")))
    }

    pub async fn get_member(&self, member_id: &str) -> Result<Member> {
        self.members
            .read()
            .await
            .get(member_id)
            .cloned()
            .ok_or_else(|| ServerError::NotFound(format!("member {member_id}")))
    }

    pub async fn has_member(&self, member_id: &str) -> bool {
        self.members.read().await.contains_key(member_id)
    }

    pub async fn members(&self) -> Vec<Member> {
        let mut members: Vec<Member> = self.members.read().await.values().cloned().collect();
        members.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        members
    }

    pub async fn members_by_role(&self, role: Role) -> Vec<Member> {
        let mut members = self.members().await;
        members.retain(|m| m.role == role);
        members
    }

    pub async fn online_members(&self) -> Vec<Member> {
        let mut members = self.members().await;
        members.retain(|m| m.status.is_present());
        members
    }

    /// Members holding an active restriction of either kind.
    pub async fn muted_members(&self) -> Vec<Member> {
        let mut out = Vec::new();
        for member in self.members().await {
            if self.is_muted(&member.id).await {
                out.push(member);
            }
        }
        out
    }

    /// The member registered with this Ed25519 key, if any.
    pub async fn member_by_public_key(&self, public_key: &[u8]) -> Option<Member> {
        self.members
            .read()
            .await
            .values()
            .find(|m| m.public_key.as_deref() == Some(public_key))
            .cloned()
    }

    /// Sets status and `last_seen_at`. Returns the previous status.
    pub async fn update_member_status(&self, member_id: &str, status: UserStatus) -> Result<UserStatus> {
        let now = Utc::now();
        let old = {
            let mut members = self.members.write().await;
            let member = members
                .get_mut(member_id)
                .ok_or_else(|| ServerError::NotFound(format!("member {member_id}")))?;
            let old = member.status;
            member.status = status;
            member.last_seen_at = now;
            old
        };
        self.repo.update_member_status(member_id, status, now)?;

        if old != status {
            debug!(member = member_id, from = old.as_str(), to = status.as_str(), "status changed");
            self.events.publish(
                EventType::StatusChanged,
                json!({ "member_id": member_id, "old_status": old, "new_status": status }),
            );
        }
        Ok(old)
    }

    /// Record liveness. An offline member that shows a sign of life comes
    /// back online. Returns the previous status.
    pub async fn touch_heartbeat(&self, member_id: &str) -> Result<UserStatus> {
        let now = Utc::now();
        let (old, snapshot) = {
            let mut members = self.members.write().await;
            let member = members
                .get_mut(member_id)
                .ok_or_else(|| ServerError::NotFound(format!("member {member_id}")))?;
            member.last_heartbeat = now;
            member.last_seen_at = now;
            (member.status, member.clone())
        };
        self.repo.update_member(&snapshot)?;

        if old == UserStatus::Offline {
            self.update_member_status(member_id, UserStatus::Online).await?;
        }
        Ok(old)
    }

    /// Mark members silent for longer than `threshold` offline. Returns the
    /// ids that changed.
    pub async fn check_offline_members(&self, threshold: Duration) -> Vec<String> {
        let Ok(threshold) = chrono::Duration::from_std(threshold) else {
            return Vec::new();
        };
        let cutoff = Utc::now() - threshold;
        let stale: Vec<String> = self
            .members
            .read()
            .await
            .values()
            .filter(|m| m.id != SERVER_ID && m.status != UserStatus::Offline)
            .filter(|m| m.last_activity() < cutoff)
            .map(|m| m.id.clone())
            .collect();

        let mut changed = Vec::with_capacity(stale.len());
        for id in stale {
            match self.update_member_status(&id, UserStatus::Offline).await {
                Ok(_) => changed.push(id),
                Err(e) => warn!(member = %id, error = %e, "failed to mark member offline"),
            }
        }
        if !changed.is_empty() {
            info!(count = changed.len(), "marked silent members offline");
        }
        changed
    }

    pub async fn update_member_role(&self, member_id: &str, role: Role) -> Result<Member> {
        if member_id == SERVER_ID {
            return Err(ServerError::Forbidden("the server role is fixed".into()));
        }
        let (old, updated) = {
            let mut members = self.members.write().await;
            let member = members
                .get_mut(member_id)
                .ok_or_else(|| ServerError::NotFound(format!("member {member_id}")))?;
            let old = member.role;
            member.role = role;
            (old, member.clone())
        };
        self.repo.update_member(&updated)?;

        info!(member = member_id, from = %old, to = %role, "role changed");
        self.events.publish(
            EventType::MemberRoleChanged,
            json!({ "member": updated.info(), "old_role": old, "new_role": role }),
        );
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Moderation
    // -----------------------------------------------------------------------

    /// Store a restriction in memory and in the repository, replacing any
    /// previous one for the member.
    pub async fn restrict(&self, restriction: Restriction) -> Result<()> {
        self.repo.upsert_restriction(&restriction)?;
        self.restrictions
            .write()
            .await
            .insert(restriction.member_id.clone(), restriction);
        Ok(())
    }

    /// The member's active restriction. Expired ones are removed here.
    pub async fn restriction(&self, member_id: &str) -> Option<Restriction> {
        let current = self.restrictions.read().await.get(member_id).cloned()?;
        if !current.is_expired() {
            return Some(current);
        }

        self.restrictions.write().await.remove(member_id);
        if let Err(e) = self.repo.delete_restriction(&current.channel_id, member_id) {
            warn!(member = member_id, error = %e, "failed to delete expired restriction");
        }
        debug!(member = member_id, kind = current.kind.as_str(), "restriction expired");
        None
    }

    /// Any active restriction blocks sending, bans included.
    pub async fn is_muted(&self, member_id: &str) -> bool {
        self.restriction(member_id).await.is_some()
    }

    pub async fn is_banned(&self, member_id: &str) -> bool {
        self.restriction(member_id)
            .await
            .is_some_and(|r| r.is_ban())
    }

    /// `duration == None` mutes until lifted.
    pub async fn mute_member(&self, member_id: &str, duration: Option<Duration>, reason: &str) -> Result<Restriction> {
        let member = self.get_member(member_id).await?;
        if member_id == SERVER_ID {
            return Err(ServerError::Forbidden("the server cannot be muted".into()));
        }
        if self.is_banned(member_id).await {
            return Err(ServerError::Policy("member is banned".into()));
        }

        let channel_id = self.channel_id().await;
        let restriction = Restriction::mute(&channel_id, member_id, reason, expiry_after(duration)?);
        self.restrict(restriction.clone()).await?;

        info!(member = member_id, nickname = %member.nickname, ?duration, reason, "member muted");
        self.events.publish(
            EventType::MemberMuted,
            json!({
                "member": member.info(),
                "reason": reason,
                "expires_at": restriction.expires_at,
            }),
        );
        Ok(restriction)
    }

    /// Lifts a mute. Bans are lifted with [`ChannelManager::unban_member`].
    pub async fn unmute_member(&self, member_id: &str) -> Result<()> {
        let member = self.get_member(member_id).await?;
        match self.restriction(member_id).await {
            None => return Err(ServerError::NotFound(format!("no active mute for {member_id}"))),
            Some(r) if r.is_ban() => {
                return Err(ServerError::Policy("member is banned, unban instead".into()))
            }
            Some(r) => self.lift(&r).await?,
        }

        info!(member = member_id, nickname = %member.nickname, "member unmuted");
        self.events
            .publish(EventType::MemberUnmuted, json!({ "member": member.info() }));
        Ok(())
    }

    /// `duration == None` bans permanently. The member is kept (so a
    /// re-join with the same key can be refused) but forced offline.
    pub async fn ban_member(
        &self,
        member_id: &str,
        reason: &str,
        banned_by: &str,
        duration: Option<Duration>,
    ) -> Result<Restriction> {
        if member_id == SERVER_ID {
            return Err(ServerError::Forbidden("the server cannot be banned".into()));
        }
        let member = self.get_member(member_id).await?;
        let channel_id = self.channel_id().await;
        let restriction = Restriction::ban(&channel_id, member_id, reason, expiry_after(duration)?);
        self.restrict(restriction.clone()).await?;
        self.update_member_status(member_id, UserStatus::Offline).await?;

        info!(
            member = member_id,
            nickname = %member.nickname,
            by = banned_by,
            ?duration,
            reason,
            "member banned"
        );
        self.events.publish(
            EventType::MemberBanned,
            json!({
                "member": member.info(),
                "reason": restriction.display_reason(),
                "banned_by": banned_by,
                "expires_at": restriction.expires_at,
            }),
        );
        Ok(restriction)
    }

    pub async fn unban_member(&self, member_id: &str) -> Result<()> {
        let member = self.get_member(member_id).await?;
        match self.restriction(member_id).await {
            Some(r) if r.is_ban() => self.lift(&r).await?,
            _ => return Err(ServerError::NotFound(format!("no active ban for {member_id}"))),
        }

        info!(member = member_id, nickname = %member.nickname, "member unbanned");
        self.events
            .publish(EventType::MemberUnbanned, json!({ "member": member.info() }));
        Ok(())
    }

    async fn lift(&self, restriction: &Restriction) -> Result<()> {
        self.repo
            .delete_restriction(&restriction.channel_id, &restriction.member_id)?;
        self.restrictions
            .write()
            .await
            .remove(&restriction.member_id);
        Ok(())
    }

    /// Remove a member on behalf of a moderator. The kicker must be at least
    /// a moderator and outrank the target (admins may kick anyone).
    pub async fn kick_member(&self, member_id: &str, reason: &str, kicked_by: &str) -> Result<Member> {
        let kicker = self.get_member(kicked_by).await?;
        let target = self.get_member(member_id).await?;
        if kicker.role < Role::Moderator || (!kicker.role.is_admin() && kicker.role <= target.role) {
            return Err(ServerError::Forbidden(format!(
                "{} may not kick {}",
                kicker.role, target.role
            )));
        }

        let member = self.take_member(member_id).await?;
        info!(
            member = member_id,
            nickname = %member.nickname,
            by = %kicker.nickname,
            reason,
            "member kicked"
        );
        self.events.publish(
            EventType::MemberKicked,
            json!({ "member": member.info(), "reason": reason, "kicked_by": kicked_by }),
        );
        Ok(member)
    }
}
