//! Storage seams used by the server core.
//!
//! Each trait is synchronous; callers on the async side wrap calls in short
//! critical sections and never hold a store call across an `.await`.

use chrono::{DateTime, Utc};

use crosswire_shared::protocol::Message;
use crosswire_shared::types::UserStatus;

use crate::error::Result;
use crate::models::{Channel, Member, Reaction, Restriction};

pub trait ChannelRepository: Send + Sync {
    fn create_channel(&self, channel: &Channel) -> Result<()>;

    /// Fails with [`StoreError::NotFound`](crate::StoreError::NotFound).
    fn get_channel(&self, id: &str) -> Result<Channel>;

    fn update_channel(&self, channel: &Channel) -> Result<()>;

    /// Returns `true` if a row was removed.
    fn delete_channel(&self, id: &str) -> Result<bool>;
}

pub trait MemberRepository: Send + Sync {
    fn create_member(&self, member: &Member) -> Result<()>;

    fn get_member(&self, id: &str) -> Result<Member>;

    fn update_member(&self, member: &Member) -> Result<()>;

    fn update_member_status(&self, id: &str, status: UserStatus, at: DateTime<Utc>)
        -> Result<()>;

    fn delete_member(&self, id: &str) -> Result<bool>;

    fn members_for_channel(&self, channel_id: &str) -> Result<Vec<Member>>;
}

pub trait MessageRepository: Send + Sync {
    fn create_message(&self, message: &Message) -> Result<()>;

    fn get_message(&self, id: &str) -> Result<Message>;

    fn update_message(&self, message: &Message) -> Result<()>;

    fn delete_message(&self, id: &str) -> Result<bool>;

    /// Messages in ascending timestamp order.
    fn messages_for_channel(&self, channel_id: &str, limit: usize, offset: usize)
        -> Result<Vec<Message>>;

    /// Messages strictly newer than `since`, ascending, at most `limit`.
    fn messages_since(
        &self,
        channel_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Message>>;

    /// Idempotent; returns `false` if the reaction already existed.
    fn add_reaction(&self, reaction: &Reaction) -> Result<bool>;

    fn remove_reaction(&self, message_id: &str, member_id: &str, emoji: &str) -> Result<bool>;

    fn reactions_for(&self, message_id: &str) -> Result<Vec<Reaction>>;
}

pub trait RestrictionRepository: Send + Sync {
    /// Replaces any existing restriction for the member.
    fn upsert_restriction(&self, restriction: &Restriction) -> Result<()>;

    fn delete_restriction(&self, channel_id: &str, member_id: &str) -> Result<bool>;

    /// Restrictions that have not expired as of now.
    fn active_restrictions(&self, channel_id: &str) -> Result<Vec<Restriction>>;
}

/// Everything the server needs from storage.
pub trait Repository:
    ChannelRepository + MemberRepository + MessageRepository + RestrictionRepository
{
}

impl<T> Repository for T where
    T: ChannelRepository + MemberRepository + MessageRepository + RestrictionRepository
{
}
