//! # crosswire-store
//!
//! Durable storage for the crosswire server, backed by SQLite.
//!
//! The core components only see the repository traits in [`repository`];
//! [`Database`] is the SQLite implementation of all of them. The handle is
//! `Send + Sync` (the connection sits behind a mutex) so it can be shared
//! across the server's tasks in an `Arc`.

pub mod channels;
pub mod database;
pub mod members;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod restrictions;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
pub use repository::{
    ChannelRepository, MemberRepository, MessageRepository, Repository, RestrictionRepository,
};
