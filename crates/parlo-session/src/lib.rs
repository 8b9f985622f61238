//! Ephemeral state for the relay: user presence records and per-upload
//! chunk buffers, both held in a key/value service with per-key TTLs.
//!
//! Key schema:
//!
//! - `session:<user_id>` — JSON session record, 300 s TTL
//! - `online_users` — set of user ids, maintained alongside the sessions
//! - `pending_message:<msg_id>:chunk:<idx>` — raw chunk bytes, 600 s TTL
//! - `pending_message:<msg_id>:count` — arrival counter, 600 s TTL
//!
//! The counter's atomic increment is what makes upload completion detection
//! race-free: exactly one caller observes the final count.

pub mod kv;
mod store;

pub use kv::KvClient;
pub use store::{Session, SessionStore, PENDING_TTL, SESSION_TTL};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("not found")]
    NotFound,

    #[error("key/value transport error: {0}")]
    Transport(#[from] redis::RedisError),

    #[error("session serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
