use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::kv::KvClient;
use crate::SessionError;

/// Presence record TTL: a session with no traffic for this long expires.
pub const SESSION_TTL: Duration = Duration::from_secs(300);

/// TTL for pending-upload state (chunk bytes and the arrival counter).
pub const PENDING_TTL: Duration = Duration::from_secs(600);

const ONLINE_USERS_KEY: &str = "online_users";

/// A user's presence record, bound to their last observed transport address.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub user_id: Uuid,
    pub username: String,
    pub address: SocketAddr,
    pub last_seen: DateTime<Utc>,
    pub status: String,
    pub connected_at: DateTime<Utc>,
}

/// Typed wrapper over the key/value service.
///
/// Owns the ephemeral key space exclusively; everything else holds sessions
/// and pending uploads only by identifier.
#[derive(Clone)]
pub struct SessionStore {
    kv: KvClient,
    session_ttl: Duration,
    pending_ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: KvClient) -> Self {
        Self {
            kv,
            session_ttl: SESSION_TTL,
            pending_ttl: PENDING_TTL,
        }
    }

    /// Override the TTLs. Test hook; production uses the defaults.
    pub fn with_ttls(kv: KvClient, session_ttl: Duration, pending_ttl: Duration) -> Self {
        Self {
            kv,
            session_ttl,
            pending_ttl,
        }
    }

    pub async fn create_session(
        &self,
        user_id: Uuid,
        username: &str,
        address: SocketAddr,
    ) -> Result<(), SessionError> {
        let now = Utc::now();
        let session = Session {
            user_id,
            username: username.to_string(),
            address,
            last_seen: now,
            status: "online".to_string(),
            connected_at: now,
        };

        let data = serde_json::to_vec(&session)?;
        self.kv
            .set_ex(&session_key(user_id), data, self.session_ttl)
            .await?;
        self.kv
            .sadd(ONLINE_USERS_KEY, &user_id.to_string())
            .await?;

        debug!(user_id = %user_id, username = %username, %address, "session created");
        Ok(())
    }

    /// Fetch the live session for `user_id`.
    ///
    /// `NotFound` is the normal outcome for presence checks, not a fault.
    pub async fn get_session(&self, user_id: Uuid) -> Result<Session, SessionError> {
        let data = self
            .kv
            .get(&session_key(user_id))
            .await?
            .ok_or(SessionError::NotFound)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Refresh `last_seen` and the session TTL.
    ///
    /// Read-modify-write; concurrent refreshes race benignly (last writer
    /// wins on a field that only ever moves forward).
    pub async fn update_last_seen(&self, user_id: Uuid) -> Result<(), SessionError> {
        let mut session = self.get_session(user_id).await?;
        session.last_seen = Utc::now();

        let data = serde_json::to_vec(&session)?;
        self.kv
            .set_ex(&session_key(user_id), data, self.session_ttl)
            .await
    }

    pub async fn delete_session(&self, user_id: Uuid) -> Result<(), SessionError> {
        self.kv.del(&[session_key(user_id)]).await?;
        self.kv
            .srem(ONLINE_USERS_KEY, &user_id.to_string())
            .await?;
        debug!(user_id = %user_id, "session deleted");
        Ok(())
    }

    /// Set-membership test on the online roster. Absence is `false`.
    pub async fn is_online(&self, user_id: Uuid) -> Result<bool, SessionError> {
        self.kv
            .sismember(ONLINE_USERS_KEY, &user_id.to_string())
            .await
    }

    /// Store one chunk of a pending upload.
    ///
    /// Returns `true` when this chunk index was observed for the first time.
    /// A re-put (client retry) overwrites the stored bytes and refreshes the
    /// TTL but reports `false`, so the caller can keep the arrival counter
    /// honest.
    pub async fn save_chunk(
        &self,
        message_id: Uuid,
        chunk_index: u32,
        data: Vec<u8>,
    ) -> Result<bool, SessionError> {
        let key = chunk_key(message_id, chunk_index);
        if self
            .kv
            .set_nx_ex(&key, data.clone(), self.pending_ttl)
            .await?
        {
            return Ok(true);
        }
        self.kv.set_ex(&key, data, self.pending_ttl).await?;
        Ok(false)
    }

    pub async fn get_chunk(
        &self,
        message_id: Uuid,
        chunk_index: u32,
    ) -> Result<Vec<u8>, SessionError> {
        self.kv
            .get(&chunk_key(message_id, chunk_index))
            .await?
            .ok_or(SessionError::NotFound)
    }

    /// Atomically bump the arrival counter for `message_id`.
    ///
    /// The first increment creates the key and applies the pending TTL. The
    /// handler whose result equals the expected total is the unique owner of
    /// reassembly.
    pub async fn increment_received(&self, message_id: Uuid) -> Result<i64, SessionError> {
        let key = count_key(message_id);
        let count = self.kv.incr(&key).await?;
        if count == 1 {
            self.kv.expire(&key, self.pending_ttl).await?;
        }
        Ok(count)
    }

    /// Drop all pending state for `message_id` in one batched delete.
    /// Idempotent.
    pub async fn delete_pending(
        &self,
        message_id: Uuid,
        total_chunks: u32,
    ) -> Result<(), SessionError> {
        let mut keys: Vec<String> = (0..total_chunks)
            .map(|idx| chunk_key(message_id, idx))
            .collect();
        keys.push(count_key(message_id));
        self.kv.del(&keys).await
    }
}

fn session_key(user_id: Uuid) -> String {
    format!("session:{}", user_id)
}

fn chunk_key(message_id: Uuid, chunk_index: u32) -> String {
    format!("pending_message:{}:chunk:{}", message_id, chunk_index)
}

fn count_key(message_id: Uuid) -> String {
    format!("pending_message:{}:count", message_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_store() -> SessionStore {
        SessionStore::new(KvClient::memory())
    }

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[tokio::test]
    async fn session_round_trip() {
        let store = memory_store();
        let user = Uuid::new_v4();

        store.create_session(user, "ada", addr(4000)).await.unwrap();

        let session = store.get_session(user).await.unwrap();
        assert_eq!(session.user_id, user);
        assert_eq!(session.username, "ada");
        assert_eq!(session.address, addr(4000));
        assert_eq!(session.status, "online");
        assert!(store.is_online(user).await.unwrap());
    }

    #[tokio::test]
    async fn missing_session_is_not_found() {
        let store = memory_store();
        assert!(matches!(
            store.get_session(Uuid::new_v4()).await,
            Err(SessionError::NotFound)
        ));
        assert!(!store.is_online(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn delete_session_clears_presence() {
        let store = memory_store();
        let user = Uuid::new_v4();
        store.create_session(user, "ada", addr(4001)).await.unwrap();

        store.delete_session(user).await.unwrap();
        assert!(matches!(
            store.get_session(user).await,
            Err(SessionError::NotFound)
        ));
        assert!(!store.is_online(user).await.unwrap());

        // Idempotent.
        store.delete_session(user).await.unwrap();
    }

    #[tokio::test]
    async fn session_expires_after_ttl() {
        let store = SessionStore::with_ttls(
            KvClient::memory(),
            Duration::from_millis(30),
            PENDING_TTL,
        );
        let user = Uuid::new_v4();
        store.create_session(user, "ada", addr(4002)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(
            store.get_session(user).await,
            Err(SessionError::NotFound)
        ));
        assert!(matches!(
            store.update_last_seen(user).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn update_last_seen_moves_forward() {
        let store = memory_store();
        let user = Uuid::new_v4();
        store.create_session(user, "ada", addr(4003)).await.unwrap();
        let before = store.get_session(user).await.unwrap().last_seen;

        tokio::time::sleep(Duration::from_millis(10)).await;
        store.update_last_seen(user).await.unwrap();

        let after = store.get_session(user).await.unwrap().last_seen;
        assert!(after > before);
    }

    #[tokio::test]
    async fn save_chunk_reports_first_observation() {
        let store = memory_store();
        let msg = Uuid::new_v4();

        assert!(store.save_chunk(msg, 0, b"AA".to_vec()).await.unwrap());
        // Retry of the same index: overwrite, but not a first observation.
        assert!(!store.save_chunk(msg, 0, b"AA".to_vec()).await.unwrap());
        assert!(store.save_chunk(msg, 1, b"BB".to_vec()).await.unwrap());

        assert_eq!(store.get_chunk(msg, 0).await.unwrap(), b"AA");
        assert_eq!(store.get_chunk(msg, 1).await.unwrap(), b"BB");
        assert!(matches!(
            store.get_chunk(msg, 2).await,
            Err(SessionError::NotFound)
        ));
    }

    #[tokio::test]
    async fn counter_increments_atomically() {
        let store = memory_store();
        let msg = Uuid::new_v4();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.increment_received(msg).await.unwrap()
            }));
        }

        let mut counts = Vec::new();
        for handle in handles {
            counts.push(handle.await.unwrap());
        }
        counts.sort_unstable();
        let expected: Vec<i64> = (1..=16).collect();
        assert_eq!(counts, expected, "each increment result must be unique");
    }

    #[tokio::test]
    async fn delete_pending_clears_chunks_and_counter() {
        let store = memory_store();
        let msg = Uuid::new_v4();

        store.save_chunk(msg, 0, b"AA".to_vec()).await.unwrap();
        store.save_chunk(msg, 1, b"BB".to_vec()).await.unwrap();
        store.increment_received(msg).await.unwrap();

        store.delete_pending(msg, 2).await.unwrap();

        assert!(matches!(
            store.get_chunk(msg, 0).await,
            Err(SessionError::NotFound)
        ));
        // Counter restarts from scratch after cleanup.
        assert_eq!(store.increment_received(msg).await.unwrap(), 1);

        store.delete_pending(msg, 2).await.unwrap();
    }
}
