//! Minimal key/value client: the handful of commands the session store
//! needs (`SET .. EX [NX]`, `GET`, `DEL`, `INCR`, `EXPIRE`, `SADD`, `SREM`,
//! `SISMEMBER`), over either a remote redis-protocol service or an
//! in-process single-node map with the same TTL semantics.
//!
//! The in-memory backend exists for the `test` environment: it serialises
//! every operation behind one mutex, which preserves the atomic-increment
//! guarantee completion detection relies on.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;

use crate::SessionError;

#[derive(Clone)]
pub enum KvClient {
    Redis(Arc<Mutex<MultiplexedConnection>>),
    Memory(Arc<Mutex<MemoryKv>>),
}

impl KvClient {
    /// Connect to a redis-protocol service and ping it once.
    pub async fn connect(addr: &str, password: Option<&str>) -> Result<Self, SessionError> {
        let url = match password {
            Some(pw) if !pw.is_empty() => format!("redis://:{}@{}", pw, addr),
            _ => format!("redis://{}", addr),
        };

        let client = redis::Client::open(url)?;
        let mut conn = client.get_multiplexed_tokio_connection().await?;

        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        Ok(Self::Redis(Arc::new(Mutex::new(conn))))
    }

    /// Single-node ephemeral backend.
    pub fn memory() -> Self {
        Self::Memory(Arc::new(Mutex::new(MemoryKv::default())))
    }

    pub async fn set_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<(), SessionError> {
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
                Ok(())
            }
            Self::Memory(map) => {
                map.lock().await.set(key, value, Some(ttl));
                Ok(())
            }
        }
    }

    /// `SET .. EX .. NX`: stores only when the key is absent. Returns whether
    /// the value was written.
    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, SessionError> {
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                let reply: Option<String> = redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut *conn)
                    .await?;
                Ok(reply.is_some())
            }
            Self::Memory(map) => {
                let mut map = map.lock().await;
                if map.get(key).is_some() {
                    return Ok(false);
                }
                map.set(key, value, Some(ttl));
                Ok(true)
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, SessionError> {
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                let value: Option<Vec<u8>> =
                    redis::cmd("GET").arg(key).query_async(&mut *conn).await?;
                Ok(value)
            }
            Self::Memory(map) => Ok(map.lock().await.get(key)),
        }
    }

    /// Batched delete; absent keys are ignored.
    pub async fn del(&self, keys: &[String]) -> Result<(), SessionError> {
        if keys.is_empty() {
            return Ok(());
        }
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                let mut cmd = redis::cmd("DEL");
                for key in keys {
                    cmd.arg(key);
                }
                cmd.query_async::<_, ()>(&mut *conn).await?;
                Ok(())
            }
            Self::Memory(map) => {
                let mut map = map.lock().await;
                for key in keys {
                    map.remove(key);
                }
                Ok(())
            }
        }
    }

    /// Atomic increment; a missing key counts from zero.
    pub async fn incr(&self, key: &str) -> Result<i64, SessionError> {
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                let count: i64 = redis::cmd("INCR").arg(key).query_async(&mut *conn).await?;
                Ok(count)
            }
            Self::Memory(map) => Ok(map.lock().await.incr(key)),
        }
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<(), SessionError> {
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                redis::cmd("EXPIRE")
                    .arg(key)
                    .arg(ttl.as_secs().max(1))
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
                Ok(())
            }
            Self::Memory(map) => {
                map.lock().await.touch_ttl(key, ttl);
                Ok(())
            }
        }
    }

    pub async fn sadd(&self, set: &str, member: &str) -> Result<(), SessionError> {
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                redis::cmd("SADD")
                    .arg(set)
                    .arg(member)
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
                Ok(())
            }
            Self::Memory(map) => {
                map.lock()
                    .await
                    .sets
                    .entry(set.to_string())
                    .or_default()
                    .insert(member.to_string());
                Ok(())
            }
        }
    }

    pub async fn srem(&self, set: &str, member: &str) -> Result<(), SessionError> {
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                redis::cmd("SREM")
                    .arg(set)
                    .arg(member)
                    .query_async::<_, ()>(&mut *conn)
                    .await?;
                Ok(())
            }
            Self::Memory(map) => {
                if let Some(members) = map.lock().await.sets.get_mut(set) {
                    members.remove(member);
                }
                Ok(())
            }
        }
    }

    pub async fn sismember(&self, set: &str, member: &str) -> Result<bool, SessionError> {
        match self {
            Self::Redis(conn) => {
                let mut conn = conn.lock().await;
                let hit: i64 = redis::cmd("SISMEMBER")
                    .arg(set)
                    .arg(member)
                    .query_async(&mut *conn)
                    .await?;
                Ok(hit == 1)
            }
            Self::Memory(map) => Ok(map
                .lock()
                .await
                .sets
                .get(set)
                .map(|members| members.contains(member))
                .unwrap_or(false)),
        }
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// Single-node map with lazy per-key expiry.
#[derive(Default)]
pub struct MemoryKv {
    entries: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
}

impl MemoryKv {
    fn set(&mut self, key: &str, value: Vec<u8>, ttl: Option<Duration>) {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
    }

    fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        if self.entries.get(key).is_some_and(Entry::expired) {
            self.entries.remove(key);
        }
        self.entries.get(key).map(|e| e.value.clone())
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
    }

    fn incr(&mut self, key: &str) -> i64 {
        let current = self
            .get(key)
            .and_then(|v| String::from_utf8(v).ok())
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + 1;

        let expires_at = self.entries.get(key).and_then(|e| e.expires_at);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string().into_bytes(),
                expires_at,
            },
        );
        next
    }

    fn touch_ttl(&mut self, key: &str, ttl: Duration) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let kv = KvClient::memory();
        kv.set_ex("k", b"v".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(kv.get("absent").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_key_is_gone() {
        let kv = KvClient::memory();
        kv.set_ex("k", b"v".to_vec(), Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_nx_reports_first_write() {
        let kv = KvClient::memory();
        assert!(kv
            .set_nx_ex("k", b"a".to_vec(), Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!kv
            .set_nx_ex("k", b"b".to_vec(), Duration::from_secs(10))
            .await
            .unwrap());
        // First value wins under NX.
        assert_eq!(kv.get("k").await.unwrap(), Some(b"a".to_vec()));
    }

    #[tokio::test]
    async fn incr_counts_from_zero_and_is_atomic() {
        let kv = KvClient::memory();
        assert_eq!(kv.incr("n").await.unwrap(), 1);

        let mut handles = Vec::new();
        for _ in 0..32 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move { kv.incr("n").await.unwrap() }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            seen.push(handle.await.unwrap());
        }
        seen.sort_unstable();
        let expected: Vec<i64> = (2..=33).collect();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn sets_track_membership() {
        let kv = KvClient::memory();
        kv.sadd("online", "u1").await.unwrap();
        assert!(kv.sismember("online", "u1").await.unwrap());
        assert!(!kv.sismember("online", "u2").await.unwrap());

        kv.srem("online", "u1").await.unwrap();
        assert!(!kv.sismember("online", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn del_is_batched_and_idempotent() {
        let kv = KvClient::memory();
        kv.set_ex("a", b"1".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();
        kv.set_ex("b", b"2".to_vec(), Duration::from_secs(10))
            .await
            .unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "missing".to_string()];
        kv.del(&keys).await.unwrap();
        kv.del(&keys).await.unwrap();

        assert_eq!(kv.get("a").await.unwrap(), None);
        assert_eq!(kv.get("b").await.unwrap(), None);
    }
}
