//! Async facade over the message store.
//!
//! Handler tasks share one SQLite connection behind a lock; every operation
//! is a short transaction, so contention stays negligible next to the
//! network round trips around it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use parlo_store::{Database, MessageStatus, StoreError, VoiceMessage};

#[derive(Clone)]
pub struct MessageLedger {
    db: Arc<Mutex<Database>>,
}

impl MessageLedger {
    pub fn new(db: Database) -> Self {
        Self {
            db: Arc::new(Mutex::new(db)),
        }
    }

    pub async fn create(&self, msg: &VoiceMessage) -> Result<(), StoreError> {
        self.db.lock().await.create_message(msg)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<VoiceMessage, StoreError> {
        self.db.lock().await.get_message(id)
    }

    pub async fn list_by_recipient(
        &self,
        recipient_id: Uuid,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<VoiceMessage>, StoreError> {
        self.db
            .lock()
            .await
            .list_by_recipient(recipient_id, limit, offset)
    }

    pub async fn update(
        &self,
        id: Uuid,
        chunks_received: u32,
        status: MessageStatus,
        transmitted_at: Option<DateTime<Utc>>,
        delivered_at: Option<DateTime<Utc>>,
        listened_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.db.lock().await.update_message(
            id,
            chunks_received,
            status,
            transmitted_at,
            delivered_at,
            listened_at,
        )
    }

    pub async fn update_status_only(
        &self,
        id: Uuid,
        status: MessageStatus,
    ) -> Result<(), StoreError> {
        self.db.lock().await.update_status(id, status)
    }

    #[allow(dead_code)]
    pub async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.db.lock().await.delete_message(id)
    }
}
