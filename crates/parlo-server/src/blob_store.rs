//! Object-store gateway for assembled voice messages.
//!
//! Objects live under `<root>/<bucket>/messages/YYYY/MM/DD/<msg_id>.<fmt>`
//! (zero-padded, UTC). The gateway is deliberately dumb: no retries, no
//! caching; a failed upload surfaces as [`ServerError::StorageUnavailable`]
//! and the engine decides what that means for the message record.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Utc;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

#[derive(Debug, Clone)]
pub struct BlobStore {
    bucket_path: PathBuf,
    bucket: String,
    public_url: String,
}

impl BlobStore {
    /// Create the gateway, ensuring the bucket exists.
    pub async fn new(
        root: PathBuf,
        bucket: &str,
        public_url: &str,
    ) -> Result<Self, ServerError> {
        let bucket_path = root.join(bucket);
        fs::create_dir_all(&bucket_path).await.map_err(|e| {
            ServerError::StorageUnavailable(format!(
                "failed to create bucket '{}': {}",
                bucket_path.display(),
                e
            ))
        })?;

        info!(bucket = %bucket, path = %bucket_path.display(), "blob store initialized");

        Ok(Self {
            bucket_path,
            bucket: bucket.to_string(),
            public_url: public_url.trim_end_matches('/').to_string(),
        })
    }

    /// Store an assembled voice message; returns the object key.
    pub async fn upload(
        &self,
        message_id: Uuid,
        data: &[u8],
        audio_format: &str,
    ) -> Result<String, ServerError> {
        let now = Utc::now();
        let object_key = format!(
            "messages/{}/{}.{}",
            now.format("%Y/%m/%d"),
            message_id,
            audio_format
        );

        let path = self.object_path(&object_key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                ServerError::StorageUnavailable(format!("failed to create object prefix: {}", e))
            })?;
        }

        fs::write(&path, data).await.map_err(|e| {
            ServerError::StorageUnavailable(format!("failed to write object {}: {}", object_key, e))
        })?;

        debug!(
            key = %object_key,
            size = data.len(),
            content_type = content_type_for(audio_format),
            "stored voice message"
        );
        Ok(object_key)
    }

    pub async fn download(&self, object_key: &str) -> Result<Vec<u8>, ServerError> {
        let path = self.object_path(object_key);
        if !path.exists() {
            return Err(ServerError::BlobNotFound(object_key.to_string()));
        }

        let data = fs::read(&path).await.map_err(|e| {
            ServerError::StorageUnavailable(format!("failed to read object {}: {}", object_key, e))
        })?;

        debug!(key = %object_key, size = data.len(), "retrieved voice message");
        Ok(data)
    }

    #[allow(dead_code)]
    pub async fn delete(&self, object_key: &str) -> Result<(), ServerError> {
        let path = self.object_path(object_key);
        if !path.exists() {
            return Err(ServerError::BlobNotFound(object_key.to_string()));
        }

        fs::remove_file(&path).await.map_err(|e| {
            ServerError::StorageUnavailable(format!(
                "failed to delete object {}: {}",
                object_key, e
            ))
        })?;

        debug!(key = %object_key, "deleted voice message");
        Ok(())
    }

    /// Time-limited public URL for an object.
    #[allow(dead_code)]
    pub fn presigned_url(&self, object_key: &str, expiry: Duration) -> String {
        let expires = Utc::now().timestamp() + expiry.as_secs() as i64;
        format!(
            "{}/{}/{}?expires={}",
            self.public_url, self.bucket, object_key, expires
        )
    }

    fn object_path(&self, object_key: &str) -> PathBuf {
        self.bucket_path.join(object_key)
    }
}

/// Content type for a stored audio format. Unknown formats fall back to
/// opus, the relay's default codec.
pub fn content_type_for(audio_format: &str) -> &'static str {
    match audio_format {
        "mp3" => "audio/mpeg",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        _ => "audio/opus",
    }
}
