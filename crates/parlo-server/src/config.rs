use std::path::PathBuf;
use std::time::Duration;

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
    Test,
}

impl Environment {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "dev" => Some(Self::Dev),
            "prod" => Some(Self::Prod),
            "test" => Some(Self::Test),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address of the datagram engine.
    pub udp_addr: String,
    /// Filesystem path of the ledger database.
    pub db_path: PathBuf,
    /// Key/value service address (`host:port`). Optional only in the test
    /// environment, which runs on the in-memory backend.
    pub kv_addr: Option<String>,
    pub kv_password: Option<String>,
    /// Root directory of the blob store; the bucket lives underneath it.
    pub blob_root: PathBuf,
    pub blob_bucket: String,
    /// Public endpoint presigned URLs are formed against.
    pub blob_public_url: String,
    pub token_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub env: Environment,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            udp_addr: "0.0.0.0:9090".to_string(),
            db_path: PathBuf::from("./parlo.db"),
            kv_addr: None,
            kv_password: None,
            blob_root: PathBuf::from("./blobs"),
            blob_bucket: "voice-messages".to_string(),
            blob_public_url: "http://localhost:9000".to_string(),
            token_secret: String::new(),
            access_token_ttl: Duration::from_secs(15 * 60),
            refresh_token_ttl: Duration::from_secs(7 * 24 * 3600),
            env: Environment::Dev,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("PARLO_UDP_ADDR") {
            config.udp_addr = addr;
        }

        if let Ok(path) = std::env::var("PARLO_DB_PATH") {
            config.db_path = PathBuf::from(path);
        }

        if let Ok(addr) = std::env::var("PARLO_KV_ADDR") {
            if !addr.is_empty() {
                config.kv_addr = Some(addr);
            }
        }

        if let Ok(password) = std::env::var("PARLO_KV_PASSWORD") {
            if !password.is_empty() {
                config.kv_password = Some(password);
            }
        }

        if let Ok(root) = std::env::var("PARLO_BLOB_ROOT") {
            config.blob_root = PathBuf::from(root);
        }

        if let Ok(bucket) = std::env::var("PARLO_BLOB_BUCKET") {
            config.blob_bucket = bucket;
        }

        if let Ok(url) = std::env::var("PARLO_BLOB_PUBLIC_URL") {
            config.blob_public_url = url;
        }

        if let Ok(secret) = std::env::var("PARLO_TOKEN_SECRET") {
            config.token_secret = secret;
        }

        if let Ok(val) = std::env::var("PARLO_ACCESS_TTL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.access_token_ttl = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %val, "Invalid PARLO_ACCESS_TTL_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("PARLO_REFRESH_TTL_SECS") {
            match val.parse::<u64>() {
                Ok(secs) => config.refresh_token_ttl = Duration::from_secs(secs),
                Err(_) => tracing::warn!(value = %val, "Invalid PARLO_REFRESH_TTL_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("PARLO_ENV") {
            match Environment::parse(&val) {
                Some(env) => config.env = env,
                None => tracing::warn!(value = %val, "Invalid PARLO_ENV, using dev"),
            }
        }

        config
    }

    /// Reject configurations the server cannot start with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.udp_addr.is_empty() {
            return Err(ServerError::Config("udp address is required".into()));
        }
        if self.token_secret.is_empty() {
            return Err(ServerError::Config(
                "token secret is required (PARLO_TOKEN_SECRET)".into(),
            ));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(ServerError::Config("database path is required".into()));
        }
        if self.blob_root.as_os_str().is_empty() || self.blob_bucket.is_empty() {
            return Err(ServerError::Config(
                "blob root and bucket are required".into(),
            ));
        }
        if self.kv_addr.is_none() && self.env != Environment::Test {
            return Err(ServerError::Config(
                "key/value address is required outside the test environment (PARLO_KV_ADDR)".into(),
            ));
        }
        Ok(())
    }
}
