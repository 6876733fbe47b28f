//! Durable on-disk tier: one JSON envelope file per key.
//!
//! Keys are hashed to stable file names; each envelope records the
//! value alongside its creation and expiry timestamps so entries
//! survive process restarts. Expired or corrupt envelopes are removed
//! when encountered. Retention beyond TTL is the filesystem's problem.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::{CacheEntry, CacheTier, Tier};
use crate::error::{Result, UpstreamError};

#[derive(Serialize, Deserialize)]
struct Envelope {
    key: String,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    value_b64: String,
}

pub struct DiskTier {
    dir: PathBuf,
}

impl DiskTier {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .map_err(|e| UpstreamError::CacheUnavailable(format!("create {}: {e}", dir.display())))?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        // 16 hex chars of the digest are plenty for file-name uniqueness.
        self.dir.join(format!("{}.json", &hex::encode(digest)[..16]))
    }

    /// Walk the cache directory and unlink expired or corrupt
    /// envelopes. Returns how many files were removed.
    pub async fn sweep_expired(&self) -> Result<usize> {
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unavailable)?;
        while let Some(item) = entries.next_entry().await.map_err(unavailable)? {
            let path = item.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let keep = match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<Envelope>(&bytes) {
                    Ok(env) => env.expires_at > Utc::now(),
                    Err(_) => false, // corrupt
                },
                Err(_) => false,
            };
            if !keep && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, dir = %self.dir.display(), "swept expired disk cache entries");
        }
        Ok(removed)
    }
}

fn unavailable(e: std::io::Error) -> UpstreamError {
    UpstreamError::CacheUnavailable(format!("disk tier: {e}"))
}

#[async_trait]
impl CacheTier for DiskTier {
    fn tier(&self) -> Tier {
        Tier::Disk
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(unavailable(e)),
        };

        let envelope: Envelope = match serde_json::from_slice(&bytes) {
            Ok(env) => env,
            Err(_) => {
                // Corrupt file: remove and treat as a miss.
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(None);
            }
        };

        let now = Utc::now();
        if envelope.expires_at <= now {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        }

        let Ok(value) = BASE64.decode(&envelope.value_b64) else {
            let _ = tokio::fs::remove_file(&path).await;
            return Ok(None);
        };

        let age = (now - envelope.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let ttl = (envelope.expires_at - envelope.created_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        Ok(Some(CacheEntry {
            key: envelope.key,
            value,
            created_at: Instant::now().checked_sub(age).unwrap_or_else(Instant::now),
            ttl,
            tier_origin: Tier::Disk,
        }))
    }

    async fn put(&self, entry: CacheEntry) -> Result<()> {
        let now = Utc::now();
        let remaining = entry.remaining();
        let age = entry.ttl.saturating_sub(remaining);
        let envelope = Envelope {
            created_at: now - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero()),
            expires_at: now + chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero()),
            value_b64: BASE64.encode(&entry.value),
            key: entry.key,
        };
        let path = self.path_for(&envelope.key);
        let bytes = serde_json::to_vec(&envelope)?;
        tokio::fs::write(&path, bytes).await.map_err(unavailable)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(unavailable(e)),
        }
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize> {
        // File names are key hashes, but the envelope keeps the key.
        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unavailable)?;
        while let Some(item) = entries.next_entry().await.map_err(unavailable)? {
            let path = item.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Ok(bytes) = tokio::fs::read(&path).await else {
                continue;
            };
            let Ok(envelope) = serde_json::from_slice::<Envelope>(&bytes) else {
                continue;
            };
            if envelope.key.starts_with(prefix) && tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn clear(&self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(unavailable)?;
        while let Some(item) = entries.next_entry().await.map_err(unavailable)? {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(())
    }
}
