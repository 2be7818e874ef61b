//! Per-feed ingestion cursor.
//!
//! The cursor is the last block known to be fully processed by a feed. It moves
//! forward only after a range query succeeds, so a failed query is retried over the
//! same range on the next tick instead of silently skipping blocks.
//!
//! Cursors live in memory by default. A [`FileCursorStore`] keeps them across
//! restarts as `cursor_<feed>.json` files.

use super::IngestError;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

/// Tracks the last processed block of one feed.
#[derive(Debug, Clone)]
pub struct CursorTracker {
    feed: String,
    last_block: u64,
}

impl CursorTracker {
    pub fn new(feed: impl Into<String>, last_block: u64) -> Self {
        Self {
            feed: feed.into(),
            last_block,
        }
    }

    pub fn feed(&self) -> &str {
        &self.feed
    }

    pub fn last_block(&self) -> u64 {
        self.last_block
    }

    /// Range to fetch for a newly observed chain tip.
    ///
    /// # Returns
    ///
    /// `[cursor + 1, tip]`, or `None` when the tip is not ahead of the cursor.
    pub fn observe(&self, tip: u64) -> Option<BlockRange> {
        if tip < self.last_block {
            warn!(
                feed = %self.feed,
                "Chain tip {} is behind cursor {}, waiting for the chain to catch up",
                tip, self.last_block
            );
        }
        (tip > self.last_block).then(|| BlockRange {
            from: self.last_block + 1,
            to: tip,
        })
    }

    /// Record that every block up to `block` has been processed. Never moves backwards.
    pub fn advance(&mut self, block: u64) {
        if block > self.last_block {
            self.last_block = block;
        }
    }
}

/// Where cursors are kept between ticks (and optionally between runs).
#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self, feed: &str) -> Result<Option<u64>, IngestError>;
    async fn save(&self, feed: &str, last_block: u64) -> Result<(), IngestError>;
}

/// Cursors for the lifetime of the process only.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, u64>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for MemoryCursorStore {
    async fn load(&self, feed: &str) -> Result<Option<u64>, IngestError> {
        Ok(self.cursors.lock().await.get(feed).copied())
    }

    async fn save(&self, feed: &str, last_block: u64) -> Result<(), IngestError> {
        self.cursors.lock().await.insert(feed.to_string(), last_block);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CursorFile {
    last_block: u64,
    updated_at: String,
}

/// JSON file per feed under a data directory.
pub struct FileCursorStore {
    data_dir: PathBuf,
}

impl FileCursorStore {
    pub fn new(data_dir: PathBuf) -> Self {
        Self { data_dir }
    }

    fn cursor_filename(&self, feed: &str) -> PathBuf {
        let safe: String = feed
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.data_dir.join(format!("cursor_{}.json", safe))
    }
}

#[async_trait]
impl CursorStore for FileCursorStore {
    async fn load(&self, feed: &str) -> Result<Option<u64>, IngestError> {
        let filename = self.cursor_filename(feed);
        let content = match tokio::fs::read_to_string(&filename).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(IngestError::CursorStore(format!(
                    "Failed to read cursor file {:?}: {}",
                    filename, e
                )));
            }
        };

        let cursor: CursorFile = serde_json::from_str(&content).map_err(|e| {
            IngestError::CursorStore(format!("Failed to parse cursor file {:?}: {}", filename, e))
        })?;
        info!(
            "Restored cursor for feed {} at block {} (saved {})",
            feed, cursor.last_block, cursor.updated_at
        );
        Ok(Some(cursor.last_block))
    }

    async fn save(&self, feed: &str, last_block: u64) -> Result<(), IngestError> {
        tokio::fs::create_dir_all(&self.data_dir).await.map_err(|e| {
            IngestError::CursorStore(format!("Failed to create cursor directory: {}", e))
        })?;

        let cursor = CursorFile {
            last_block,
            updated_at: chrono::Utc::now().to_rfc3339(),
        };
        let filename = self.cursor_filename(feed);
        let staging = filename.with_extension("json.tmp");

        tokio::fs::write(&staging, serde_json::to_string_pretty(&cursor)?)
            .await
            .map_err(|e| IngestError::CursorStore(format!("Failed to write cursor file: {}", e)))?;
        tokio::fs::rename(&staging, &filename)
            .await
            .map_err(|e| IngestError::CursorStore(format!("Failed to replace cursor file: {}", e)))?;

        debug!("Saved cursor for feed {} at block {}", feed, last_block);
        Ok(())
    }
}
