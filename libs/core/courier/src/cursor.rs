//! Per-topic replay watermark on local disk.

use crate::error::{CourierError, Result};
use core_config::{FromEnv, PersistenceConfig};
use std::path::{Path, PathBuf};
use tracing::debug;

const FILE_PREFIX: &str = ".agent_msg_time.";

/// Topic name usable as a file name.
pub fn sanitize_topic(topic: &str) -> String {
    topic.replace('/', "")
}

/// Last acknowledged watermark of one topic, stored as a decimal string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistenceCursor {
    path: PathBuf,
}

impl PersistenceCursor {
    pub fn new(state_dir: &Path, topic: &str) -> Self {
        Self {
            path: state_dir.join(format!("{}{}", FILE_PREFIX, sanitize_topic(topic))),
        }
    }

    /// Cursor under `COURIER_STATE_DIR` (or the temp directory).
    pub fn from_env(topic: &str) -> Self {
        let config = PersistenceConfig::from_env().unwrap_or_default();
        Self::new(&config.state_dir, topic)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the watermark. Missing or corrupt records are errors the caller
    /// treats as "no replay this run".
    pub async fn load(&self) -> Result<i64> {
        let data = tokio::fs::read_to_string(&self.path).await?;
        let watermark = data.trim().parse().map_err(|_| {
            CourierError::store(format!(
                "corrupt watermark in {}: '{}'",
                self.path.display(),
                data.trim()
            ))
        })?;
        debug!(path = %self.path.display(), watermark, "Watermark loaded");
        Ok(watermark)
    }

    /// Persist the watermark, replacing the previous record atomically.
    pub async fn store(&self, watermark: i64) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, watermark.to_string()).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
