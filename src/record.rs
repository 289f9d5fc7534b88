use crate::transport::InboundMessage;
use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Minimum gap between archived messages, so a capture stays a sample rather
/// than a full firehose dump.
const MIN_SAVE_INTERVAL_SECS: i64 = 5;

/// Archives raw inbound payloads for later replay: one JSON file per saved
/// message plus a `log.csv` of `timestamp,filename` lines, the exact format
/// `replay` consumes.
pub struct MessageRecorder {
    dir: PathBuf,
    min_interval: Duration,
    last_saved: Option<DateTime<Utc>>,
}

impl MessageRecorder {
    /// Creates a fresh capture directory under `base`.
    pub fn create(base: &Path) -> Result<Self> {
        let dir = base.join(format!("capture_{}", Utc::now().format("%Y%m%d_%H%M%S")));
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create capture directory {}", dir.display()))?;
        info!(dir = %dir.display(), "recording inbound messages");
        Ok(Self {
            dir,
            min_interval: Duration::seconds(MIN_SAVE_INTERVAL_SECS),
            last_saved: None,
        })
    }

    #[cfg(test)]
    fn with_min_interval(dir: &Path, min_interval: Duration) -> Self {
        Self {
            dir: dir.to_path_buf(),
            min_interval,
            last_saved: None,
        }
    }

    /// Saves one message unless the previous save was too recent. Returns the
    /// filename written, if any.
    pub fn record(&mut self, msg: &InboundMessage) -> Result<Option<String>> {
        if let Some(last) = self.last_saved {
            if msg.received_at.signed_duration_since(last) < self.min_interval {
                return Ok(None);
            }
        }

        let stamp = msg.received_at.naive_utc();
        let filename = format!("{}.json", stamp.format("%Y%m%d_%H%M%S_%3f"));
        let payload = serde_json::to_string(&msg.payload)?;
        std::fs::write(self.dir.join(&filename), payload)
            .with_context(|| format!("cannot write {filename}"))?;

        let mut log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("log.csv"))
            .context("cannot open log.csv")?;
        writeln!(log, "{},{}", stamp.format("%Y-%m-%dT%H:%M:%S%.3f"), filename)?;

        self.last_saved = Some(msg.received_at);
        Ok(Some(filename))
    }
}
