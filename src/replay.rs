use crate::transport::ChannelTransport;
use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Replays captured messages into the inbound queue.
///
/// The directory holds a `log.csv` of `timestamp,filename` lines and one JSON
/// payload file per line. With `use_real_timestamps` the original intervals
/// are reproduced, scaled by `time_multiplier` (0.5 = double speed); otherwise
/// a fixed `default_delay` separates messages.
pub async fn replay(
    dir: &Path,
    transport: &ChannelTransport,
    use_real_timestamps: bool,
    default_delay: Duration,
    time_multiplier: f64,
) -> Result<()> {
    let log_path = dir.join("log.csv");
    let log = std::fs::read_to_string(&log_path)
        .with_context(|| format!("missing log.csv in {}", dir.display()))?;

    info!(path = %log_path.display(), "starting offline replay");
    let mut previous: Option<NaiveDateTime> = None;
    let mut published = 0usize;

    for line in log.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((ts_str, filename)) = line.split_once(',') else {
            warn!(line, "malformed log line, skipping");
            continue;
        };
        let Ok(ts) = ts_str.parse::<NaiveDateTime>() else {
            warn!(line, "bad timestamp in log line, skipping");
            continue;
        };

        if use_real_timestamps {
            if let Some(prev) = previous {
                let gap = (ts - prev).num_milliseconds().max(0) as f64 * time_multiplier;
                tokio::time::sleep(Duration::from_millis(gap as u64)).await;
            }
        } else if !default_delay.is_zero() {
            tokio::time::sleep(default_delay).await;
        }
        previous = Some(ts);

        let file_path = dir.join(filename.trim());
        let payload = match std::fs::read_to_string(&file_path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(value) => value,
                Err(e) => {
                    warn!(file = %file_path.display(), error = %e, "invalid JSON payload, skipping");
                    continue;
                }
            },
            Err(e) => {
                warn!(file = %file_path.display(), error = %e, "unreadable payload file, skipping");
                continue;
            }
        };

        transport.publish(payload);
        published += 1;
    }

    info!(published, "offline replay finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport;

    #[tokio::test]
    async fn replays_messages_in_log_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("log.csv"),
            "2024-05-01T10:00:00,a.json\n2024-05-01T10:00:01,b.json\nnot-a-line\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("a.json"),
            r#"{"data":{"sn":"SN1","host":{"latitude":31.0,"longitude":35.0}}}"#,
        )
        .unwrap();
        std::fs::write(
            dir.path().join("b.json"),
            r#"{"data":{"sn":"SN2","host":{"latitude":31.1,"longitude":35.1}}}"#,
        )
        .unwrap();

        let (transport, mut rx) = transport::channel();
        replay(dir.path(), &transport, false, Duration::ZERO, 1.0)
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().payload["data"]["sn"], "SN1");
        assert_eq!(rx.recv().await.unwrap().payload["data"]["sn"], "SN2");
    }

    #[tokio::test]
    async fn missing_log_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let (transport, _rx) = transport::channel();
        assert!(replay(dir.path(), &transport, false, Duration::ZERO, 1.0)
            .await
            .is_err());
    }
}
