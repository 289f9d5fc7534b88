use crate::sink::PositionSink;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

/// End-to-end delay above which a root-cause warning is emitted.
const TOTAL_DELAY_WARN_SECS: f64 = 30.0;
const UPSTREAM_CAUSE_SECS: f64 = 25.0;
const INTERNAL_CAUSE_SECS: f64 = 3.0;
const NETWORK_CAUSE_SECS: f64 = 3.0;

/// One outbound send for an admitted (device, destination) pair. Owned by
/// exactly one worker.
#[derive(Debug, Clone)]
pub struct DispatchTask {
    pub serial: Option<String>,
    pub token: String,
    pub label: String,
    pub latitude: f64,
    pub longitude: f64,
    pub producer_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// Per-stage latency of one completed send, in seconds, floored at zero to
/// absorb clock skew between the producer and this host.
#[derive(Debug, Clone, Copy)]
pub struct DelayBreakdown {
    pub upstream: f64,
    pub internal: f64,
    pub network: f64,
    pub total: f64,
}

impl DelayBreakdown {
    pub fn compute(
        producer_time: DateTime<Utc>,
        received_at: DateTime<Utc>,
        worker_start: DateTime<Utc>,
        worker_end: DateTime<Utc>,
        network: Duration,
    ) -> Self {
        let secs = |from: DateTime<Utc>, to: DateTime<Utc>| -> f64 {
            (to.signed_duration_since(from).num_milliseconds() as f64 / 1000.0).max(0.0)
        };
        Self {
            upstream: secs(producer_time, received_at),
            internal: secs(received_at, worker_start),
            network: network.as_secs_f64(),
            total: secs(producer_time, worker_end),
        }
    }

    /// Heuristic attribution of excess end-to-end latency. Returns `None`
    /// while the total is within the acceptable window.
    pub fn classify(&self) -> Option<RootCause> {
        if self.total <= TOTAL_DELAY_WARN_SECS {
            return None;
        }
        Some(if self.upstream > UPSTREAM_CAUSE_SECS {
            RootCause::UpstreamSource
        } else if self.internal > INTERNAL_CAUSE_SECS {
            RootCause::InternalQueueing
        } else if self.network > NETWORK_CAUSE_SECS {
            RootCause::SinkNetwork
        } else {
            RootCause::Mixed
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootCause {
    UpstreamSource,
    InternalQueueing,
    SinkNetwork,
    Mixed,
}

impl fmt::Display for RootCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RootCause::UpstreamSource => "upstream source",
            RootCause::InternalQueueing => "internal queueing",
            RootCause::SinkNetwork => "sink/network",
            RootCause::Mixed => "mixed/unknown",
        };
        f.write_str(s)
    }
}

/// Bounded pool of workers draining a shared task queue. `submit` never
/// blocks; a failed or timed-out send is diagnosed and dropped, since the
/// next periodic report supersedes it.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<DispatchTask>,
}

impl Dispatcher {
    pub fn spawn(sink: Arc<dyn PositionSink>, workers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let rx = Arc::new(Mutex::new(rx));
        for worker_id in 0..workers {
            tokio::spawn(worker_loop(worker_id, Arc::clone(&rx), Arc::clone(&sink)));
        }
        Self { tx }
    }

    pub fn submit(&self, task: DispatchTask) {
        if self.tx.send(task).is_err() {
            error!("dispatch queue closed, dropping task");
        }
    }
}

async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<DispatchTask>>>,
    sink: Arc<dyn PositionSink>,
) {
    loop {
        let task = rx.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };
        run_task(worker_id, sink.as_ref(), task).await;
    }
}

async fn run_task(worker_id: usize, sink: &dyn PositionSink, task: DispatchTask) {
    let worker_start = Utc::now();
    let result = sink
        .report(&task.token, &task.label, task.latitude, task.longitude)
        .await;
    let worker_end = Utc::now();

    let network = match &result {
        Ok(measured) => *measured,
        Err(_) => (worker_end - worker_start).to_std().unwrap_or_default(),
    };
    let delay = DelayBreakdown::compute(
        task.producer_time,
        task.received_at,
        worker_start,
        worker_end,
        network,
    );

    match result {
        Ok(_) => {
            info!(
                worker_id,
                label = %task.label,
                serial = task.serial.as_deref().unwrap_or("NO_SN"),
                upstream = delay.upstream,
                internal = delay.internal,
                network = delay.network,
                total = delay.total,
                "position report delivered"
            );
            if let Some(cause) = delay.classify() {
                warn!(
                    label = %task.label,
                    total = delay.total,
                    upstream = delay.upstream,
                    internal = delay.internal,
                    network = delay.network,
                    %cause,
                    "delayed position report"
                );
            }
        }
        Err(e) => {
            warn!(
                worker_id,
                label = %task.label,
                serial = task.serial.as_deref().unwrap_or("NO_SN"),
                error = %e,
                network = delay.network,
                "position report dropped"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{RelayError, Result};
    use crate::sink::PositionSink;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn breakdown(upstream: f64, internal: f64, network: f64) -> DelayBreakdown {
        let t0 = Utc::now();
        let received = t0 + ChronoDuration::milliseconds((upstream * 1000.0) as i64);
        let start = received + ChronoDuration::milliseconds((internal * 1000.0) as i64);
        let end = start + ChronoDuration::milliseconds((network * 1000.0) as i64);
        DelayBreakdown::compute(t0, received, start, end, Duration::from_secs_f64(network))
    }

    #[test]
    fn stale_producer_classifies_as_upstream() {
        // Producer timestamp 40s before completion, network call 0.5s.
        let d = breakdown(38.0, 1.5, 0.5);
        assert!(d.total > 30.0);
        assert_eq!(d.classify(), Some(RootCause::UpstreamSource));
    }

    #[test]
    fn queue_backlog_classifies_as_internal() {
        let d = breakdown(10.0, 25.0, 0.5);
        assert_eq!(d.classify(), Some(RootCause::InternalQueueing));
    }

    #[test]
    fn slow_sink_classifies_as_network() {
        let d = breakdown(20.0, 1.0, 12.0);
        assert_eq!(d.classify(), Some(RootCause::SinkNetwork));
    }

    #[test]
    fn spread_out_delay_is_mixed() {
        let d = breakdown(24.9, 2.95, 2.95);
        assert_eq!(d.classify(), Some(RootCause::Mixed));
    }

    #[test]
    fn acceptable_delay_is_not_classified() {
        let d = breakdown(5.0, 1.0, 0.5);
        assert_eq!(d.classify(), None);
    }

    #[test]
    fn clock_skew_floors_at_zero() {
        let t0 = Utc::now();
        // Producer clock ahead of ours: receipt appears before production.
        let d = DelayBreakdown::compute(
            t0,
            t0 - ChronoDuration::seconds(3),
            t0 - ChronoDuration::seconds(2),
            t0 - ChronoDuration::seconds(1),
            Duration::from_millis(100),
        );
        assert_eq!(d.upstream, 0.0);
        assert_eq!(d.total, 0.0);
    }

    struct CountingSink {
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl PositionSink for CountingSink {
        async fn report(&self, _token: &str, _label: &str, _lat: f64, _lon: f64) -> Result<Duration> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(RelayError::Dispatch("boom".to_string()));
            }
            Ok(Duration::from_millis(1))
        }
    }

    fn task(label: &str) -> DispatchTask {
        let now = Utc::now();
        DispatchTask {
            serial: Some("SN1".to_string()),
            token: "tok-A".to_string(),
            label: label.to_string(),
            latitude: 31.77,
            longitude: 35.21,
            producer_time: now,
            received_at: now,
        }
    }

    #[tokio::test]
    async fn workers_drain_the_queue() {
        let sink = Arc::new(CountingSink {
            calls: AtomicUsize::new(0),
            fail_first: false,
        });
        let dispatcher = Dispatcher::spawn(sink.clone(), 3);
        for i in 0..5 {
            dispatcher.submit(task(&format!("Drone{i}")));
        }

        for _ in 0..50 {
            if sink.calls.load(Ordering::SeqCst) == 5 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue not drained");
    }

    #[tokio::test]
    async fn a_failed_send_does_not_stop_the_pool() {
        let sink = Arc::new(CountingSink {
            calls: AtomicUsize::new(0),
            fail_first: true,
        });
        let dispatcher = Dispatcher::spawn(sink.clone(), 1);
        dispatcher.submit(task("Drone1"));
        dispatcher.submit(task("Drone2"));

        for _ in 0..50 {
            if sink.calls.load(Ordering::SeqCst) == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("pool stalled after failure");
    }
}
