use crate::db::RegistrySource;
use crate::error::{RelayError, Result};
use crate::models::registration::{Destination, RegistrationRow};
use crate::notify::{Notifier, NotifyEvent};
use crate::transport::Transport;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// Serials newly present relative to the previous snapshot. These still
    /// need a transport subscription.
    pub added: Vec<String>,
    /// Serials carried over from the previous snapshot.
    pub retained: usize,
    /// Rows that made it into the live map, after dedup and conflict
    /// dropping. Only these may trigger registration side effects.
    pub kept: Vec<RegistrationRow>,
}

/// Live device -> destinations mapping.
///
/// The map is replaced wholesale per reconciliation behind an atomically
/// swapped snapshot, so concurrent lookups see either the old or the new map,
/// never a partial state. The seen-set grows monotonically and gates one-time
/// registration side effects.
pub struct Registry {
    map: RwLock<Arc<HashMap<String, Vec<Destination>>>>,
    seen: Mutex<HashSet<(String, String)>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(Arc::new(HashMap::new())),
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Builds a fresh map from the snapshot rows and swaps it in.
    ///
    /// Duplicate (serial, token) rows keep the last occurrence with a warning.
    /// A row whose (token, label) pair is already claimed by a different
    /// serial is dropped with a warning; the pass itself continues. Serials
    /// absent from the new snapshot drop out of the map, but any transport
    /// subscription already established for them stays live (deliberate:
    /// a device must not lose its feed mid-mission because a source row
    /// expired).
    pub fn reconcile(&self, rows: &[RegistrationRow]) -> ReconcileOutcome {
        // Keep the last occurrence of each (serial, token), preserving the
        // position of that last occurrence.
        let mut kept: HashSet<(String, String)> = HashSet::new();
        let mut deduped: Vec<RegistrationRow> = Vec::with_capacity(rows.len());
        for row in rows.iter().rev() {
            let key = (row.serial.clone(), row.token.clone());
            if kept.insert(key) {
                deduped.push(row.clone());
            } else {
                warn!(
                    serial = %row.serial,
                    token = %row.token,
                    "duplicate registration rows, keeping the last"
                );
            }
        }
        deduped.reverse();

        let mut owner: HashMap<(String, String), String> = HashMap::new();
        let mut new_map: HashMap<String, Vec<Destination>> = HashMap::new();
        let mut outcome = ReconcileOutcome::default();
        for row in deduped {
            let binding = (row.token.clone(), row.label.clone());
            match owner.get(&binding) {
                Some(existing) if *existing != row.serial => {
                    let err = RelayError::RegistryConflict {
                        token: row.token.clone(),
                        label: row.label.clone(),
                        existing: existing.clone(),
                    };
                    warn!(serial = %row.serial, error = %err, "dropping conflicting row");
                    continue;
                }
                _ => {
                    owner.insert(binding, row.serial.clone());
                }
            }
            outcome.kept.push(row.clone());
            new_map.entry(row.serial).or_default().push(Destination {
                token: row.token,
                label: row.label,
            });
        }

        let mut guard = self.map.write().expect("registry lock poisoned");
        for serial in new_map.keys() {
            if guard.contains_key(serial) {
                outcome.retained += 1;
            } else {
                outcome.added.push(serial.clone());
            }
        }
        *guard = Arc::new(new_map);
        outcome
    }

    /// Destinations currently bound to a device, from the live snapshot.
    pub fn lookup(&self, serial: &str) -> Option<Vec<Destination>> {
        let snapshot = self.map.read().expect("registry lock poisoned").clone();
        snapshot.get(serial).cloned()
    }

    pub fn device_count(&self) -> usize {
        self.map.read().expect("registry lock poisoned").len()
    }

    /// True exactly once per (serial, token) pair over the process lifetime.
    /// Check and insert are a single atomic step.
    pub fn first_sighting(&self, serial: &str, token: &str) -> bool {
        self.seen
            .lock()
            .expect("seen-set lock poisoned")
            .insert((serial.to_string(), token.to_string()))
    }
}

/// One fetch-and-reconcile pass. On the initial load, first sightings are
/// recorded but not announced.
pub async fn reconcile_once(
    source: &dyn RegistrySource,
    registry: &Registry,
    transport: &dyn Transport,
    notifier: &dyn Notifier,
    initial_load: bool,
) -> Result<()> {
    let rows = source.fetch_active().await?;
    let outcome = registry.reconcile(&rows);

    // Only rows that entered the live map count as registrations; a dropped
    // conflict row must stay eligible for announcement once resolved.
    for row in &outcome.kept {
        if registry.first_sighting(&row.serial, &row.token) && !initial_load {
            info!(serial = %row.serial, token = %row.token, "new registration detected");
            notifier.notify(NotifyEvent::Registration {
                serial: row.serial.clone(),
                token: row.token.clone(),
            });
        }
    }

    for serial in &outcome.added {
        transport.subscribe(serial);
    }

    info!(
        rows = rows.len(),
        added = outcome.added.len(),
        retained = outcome.retained,
        "registry reconciled"
    );
    Ok(())
}

/// Periodic reconciliation against the external source. A failed fetch skips
/// the cycle; the previous snapshot stays authoritative.
pub async fn run_reconciler(
    source: Arc<dyn RegistrySource>,
    registry: Arc<Registry>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    // The initial load already happened at startup.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) =
            reconcile_once(source.as_ref(), registry.as_ref(), transport.as_ref(), notifier.as_ref(), false)
                .await
        {
            warn!(error = %e, "reconciliation cycle skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn row(serial: &str, label: &str, token: &str) -> RegistrationRow {
        RegistrationRow {
            serial: serial.to_string(),
            label: label.to_string(),
            token: token.to_string(),
            email: None,
        }
    }

    fn dest(token: &str, label: &str) -> Destination {
        Destination {
            token: token.to_string(),
            label: label.to_string(),
        }
    }

    #[test]
    fn reconcile_builds_lookup() {
        let registry = Registry::new();
        let outcome = registry.reconcile(&[
            row("SN1", "Drone1", "tok-A"),
            row("SN1", "Drone1", "tok-B"),
            row("SN2", "Drone2", "tok-A"),
        ]);

        assert_eq!(outcome.retained, 0);
        let mut added = outcome.added;
        added.sort();
        assert_eq!(added, vec!["SN1", "SN2"]);
        assert_eq!(
            registry.lookup("SN1").unwrap(),
            vec![dest("tok-A", "Drone1"), dest("tok-B", "Drone1")]
        );
        assert_eq!(registry.lookup("SN2").unwrap(), vec![dest("tok-A", "Drone2")]);
        assert!(registry.lookup("SN3").is_none());
    }

    #[test]
    fn duplicate_rows_keep_the_last() {
        let registry = Registry::new();
        registry.reconcile(&[
            row("SN1", "Drone1", "tok-A"),
            row("SN1", "Drone1-renamed", "tok-A"),
        ]);
        assert_eq!(
            registry.lookup("SN1").unwrap(),
            vec![dest("tok-A", "Drone1-renamed")]
        );
    }

    #[test]
    fn conflicting_label_row_is_dropped() {
        let registry = Registry::new();
        registry.reconcile(&[
            row("SN1", "Drone1", "tok-A"),
            row("SN2", "Drone1", "tok-A"),
        ]);
        assert_eq!(registry.lookup("SN1").unwrap(), vec![dest("tok-A", "Drone1")]);
        assert!(registry.lookup("SN2").is_none());
    }

    #[test]
    fn repeated_reconcile_adds_nothing() {
        let registry = Registry::new();
        let rows = [row("SN1", "Drone1", "tok-A")];
        let first = registry.reconcile(&rows);
        assert_eq!(first.added, vec!["SN1"]);

        let second = registry.reconcile(&rows);
        assert!(second.added.is_empty());
        assert_eq!(second.retained, 1);
    }

    #[test]
    fn shrink_drops_mapping_but_keeps_seen_set() {
        let registry = Registry::new();
        registry.reconcile(&[row("SN1", "Drone1", "tok-A"), row("SN2", "Drone2", "tok-B")]);
        assert!(registry.first_sighting("SN1", "tok-A"));

        registry.reconcile(&[row("SN2", "Drone2", "tok-B")]);
        assert!(registry.lookup("SN1").is_none());
        // A re-appearing device is not announced again.
        assert!(!registry.first_sighting("SN1", "tok-A"));
    }

    #[test]
    fn first_sighting_is_exactly_once() {
        let registry = Registry::new();
        assert!(registry.first_sighting("SN1", "tok-A"));
        assert!(!registry.first_sighting("SN1", "tok-A"));
        assert!(registry.first_sighting("SN1", "tok-B"));
    }

    struct VecSource(Vec<RegistrationRow>);

    #[async_trait]
    impl RegistrySource for VecSource {
        async fn fetch_active(&self) -> crate::error::Result<Vec<RegistrationRow>> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        subscribed: Mutex<Vec<String>>,
    }

    impl Transport for RecordingTransport {
        fn subscribe(&self, serial: &str) {
            self.subscribed.lock().unwrap().push(serial.to_string());
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<NotifyEvent>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, event: NotifyEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn reconcile_once_is_idempotent() {
        let source = VecSource(vec![row("SN1", "Drone1", "tok-A")]);
        let registry = Registry::new();
        let transport = RecordingTransport::default();
        let notifier = RecordingNotifier::default();

        reconcile_once(&source, &registry, &transport, &notifier, false)
            .await
            .unwrap();
        reconcile_once(&source, &registry, &transport, &notifier, false)
            .await
            .unwrap();

        assert_eq!(*transport.subscribed.lock().unwrap(), vec!["SN1"]);
        assert_eq!(notifier.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropped_conflict_row_is_not_announced() {
        let registry = Registry::new();
        let transport = RecordingTransport::default();
        let notifier = RecordingNotifier::default();

        // SN2 reuses SN1's label under the same token and gets dropped.
        let source = VecSource(vec![
            row("SN1", "Drone1", "tok-A"),
            row("SN2", "Drone1", "tok-A"),
        ]);
        reconcile_once(&source, &registry, &transport, &notifier, false)
            .await
            .unwrap();

        assert!(registry.lookup("SN2").is_none());
        {
            let events = notifier.events.lock().unwrap();
            assert_eq!(events.len(), 1);
            assert!(
                matches!(&events[0], NotifyEvent::Registration { serial, .. } if serial == "SN1")
            );
        }

        // Once the operator resolves the conflict, SN2 is announced.
        let fixed = VecSource(vec![
            row("SN1", "Drone1", "tok-A"),
            row("SN2", "Drone2", "tok-A"),
        ]);
        reconcile_once(&fixed, &registry, &transport, &notifier, false)
            .await
            .unwrap();

        assert!(registry.lookup("SN2").is_some());
        let events = notifier.events.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(
            matches!(&events[1], NotifyEvent::Registration { serial, .. } if serial == "SN2")
        );
    }

    #[tokio::test]
    async fn initial_load_suppresses_announcements() {
        let source = VecSource(vec![row("SN1", "Drone1", "tok-A")]);
        let registry = Registry::new();
        let transport = RecordingTransport::default();
        let notifier = RecordingNotifier::default();

        reconcile_once(&source, &registry, &transport, &notifier, true)
            .await
            .unwrap();

        assert_eq!(*transport.subscribed.lock().unwrap(), vec!["SN1"]);
        assert!(notifier.events.lock().unwrap().is_empty());
        // Still counts as seen afterwards.
        assert!(!registry.first_sighting("SN1", "tok-A"));
    }
}
