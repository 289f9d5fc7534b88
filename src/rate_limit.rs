use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Bucket used when a message carried no serial, so rate limiting still
/// applies per destination.
const NO_SERIAL: &str = "NO_SN";

/// Per-(device, destination) minimum-interval gate.
///
/// The decision and the timestamp recording happen under one lock, so two
/// racing dispatch attempts for the same key can never both be admitted
/// inside a single interval window. The map grows for the lifetime of the
/// process; acceptable at the expected device cardinality.
pub struct RateLimiter {
    min_interval: Duration,
    last_admitted: Mutex<HashMap<(String, String), DateTime<Utc>>>,
}

impl RateLimiter {
    pub fn new(min_interval: std::time::Duration) -> Self {
        Self {
            min_interval: Duration::from_std(min_interval).unwrap_or(Duration::seconds(5)),
            last_admitted: Mutex::new(HashMap::new()),
        }
    }

    /// Admits the first call per key, then one call per `min_interval`.
    /// Records `now` as the new last-admitted time in the same critical
    /// section as the check.
    pub fn admit(&self, serial: Option<&str>, token: &str, now: DateTime<Utc>) -> bool {
        let key = (
            serial.unwrap_or(NO_SERIAL).to_string(),
            token.to_string(),
        );

        let mut last = self.last_admitted.lock().expect("rate limiter lock poisoned");
        if let Some(prev) = last.get(&key) {
            if now.signed_duration_since(*prev) < self.min_interval {
                return false;
            }
        }
        last.insert(key, now);
        true
    }

    /// Seconds since the last admitted dispatch for this key, for skip logs.
    pub fn since_last(&self, serial: Option<&str>, token: &str, now: DateTime<Utc>) -> Option<f64> {
        let key = (
            serial.unwrap_or(NO_SERIAL).to_string(),
            token.to_string(),
        );
        let last = self.last_admitted.lock().expect("rate limiter lock poisoned");
        last.get(&key)
            .map(|prev| now.signed_duration_since(*prev).num_milliseconds() as f64 / 1000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_admits() {
        let limiter = RateLimiter::new(std::time::Duration::from_secs(5));
        assert!(limiter.admit(Some("SN1"), "tok-A", Utc::now()));
    }

    #[test]
    fn respects_min_interval() {
        let limiter = RateLimiter::new(std::time::Duration::from_secs(5));
        let t0 = Utc::now();

        assert!(limiter.admit(Some("SN1"), "tok-A", t0));
        assert!(!limiter.admit(Some("SN1"), "tok-A", t0 + Duration::milliseconds(2500)));
        assert!(limiter.admit(Some("SN1"), "tok-A", t0 + Duration::milliseconds(7500)));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(std::time::Duration::from_secs(5));
        let t0 = Utc::now();

        assert!(limiter.admit(Some("SN1"), "tok-A", t0));
        assert!(limiter.admit(Some("SN1"), "tok-B", t0));
        assert!(limiter.admit(Some("SN2"), "tok-A", t0));
    }

    #[test]
    fn unknown_serial_shares_one_bucket() {
        let limiter = RateLimiter::new(std::time::Duration::from_secs(5));
        let t0 = Utc::now();

        assert!(limiter.admit(None, "tok-A", t0));
        assert!(!limiter.admit(None, "tok-A", t0 + Duration::seconds(1)));
    }

    #[test]
    fn admission_resets_the_window() {
        let limiter = RateLimiter::new(std::time::Duration::from_secs(5));
        let t0 = Utc::now();

        assert!(limiter.admit(Some("SN1"), "tok-A", t0));
        // Denied attempts must not push the window forward.
        assert!(!limiter.admit(Some("SN1"), "tok-A", t0 + Duration::seconds(4)));
        assert!(limiter.admit(Some("SN1"), "tok-A", t0 + Duration::seconds(5)));
        assert!(!limiter.admit(Some("SN1"), "tok-A", t0 + Duration::seconds(9)));
    }
}
