use crate::geofence::Geofence;
use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    pub registration_db_url: String,
    pub sink_base_url: String,
    pub sink_timeout: Duration,
    pub dispatch_workers: usize,
    pub min_send_interval: Duration,
    pub registry_poll_interval: Duration,
    pub geofence: Geofence,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub replay_dir: Option<String>,
    pub replay_use_real_timestamps: bool,
    pub replay_delay: Duration,
    pub replay_time_multiplier: f64,
    pub record_dir: Option<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let registration_db_url = env::var("REGISTRATION_DB_URL")
            .unwrap_or_else(|_| "sqlite://drone_registrations.db".to_string());

        let sink_base_url = env::var("SINK_BASE_URL")
            .unwrap_or_else(|_| "https://caltopo.com/api/v1/position/report".to_string());

        let geofence = Geofence::new(
            parse_or("GEOFENCE_LAT_MIN", 29.5)?,
            parse_or("GEOFENCE_LAT_MAX", 33.3)?,
            parse_or("GEOFENCE_LON_MIN", 34.3)?,
            parse_or("GEOFENCE_LON_MAX", 35.9)?,
            parse_or("GEOFENCE_BUFFER_KM", 20.0)?,
        );

        Ok(Self {
            registration_db_url,
            sink_base_url,
            sink_timeout: Duration::from_secs(parse_or("SINK_TIMEOUT_SECS", 3)?),
            dispatch_workers: parse_or("DISPATCH_WORKERS", 15)?,
            min_send_interval: Duration::from_secs(parse_or("MIN_SEND_INTERVAL_SECS", 5)?),
            registry_poll_interval: Duration::from_secs(parse_or("REGISTRY_POLL_SECS", 60)?),
            geofence,
            telegram_bot_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
            telegram_chat_id: env::var("TELEGRAM_CHAT_ID").ok(),
            replay_dir: env::var("REPLAY_DIR").ok(),
            replay_use_real_timestamps: parse_or("REPLAY_USE_REAL_TIMESTAMPS", false)?,
            replay_delay: Duration::from_secs_f64(parse_or("REPLAY_DELAY_SECS", 1.0)?),
            replay_time_multiplier: parse_or("REPLAY_TIME_MULTIPLIER", 1.0)?,
            record_dir: env::var("RECORD_DIR").ok(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replay_options_come_from_env() {
        env::set_var("REPLAY_USE_REAL_TIMESTAMPS", "true");
        env::set_var("REPLAY_DELAY_SECS", "0.5");
        env::set_var("REPLAY_TIME_MULTIPLIER", "2.0");

        let cfg = Config::from_env().unwrap();
        assert!(cfg.replay_use_real_timestamps);
        assert_eq!(cfg.replay_delay, Duration::from_millis(500));
        assert_eq!(cfg.replay_time_multiplier, 2.0);

        env::remove_var("REPLAY_USE_REAL_TIMESTAMPS");
        env::remove_var("REPLAY_DELAY_SECS");
        env::remove_var("REPLAY_TIME_MULTIPLIER");

        let cfg = Config::from_env().unwrap();
        assert!(!cfg.replay_use_real_timestamps);
        assert_eq!(cfg.replay_delay, Duration::from_secs(1));
        assert_eq!(cfg.replay_time_multiplier, 1.0);
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("{key} is not a valid value: {raw}")),
        Err(_) => Ok(default),
    }
}
