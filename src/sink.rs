use crate::error::{RelayError, Result};
use async_trait::async_trait;
use std::time::{Duration, Instant};
use tracing::debug;

/// Where position reports go. The real endpoint embeds the destination token
/// in the path and takes the label and coordinates as query parameters.
#[async_trait]
pub trait PositionSink: Send + Sync {
    /// Sends one report and returns the measured network duration.
    async fn report(&self, token: &str, label: &str, lat: f64, lon: f64) -> Result<Duration>;
}

/// CalTopo-style position report client with a bounded per-request timeout so
/// a slow sink cannot starve the dispatch pool.
pub struct CalTopoSink {
    http: reqwest::Client,
    base_url: String,
}

impl CalTopoSink {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl PositionSink for CalTopoSink {
    async fn report(&self, token: &str, label: &str, lat: f64, lon: f64) -> Result<Duration> {
        let url = format!("{}/{token}?id={label}&lat={lat}&lng={lon}", self.base_url);
        debug!(label, token_suffix = token_suffix(token), "sending position report");

        let start = Instant::now();
        let response = self.http.get(&url).send().await?;
        let elapsed = start.elapsed();

        if !response.status().is_success() {
            return Err(RelayError::Dispatch(format!(
                "sink returned status {} for {label}",
                response.status()
            )));
        }
        Ok(elapsed)
    }
}

/// Last four characters of an opaque token, for logging without exposing the
/// whole credential. Tokens come from outside, so the cut must respect char
/// boundaries.
fn token_suffix(token: &str) -> &str {
    match token.char_indices().rev().nth(3) {
        Some((idx, _)) => &token[idx..],
        None => token,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_suffix_takes_last_four_chars() {
        assert_eq!(token_suffix("abcdefg"), "defg");
        assert_eq!(token_suffix("abcd"), "abcd");
    }

    #[test]
    fn token_suffix_handles_short_tokens() {
        assert_eq!(token_suffix(""), "");
        assert_eq!(token_suffix("ab"), "ab");
    }

    #[test]
    fn token_suffix_respects_char_boundaries() {
        assert_eq!(token_suffix("дxxx"), "дxxx");
        assert_eq!(token_suffix("aдbcd"), "дbcd");
        assert_eq!(token_suffix("ддд"), "ддд");
    }
}
