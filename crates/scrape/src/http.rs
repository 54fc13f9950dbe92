//! Rate-limited HTTP fetching with retry. Transport errors and 5xx
//! responses are retried with jittered exponential backoff; 4xx
//! responses are terminal.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use nieuws_core::Error;

use crate::agents::random_user_agent;
use crate::limiter::HostRateLimiter;

const BACKOFF_BASE: Duration = Duration::from_secs(1);

pub struct FetchClient {
    client: reqwest::Client,
    limiter: Arc<HostRateLimiter>,
    attempts: u32,
}

impl FetchClient {
    pub fn new(
        limiter: Arc<HostRateLimiter>,
        timeout: Duration,
        attempts: u32,
    ) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| Error::Transient(format!("http client init: {e}")))?;
        Ok(Self { client, limiter, attempts: attempts.max(1) })
    }

    /// Fetch a URL body as text, pacing per host and rotating the user
    /// agent per attempt.
    pub async fn fetch_text(&self, url: &str) -> Result<String, Error> {
        let parsed = url::Url::parse(url)
            .map_err(|e| Error::InvalidInput(format!("bad url '{url}': {e}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| Error::InvalidInput(format!("url without host: {url}")))?
            .to_string();

        let mut last_err = Error::Transient("no attempt made".into());
        for attempt in 1..=self.attempts {
            self.limiter.wait(&host).await;

            match self.try_fetch(url).await {
                Ok(body) => return Ok(body),
                Err(err) if err.is_retryable() && attempt < self.attempts => {
                    let backoff = backoff_with_jitter(attempt);
                    debug!(
                        url,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Fetch failed — backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    last_err = err;
                }
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(url, attempts = self.attempts, error = %err, "Fetch retries exhausted");
                    return Err(err);
                }
            }
        }
        Err(last_err)
    }

    async fn try_fetch(&self, url: &str) -> Result<String, Error> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, random_user_agent())
            .send()
            .await
            .map_err(classify_reqwest)?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(Error::RateLimited(format!("{url}: 429")));
        }
        if status.is_server_error() {
            return Err(Error::Transient(format!("{url}: {status}")));
        }
        if status.is_client_error() {
            return Err(Error::Terminal(format!("{url}: {status}")));
        }

        response
            .text()
            .await
            .map_err(|e| Error::Transient(format!("{url}: body read: {e}")))
    }
}

/// Map a reqwest transport error onto the taxonomy. Timeouts, connect
/// and DNS failures are all transient.
pub fn classify_reqwest(err: reqwest::Error) -> Error {
    Error::Transient(err.to_string())
}

/// 1s, 2s, 4s... plus up to 250ms of jitter.
pub fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt.saturating_sub(1));
    let jitter = rand::thread_rng().gen_range(0..250);
    base + Duration::from_millis(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        assert!(backoff_with_jitter(1) >= Duration::from_secs(1));
        assert!(backoff_with_jitter(1) < Duration::from_millis(1250));
        assert!(backoff_with_jitter(2) >= Duration::from_secs(2));
        assert!(backoff_with_jitter(3) >= Duration::from_secs(4));
    }

    #[tokio::test]
    async fn rejects_invalid_urls_without_retrying() {
        let limiter = Arc::new(HostRateLimiter::new(Duration::ZERO));
        let client = FetchClient::new(limiter, Duration::from_secs(5), 3).unwrap();
        let err = client.fetch_text("niet-een-url").await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
