//! Bounded retry with exponential backoff for a single network call
//!
//! Every HTTP status >= 400 is treated as possibly transient. A 429 switches
//! the call into a sticky slow mode (an extra fixed delay before each later
//! attempt) and its `retry-after` header, given either as seconds or as an
//! HTTP date, replaces the computed backoff.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;
use tracing::{debug, warn};

use sortie_config::RetryConfig;

/// Terminal failure after the attempt budget is spent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    #[error("REQUEST FAILED AFTER {attempts} ATTEMPTS: HTTP {status}")]
    Status { status: u16, attempts: u32 },

    #[error("REQUEST FAILED AFTER {attempts} ATTEMPTS: {message}")]
    Network { message: String, attempts: u32 },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Status { attempts, .. } | RetryError::Network { attempts, .. } => *attempts,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            RetryError::Status { status, .. } => Some(*status),
            RetryError::Network { .. } => None,
        }
    }
}

/// Anything carrying an HTTP status and headers
pub trait StatusResponse {
    fn status_code(&self) -> u16;
    fn header_value(&self, name: &str) -> Option<String>;
}

impl StatusResponse for reqwest::Response {
    fn status_code(&self) -> u16 {
        self.status().as_u16()
    }

    fn header_value(&self, name: &str) -> Option<String> {
        self.headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

/// Successful response plus the bookkeeping of how it was obtained
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub value: T,
    pub attempts: u32,
    pub retries: u32,
    pub slow_mode_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub slow_mode_delay: Duration,
    /// Relative jitter applied to the exponential delay (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            slow_mode_delay: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            slow_mode_delay: Duration::from_millis(config.slow_mode_delay_ms),
            ..Default::default()
        }
    }
}

enum Failure {
    Status(u16),
    Network(String),
}

/// Spent budget, with the final response when the last attempt got one
struct Exhausted<R> {
    error: RetryError,
    last: Option<R>,
    slow_mode: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Exponential delay for the given zero-based attempt, jittered and capped
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = 2f64.powi(attempt.min(31) as i32);
        let factor = if self.jitter > 0.0 {
            rand::rng().random_range((1.0 - self.jitter)..=(1.0 + self.jitter))
        } else {
            1.0
        };
        let millis = self.base_delay.as_millis() as f64 * exp * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Run `op` until it yields a status below 400 or the budget is spent.
    /// `op` receives the zero-based attempt number.
    pub async fn execute<F, Fut, R, E>(&self, op: F) -> Result<RetryOutcome<R>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: StatusResponse,
        E: std::fmt::Display,
    {
        self.drive(op).await.map_err(|exhausted| exhausted.error)
    }

    /// Like [`execute`](Self::execute), but when every attempt was rejected
    /// the final rejected response is handed back so the caller can read its
    /// body. Only a budget that ended on a network error is an `Err`.
    pub async fn execute_keeping_last<F, Fut, R, E>(
        &self,
        op: F,
    ) -> Result<RetryOutcome<R>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: StatusResponse,
        E: std::fmt::Display,
    {
        match self.drive(op).await {
            Ok(outcome) => Ok(outcome),
            Err(Exhausted {
                error,
                last: Some(value),
                slow_mode,
            }) => Ok(RetryOutcome {
                value,
                attempts: error.attempts(),
                retries: error.attempts().saturating_sub(1),
                slow_mode_enabled: slow_mode,
            }),
            Err(exhausted) => Err(exhausted.error),
        }
    }

    async fn drive<F, Fut, R, E>(&self, mut op: F) -> Result<RetryOutcome<R>, Exhausted<R>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        R: StatusResponse,
        E: std::fmt::Display,
    {
        let attempts_allowed = self.max_retries.max(1);
        let mut slow_mode = false;
        let mut last_failure = Failure::Network("no attempt made".to_string());
        let mut last_response = None;

        for attempt in 0..attempts_allowed {
            let mut retry_after = None;

            match op(attempt).await {
                Ok(response) => {
                    let status = response.status_code();
                    if status < 400 {
                        debug!(attempt, status, "retry: request succeeded");
                        return Ok(RetryOutcome {
                            value: response,
                            attempts: attempt + 1,
                            retries: attempt,
                            slow_mode_enabled: slow_mode,
                        });
                    }

                    if status == 429 {
                        if !slow_mode {
                            warn!("◆ RATE LIMITED, SLOW MODE ENABLED");
                        }
                        slow_mode = true;
                        retry_after = response
                            .header_value("retry-after")
                            .and_then(|v| parse_retry_after(&v, Utc::now()));
                    }

                    warn!(attempt, status, "retry: request rejected");
                    last_failure = Failure::Status(status);
                    last_response = Some(response);
                }
                Err(e) => {
                    warn!(attempt, error = %e, "retry: network error");
                    last_failure = Failure::Network(e.to_string());
                    last_response = None;
                }
            }

            if attempt + 1 < attempts_allowed {
                let mut delay = retry_after
                    .map(|d| d.min(self.max_delay))
                    .unwrap_or_else(|| self.backoff(attempt));
                if slow_mode {
                    delay += self.slow_mode_delay;
                }
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retry: backing off");
                tokio::time::sleep(delay).await;
            }
        }

        let error = match last_failure {
            Failure::Status(status) => RetryError::Status {
                status,
                attempts: attempts_allowed,
            },
            Failure::Network(message) => RetryError::Network {
                message,
                attempts: attempts_allowed,
            },
        };
        Err(Exhausted {
            error,
            last: last_response,
            slow_mode,
        })
    }
}

/// Parse a `retry-after` value: delta seconds or an HTTP date
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }

    let date = DateTime::parse_from_rfc2822(value).ok()?;
    let wait = date.with_timezone(&Utc) - now;
    Some(wait.to_std().unwrap_or(Duration::ZERO))
}
