//! Retry discipline shared by every platform call.
//!
//! Platform operations return [`CallError`], which splits failures into the
//! ones worth repeating and the ones that are final. [`with_retry`] drives an
//! operation until it succeeds, fails fatally, or runs out of attempts.

use log::{debug, warn};
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use std::future::Future;
use std::ops::Range;
use std::time::Duration;
use thiserror::Error;

/// HTTP status codes that are always worth another attempt.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Upper bound on a server-supplied `Retry-After`.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("retryable failure (status {}): {message}", display_status(.status))]
    Retryable {
        status: Option<u16>,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("fatal failure (status {}): {message}", display_status(.status))]
    Fatal { status: Option<u16>, message: String },
}

fn display_status(status: &Option<u16>) -> String {
    status.map_or_else(|| "n/a".to_string(), |s| s.to_string())
}

impl CallError {
    pub fn fatal(message: impl Into<String>) -> Self {
        CallError::Fatal {
            status: None,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CallError::Retryable { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            CallError::Retryable { status, .. } | CallError::Fatal { status, .. } => *status,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            CallError::Retryable { retry_after, .. } => *retry_after,
            CallError::Fatal { .. } => None,
        }
    }
}

impl From<reqwest::Error> for CallError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        if err.is_timeout() || err.is_connect() {
            return CallError::Retryable {
                status,
                message: err.to_string(),
                retry_after: None,
            };
        }
        match status {
            Some(code) if RETRYABLE_STATUSES.contains(&code) => CallError::Retryable {
                status,
                message: err.to_string(),
                retry_after: None,
            },
            _ => CallError::Fatal {
                status,
                message: err.to_string(),
            },
        }
    }
}

/// Returns true when `body` carries one of the platform's rate-limit markers.
pub fn is_rate_limited(body: &str, markers: &[&str]) -> bool {
    markers.iter().any(|marker| body.contains(marker))
}

/// Classifies a finished HTTP exchange.
///
/// Returns `None` when the response is a success that carries no rate-limit
/// marker, and the matching [`CallError`] otherwise.
pub fn classify_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: &str,
    markers: &[&str],
) -> Option<CallError> {
    let code = status.as_u16();
    let rate_limited = is_rate_limited(body, markers);

    if status.is_success() && !rate_limited {
        return None;
    }

    let message = truncate(body, 300);
    if rate_limited || RETRYABLE_STATUSES.contains(&code) {
        Some(CallError::Retryable {
            status: Some(code),
            message,
            retry_after: parse_retry_after(headers),
        })
    } else {
        Some(CallError::Fatal {
            status: Some(code),
            message,
        })
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok())
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .map(|delay| delay.min(MAX_RETRY_AFTER))
}

fn truncate(body: &str, max_chars: usize) -> String {
    body.chars().take(max_chars).collect()
}

/// Decides how long to wait before the next attempt.
pub trait BackoffPolicy: Send + Sync {
    /// `attempt` is zero for the wait after the first failure.
    fn next_delay(&self, attempt: u32) -> Duration;

    /// Extra random delay added on top of a server-supplied `Retry-After`.
    fn jitter(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub cap: Duration,
    /// Seconds of uniform jitter added to every delay.
    pub jitter: Range<f64>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            jitter: 0.2..1.8,
        }
    }
}

impl ExponentialBackoff {
    /// A policy that never waits, for tests and dry runs.
    pub fn immediate() -> Self {
        Self {
            base: Duration::ZERO,
            cap: Duration::ZERO,
            jitter: 0.0..0.0,
        }
    }

    fn exponential(&self, attempt: u32) -> Duration {
        let factor = 2f64.powi(attempt.min(30) as i32);
        self.base.mul_f64(factor).min(self.cap)
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        self.exponential(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        if self.jitter.is_empty() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(rand::thread_rng().gen_range(self.jitter.clone()))
    }
}

/// Outcome of a retried operation plus the number of attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub result: Result<T, CallError>,
    pub attempts: u32,
}

/// Runs `operation` until it succeeds, fails fatally, or `max_retries` extra
/// attempts have been spent on retryable failures.
pub async fn with_retry<T, F, Fut>(
    policy: &dyn BackoffPolicy,
    max_retries: u32,
    operation_name: &str,
    mut operation: F,
) -> Attempted<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallError>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!("{} succeeded after {} retries", operation_name, attempt);
                }
                return Attempted {
                    result: Ok(value),
                    attempts: attempt + 1,
                };
            }
            Err(err) if err.is_retryable() && attempt < max_retries => {
                let delay = match err.retry_after() {
                    Some(after) => after + policy.jitter(),
                    None => policy.next_delay(attempt),
                };
                warn!(
                    "{} failed (attempt {}/{}): {}. Retrying in {:?}",
                    operation_name,
                    attempt + 1,
                    max_retries + 1,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Attempted {
                    result: Err(err),
                    attempts: attempt + 1,
                };
            }
        }
    }
}
