//! Admission checks run before any worker is involved

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::rate_limit::{RateExceeded, RateLimit};
use crate::config::{ConfigError, EnvSource};

/// Which limit a request broke
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    TooManyRequests,
    UriTooLong,
    PayloadTooLarge,
    HeadersTooLarge,
}

impl RejectionReason {
    /// What `limit` and `actual` count
    pub fn unit(self) -> &'static str {
        match self {
            RejectionReason::TooManyRequests => "requests",
            _ => "bytes",
        }
    }
}

impl std::fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectionReason::TooManyRequests => write!(f, "too many requests"),
            RejectionReason::PayloadTooLarge => write!(f, "payload too large"),
            RejectionReason::UriTooLong => write!(f, "uri too long"),
            RejectionReason::HeadersTooLarge => write!(f, "headers too large"),
        }
    }
}

/// A request refused before reaching any worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{reason}: {actual} {} exceeds limit of {limit}", .reason.unit())]
pub struct Rejection {
    pub reason: RejectionReason,
    /// Status to answer with
    pub status: u16,
    pub limit: usize,
    pub actual: usize,
}

/// Encoded sizes of an inbound request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestSizes {
    pub uri: usize,
    pub headers: usize,
    pub payload: usize,
}

/// Limits enforced on the fast path
///
/// The per-client rate runs first (see [`Gateway`](crate::gateway::Gateway)),
/// then the size checks in a fixed order: URI, then payload, then headers.
/// The first breached limit decides the status.
///
/// # Example
///
/// ```
/// use switchyard_dispatch::fastpath::{AdmissionLimits, RejectionReason, RequestSizes};
///
/// let limits = AdmissionLimits::default()
///     .with_max_headers_size(64)
///     .with_headers_status(432);
///
/// let rejection = limits
///     .check(RequestSizes { uri: 10, headers: 65, payload: 0 })
///     .unwrap_err();
/// assert_eq!(rejection.reason, RejectionReason::HeadersTooLarge);
/// assert_eq!(rejection.status, 432);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionLimits {
    /// Maximum request target length in bytes
    pub max_uri_length: usize,
    /// Maximum combined header bytes (names, values and separators)
    pub max_headers_size: usize,
    /// Maximum body size in bytes
    pub max_payload_size: usize,
    pub uri_status: u16,
    pub headers_status: u16,
    pub payload_status: u16,
    /// Per-client request rate; unlimited when unset
    #[serde(default)]
    pub rate_limit: Option<RateLimit>,
    #[serde(default = "default_rate_status")]
    pub rate_status: u16,
}

fn default_rate_status() -> u16 {
    429
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            max_uri_length: 2048,
            max_headers_size: 8 * 1024,
            max_payload_size: 1024 * 1024,
            uri_status: 414,
            headers_status: 431,
            payload_status: 413,
            rate_limit: None,
            rate_status: default_rate_status(),
        }
    }
}

impl AdmissionLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load limits from `SWITCHYARD_MAX_*` and `SWITCHYARD_RATE_WINDOW_MS`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&EnvSource::new(|name| std::env::var(name).ok()))
    }

    pub(crate) fn from_source<F>(env: &EnvSource<F>) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut limits = Self::default();
        if let Some(max) = env.parse("MAX_URI_LENGTH")? {
            limits.max_uri_length = max;
        }
        if let Some(max) = env.parse("MAX_HEADERS_SIZE")? {
            limits.max_headers_size = max;
        }
        if let Some(max) = env.parse("MAX_PAYLOAD_SIZE")? {
            limits.max_payload_size = max;
        }
        if let Some(max) = env.parse("MAX_REQUESTS_PER_CLIENT")? {
            let window = env
                .millis("RATE_WINDOW_MS")?
                .unwrap_or(Duration::from_secs(60));
            limits.rate_limit = Some(RateLimit::per_minute(max).with_window(window));
        }
        Ok(limits)
    }

    pub fn with_max_uri_length(mut self, max: usize) -> Self {
        self.max_uri_length = max;
        self
    }

    pub fn with_max_headers_size(mut self, max: usize) -> Self {
        self.max_headers_size = max;
        self
    }

    pub fn with_max_payload_size(mut self, max: usize) -> Self {
        self.max_payload_size = max;
        self
    }

    pub fn with_uri_status(mut self, status: u16) -> Self {
        self.uri_status = status;
        self
    }

    pub fn with_headers_status(mut self, status: u16) -> Self {
        self.headers_status = status;
        self
    }

    pub fn with_payload_status(mut self, status: u16) -> Self {
        self.payload_status = status;
        self
    }

    pub fn with_rate_limit(mut self, limit: RateLimit) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    pub fn with_rate_status(mut self, status: u16) -> Self {
        self.rate_status = status;
        self
    }

    /// Turn a rate breach into a rejection
    pub fn rate_rejection(&self, exceeded: RateExceeded) -> Rejection {
        Rejection {
            reason: RejectionReason::TooManyRequests,
            status: self.rate_status,
            limit: exceeded.limit as usize,
            actual: exceeded.hits as usize,
        }
    }

    /// Accept or reject a request by its sizes
    pub fn check(&self, sizes: RequestSizes) -> Result<(), Rejection> {
        let checks = [
            (
                RejectionReason::UriTooLong,
                self.uri_status,
                self.max_uri_length,
                sizes.uri,
            ),
            (
                RejectionReason::PayloadTooLarge,
                self.payload_status,
                self.max_payload_size,
                sizes.payload,
            ),
            (
                RejectionReason::HeadersTooLarge,
                self.headers_status,
                self.max_headers_size,
                sizes.headers,
            ),
        ];

        for (reason, status, limit, actual) in checks {
            if actual > limit {
                return Err(Rejection {
                    reason,
                    status,
                    limit,
                    actual,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(uri: usize, headers: usize, payload: usize) -> RequestSizes {
        RequestSizes {
            uri,
            headers,
            payload,
        }
    }

    #[test]
    fn test_within_limits_is_admitted() {
        let limits = AdmissionLimits::default();
        assert!(limits.check(sizes(2048, 8192, 1024 * 1024)).is_ok());
    }

    #[test]
    fn test_uri_rejection() {
        let limits = AdmissionLimits::default().with_max_uri_length(16);

        let rejection = limits.check(sizes(17, 0, 0)).unwrap_err();
        assert_eq!(
            rejection,
            Rejection {
                reason: RejectionReason::UriTooLong,
                status: 414,
                limit: 16,
                actual: 17,
            }
        );
    }

    #[test]
    fn test_uri_checked_before_payload_and_headers() {
        let limits = AdmissionLimits::default()
            .with_max_uri_length(1)
            .with_max_headers_size(1)
            .with_max_payload_size(1);

        let rejection = limits.check(sizes(5, 5, 5)).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::UriTooLong);
        assert_eq!(rejection.status, 414);

        let rejection = limits.check(sizes(0, 5, 5)).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::PayloadTooLarge);

        let rejection = limits.check(sizes(0, 5, 0)).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::HeadersTooLarge);
    }

    #[test]
    fn test_rate_rejection_uses_rate_status() {
        let limits = AdmissionLimits::default().with_rate_status(503);

        let rejection = limits.rate_rejection(RateExceeded { hits: 7, limit: 6 });
        assert_eq!(rejection.status, 503);
        assert_eq!(rejection.reason, RejectionReason::TooManyRequests);
        assert_eq!(
            rejection.to_string(),
            "too many requests: 7 requests exceeds limit of 6"
        );
    }

    #[test]
    fn test_rate_limit_from_environment() {
        let env = EnvSource::new(|name: &str| match name {
            "SWITCHYARD_MAX_REQUESTS_PER_CLIENT" => Some("120".to_string()),
            "SWITCHYARD_RATE_WINDOW_MS" => Some("30000".to_string()),
            _ => None,
        });

        let limits = AdmissionLimits::from_source(&env).unwrap();
        assert_eq!(
            limits.rate_limit,
            Some(RateLimit::per_minute(120).with_window(Duration::from_secs(30)))
        );
        assert_eq!(limits.rate_status, 429);
        assert_eq!(AdmissionLimits::default().rate_limit, None);
    }

    #[test]
    fn test_headers_status_is_configurable() {
        let limits = AdmissionLimits::default()
            .with_max_headers_size(10)
            .with_headers_status(432);

        let rejection = limits.check(sizes(1, 11, 0)).unwrap_err();
        assert_eq!(rejection.status, 432);
        assert_eq!(
            rejection.to_string(),
            "headers too large: 11 bytes exceeds limit of 10"
        );
    }

    #[test]
    fn test_invalid_environment_value() {
        let env = EnvSource::new(|name: &str| {
            (name == "SWITCHYARD_MAX_PAYLOAD_SIZE").then(|| "lots".to_string())
        });

        let err = AdmissionLimits::from_source(&env).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { ref var, .. } if var == "SWITCHYARD_MAX_PAYLOAD_SIZE"
        ));
    }
}
