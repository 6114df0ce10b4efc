//! Fast-path handling of raw client connections
//!
//! This module provides:
//! - [`FastPathResponder`] - Writes a minimal HTTP/1.1 response straight to a connection
//! - [`AdmissionLimits`] - Size checks that reject malformed work before any worker sees it
//! - [`RateLimiter`] - Per-client sliding-window request rate

mod admission;
mod rate_limit;
mod responder;

pub use admission::{AdmissionLimits, Rejection, RejectionReason, RequestSizes};
pub use rate_limit::{RateExceeded, RateLimit, RateLimiter};
pub use responder::{reason_phrase, FastPathResponder, RawResponse, ResponseError};
