//! Algorithm selection and parameter validation.

use std::time::Duration;

use thiserror::Error;

use super::key::AlgorithmTag;

/// Errors raised while configuring a limiter.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LimiterError {
    /// A limit, window, rate or burst was zero, negative or not finite.
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Two policies were registered under the same name.
    #[error("Duplicate policy: {0}")]
    DuplicatePolicy(String),
}

/// A rate limiting algorithm together with its static parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Algorithm {
    /// At most `limit` requests per epoch-aligned window.
    FixedWindow { limit: u64, window: Duration },
    /// Continuously refilled bucket of `burst` tokens at `rate` per second.
    TokenBucket { rate: f64, burst: u64 },
    /// Exact count of requests within the trailing window.
    SlidingWindowLog { limit: u64, window: Duration },
    /// Weighted blend of the current and previous fixed windows.
    SlidingWindowCounter { limit: u64, window: Duration },
    /// Queue of depth `burst` drained at `rate` per second.
    LeakyBucket { rate: f64, burst: u64 },
}

impl Algorithm {
    /// Reject parameters no algorithm can work with.
    pub fn validate(&self) -> Result<(), LimiterError> {
        match self {
            Algorithm::FixedWindow { limit, window }
            | Algorithm::SlidingWindowLog { limit, window }
            | Algorithm::SlidingWindowCounter { limit, window } => {
                if *limit == 0 {
                    return Err(invalid(self, "limit must be greater than 0"));
                }
                if window.is_zero() {
                    return Err(invalid(self, "window must be greater than 0"));
                }
                if window.as_nanos() > u64::MAX as u128 {
                    return Err(invalid(self, "window is too large"));
                }
            }
            Algorithm::TokenBucket { rate, burst } | Algorithm::LeakyBucket { rate, burst } => {
                if !rate.is_finite() || *rate <= 0.0 {
                    return Err(invalid(self, "rate must be a positive number"));
                }
                if *burst == 0 {
                    return Err(invalid(self, "burst must be greater than 0"));
                }
            }
        }
        Ok(())
    }

    /// The key namespace this algorithm writes under.
    pub fn tag(&self) -> AlgorithmTag {
        match self {
            Algorithm::FixedWindow { .. } => AlgorithmTag::FixedWindow,
            Algorithm::TokenBucket { .. } => AlgorithmTag::TokenBucket,
            Algorithm::SlidingWindowLog { .. } => AlgorithmTag::SlidingWindowLog,
            Algorithm::SlidingWindowCounter { .. } => AlgorithmTag::SlidingWindowCounter,
            Algorithm::LeakyBucket { .. } => AlgorithmTag::LeakyBucket,
        }
    }

    /// The quota reported alongside each decision.
    pub fn limit(&self) -> u64 {
        match self {
            Algorithm::FixedWindow { limit, .. }
            | Algorithm::SlidingWindowLog { limit, .. }
            | Algorithm::SlidingWindowCounter { limit, .. } => *limit,
            Algorithm::TokenBucket { burst, .. } | Algorithm::LeakyBucket { burst, .. } => *burst,
        }
    }
}

fn invalid(algorithm: &Algorithm, reason: &str) -> LimiterError {
    LimiterError::InvalidParameters(format!("{}: {}", algorithm.tag().name(), reason))
}

/// Window length in nanoseconds. Callers validate the window first.
pub(crate) fn window_nanos(window: Duration) -> u64 {
    window.as_nanos() as u64
}
