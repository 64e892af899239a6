//! Rate limiting algorithms and the limiters that drive them.
//!
//! Each algorithm module exposes a `check` function taking a [`Store`], a
//! [`CallerKey`], its parameters and the current time. The functions are
//! stateless; they go through the store for everything.
//!
//! [`Store`]: crate::store::Store

mod algorithm;
mod decision;
mod key;
mod limiter;

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_counter;
pub mod sliding_log;
pub mod token_bucket;

#[cfg(test)]
mod testing;

pub use algorithm::{Algorithm, LimiterError};
pub use decision::{Decision, Verdict};
pub use key::{AlgorithmTag, CallerKey};
pub use limiter::{Limiter, LimiterRegistry};
