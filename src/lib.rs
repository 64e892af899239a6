//! Tollgate - request admission control
//!
//! This crate decides, per request, whether a caller identity may proceed
//! under one of five rate limiting algorithms: fixed window, token bucket,
//! sliding window log, sliding window counter and leaky bucket. State lives
//! behind a [`store::Store`], either in this process or in Redis so that many
//! processes enforce one shared limit.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;
