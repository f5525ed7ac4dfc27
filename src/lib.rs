//! Gatekeeper - in-process request admission control
//!
//! This crate decides, per request, whether a caller may proceed under a
//! fixed-window rate such as `16/3m`, and how long a rejected caller should
//! wait. Counters live in an expiring in-memory cache owned by each limiter;
//! nothing is shared between processes or kept across restarts.

pub mod cache;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use config::GatekeeperConfig;
pub use error::{GatekeeperError, Result};
pub use ratelimit::{Decision, KeyDeriver, RateLimiter, RateSpec, Registry, RequestMeta, Throttle};
