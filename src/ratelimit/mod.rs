//! Rate limiting logic and state management.

mod key;
mod limiter;
mod rate;
mod registry;
mod throttle;

pub use key::{KeyDeriver, KeyFn, RequestMeta};
pub use limiter::{Decision, RateLimiter};
pub use rate::{RateSpec, WindowUnit, MAX_WINDOW};
pub use registry::Registry;
pub use throttle::{
    default_rejection_body, message_body, Rejection, Responder, Throttle, ThrottleBuilder,
    TOO_MANY_REQUESTS,
};
