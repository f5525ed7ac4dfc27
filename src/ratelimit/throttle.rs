//! Request admission: key derivation, a rate limiter, and the rejection
//! payload handed back to callers that are turned away.

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

use super::key::{KeyDeriver, RequestMeta};
use super::limiter::{Decision, RateLimiter};
use super::rate::RateSpec;
use crate::cache::{spawn_sweeper, AgingCache, Clock, SweepPolicy, SweeperHandle, SystemClock};
use crate::error::Result;

/// Status code carried in rejection bodies.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Builds the rejection body from the wait in seconds.
pub type Responder = Arc<dyn Fn(f64) -> Value + Send + Sync>;

/// Default rejection body:
/// `{"code": 429, "msg": "Too many requests, take a break ^_^ (5s)"}`.
pub fn default_rejection_body(wait_secs: f64) -> Value {
    message_body("Too many requests, take a break ^_^ ({wait}s)", wait_secs)
}

/// Rejection body with `{wait}` in `template` replaced by the whole
/// seconds to wait, rounded up.
pub fn message_body(template: &str, wait_secs: f64) -> Value {
    let wait = wait_secs.max(0.0).ceil() as u64;
    json!({
        "code": TOO_MANY_REQUESTS,
        "msg": template.replace("{wait}", &wait.to_string()),
    })
}

/// A request that was turned away.
#[derive(Debug, Clone, PartialEq, Serialize, Error)]
#[error("too many requests, retry after {:.3}s", .retry_after.as_secs_f64())]
pub struct Rejection {
    /// Time until the caller's window resets
    #[serde(rename = "retry_after_secs", serialize_with = "as_secs_f64")]
    pub retry_after: Duration,
    /// Response payload for the caller
    pub body: Value,
}

fn as_secs_f64<S: serde::Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

/// One configured limiter in a request pipeline.
///
/// Owns its counter cache and, unless disabled, the background task that
/// sweeps it.
pub struct Throttle {
    name: String,
    limiter: RateLimiter,
    deriver: KeyDeriver,
    responder: Responder,
    sweeper: Option<SweeperHandle>,
}

impl Throttle {
    /// Start building a throttle for `spec`.
    pub fn builder(spec: RateSpec) -> ThrottleBuilder {
        ThrottleBuilder::new(spec)
    }

    /// Name used in logs and lookups.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// The configured key strategy.
    pub fn key_deriver(&self) -> &KeyDeriver {
        &self.deriver
    }

    /// Whether a background sweeper is attached.
    pub fn has_sweeper(&self) -> bool {
        self.sweeper.is_some()
    }

    /// Decide whether the request described by `meta` may proceed.
    pub fn decide(&self, meta: &RequestMeta) -> Decision {
        let key = self.deriver.derive(meta);
        self.limiter.check(&key)
    }

    /// Admit the request or produce the rejection to send back.
    pub fn check(&self, meta: &RequestMeta) -> std::result::Result<(), Rejection> {
        let decision = self.decide(meta);
        if decision.is_allowed() {
            return Ok(());
        }

        debug!(
            throttle = %self.name,
            retry_after_ms = decision.retry_after().as_millis() as u64,
            "Request throttled"
        );
        Err(Rejection {
            retry_after: decision.retry_after(),
            body: (self.responder)(decision.retry_after_secs()),
        })
    }

    /// Stop the sweeper, if any, and wait for it to exit.
    pub async fn shutdown(mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.shutdown().await;
        }
        info!(throttle = %self.name, "Throttle stopped");
    }
}

impl std::fmt::Debug for Throttle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Throttle")
            .field("name", &self.name)
            .field("limiter", &self.limiter)
            .field("deriver", &self.deriver)
            .field("sweeper", &self.sweeper.is_some())
            .finish()
    }
}

/// Builder for [`Throttle`].
pub struct ThrottleBuilder {
    spec: RateSpec,
    name: String,
    deriver: KeyDeriver,
    responder: Responder,
    clock: Arc<dyn Clock>,
    sweep: Option<SweepPolicy>,
}

impl ThrottleBuilder {
    fn new(spec: RateSpec) -> Self {
        Self {
            spec,
            name: "default".to_string(),
            deriver: KeyDeriver::IpAndUserAgent,
            responder: Arc::new(default_rejection_body),
            clock: Arc::new(SystemClock::new()),
            sweep: Some(SweepPolicy::default()),
        }
    }

    /// Set the throttle name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the key strategy. Defaults to client address plus user agent.
    pub fn key(mut self, deriver: KeyDeriver) -> Self {
        self.deriver = deriver;
        self
    }

    /// Replace the rejection body builder.
    pub fn respond_with<F>(mut self, responder: F) -> Self
    where
        F: Fn(f64) -> Value + Send + Sync + 'static,
    {
        self.responder = Arc::new(responder);
        self
    }

    /// Use a message template for the rejection body. See [`message_body`].
    pub fn message(self, template: impl Into<String>) -> Self {
        let template = template.into();
        self.respond_with(move |wait| message_body(&template, wait))
    }

    /// Drive expiry from `clock` instead of the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sweep the cache with `policy`.
    pub fn sweep(mut self, policy: SweepPolicy) -> Self {
        self.sweep = Some(policy);
        self
    }

    /// Rely on lazy expiry alone.
    pub fn without_sweeper(mut self) -> Self {
        self.sweep = None;
        self
    }

    /// Build the throttle, starting its sweeper.
    ///
    /// With a sweeper configured this must run inside a Tokio runtime.
    pub fn build(self) -> Result<Throttle> {
        let cache: Arc<AgingCache<u64>> = Arc::new(AgingCache::with_clock(self.clock));
        let sweeper = match self.sweep {
            Some(policy) => Some(spawn_sweeper(&cache, policy)?),
            None => None,
        };

        info!(
            throttle = %self.name,
            rate = %self.spec,
            key = ?self.deriver,
            "Throttle initialized"
        );

        Ok(Throttle {
            name: self.name,
            limiter: RateLimiter::with_cache(cache, self.spec),
            deriver: self.deriver,
            responder: self.responder,
            sweeper,
        })
    }
}
