//! Named throttles built from configuration.

use std::sync::Arc;
use tracing::info;

use super::key::{KeyDeriver, RequestMeta};
use super::throttle::{Rejection, Throttle};
use crate::cache::{Clock, SystemClock};
use crate::config::GatekeeperConfig;
use crate::error::{GatekeeperError, Result};

/// The configured throttles, in configuration order.
#[derive(Debug, Default)]
pub struct Registry {
    throttles: Vec<Throttle>,
}

impl Registry {
    /// Build every configured throttle, starting their sweepers.
    ///
    /// Fails on the first invalid limiter, so a bad configuration never
    /// gets as far as handling traffic. Must run inside a Tokio runtime.
    pub fn from_config(config: &GatekeeperConfig) -> Result<Self> {
        Self::from_config_with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Like [`Registry::from_config`], with every cache driven by `clock`.
    pub fn from_config_with_clock(config: &GatekeeperConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let policy = config.sweep_policy()?;

        let mut throttles = Vec::with_capacity(config.limiters.len());
        for limiter in &config.limiters {
            let mut builder = Throttle::builder(limiter.rate)
                .name(limiter.name.clone())
                .key(KeyDeriver::from(&limiter.key))
                .clock(clock.clone())
                .sweep(policy);
            if let Some(template) = &limiter.message {
                builder = builder.message(template.clone());
            }
            throttles.push(builder.build()?);
        }

        info!(limiters = throttles.len(), "Registry initialized");
        Ok(Self { throttles })
    }

    /// Look up a throttle by name.
    pub fn get(&self, name: &str) -> Option<&Throttle> {
        self.throttles.iter().find(|t| t.name() == name)
    }

    /// Look up a throttle by name, failing if it is not configured.
    pub fn require(&self, name: &str) -> Result<&Throttle> {
        self.get(name)
            .ok_or_else(|| GatekeeperError::Config(format!("no limiter named '{}'", name)))
    }

    /// Iterate throttles in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Throttle> {
        self.throttles.iter()
    }

    /// Number of throttles.
    pub fn len(&self) -> usize {
        self.throttles.len()
    }

    /// Check if no throttles are configured.
    pub fn is_empty(&self) -> bool {
        self.throttles.is_empty()
    }

    /// Run the request through every throttle in order, stopping at the
    /// first rejection. Throttles before the rejecting one have already
    /// counted the request.
    pub fn check(&self, meta: &RequestMeta) -> std::result::Result<(), Rejection> {
        for throttle in &self.throttles {
            throttle.check(meta)?;
        }
        Ok(())
    }

    /// Stop every sweeper.
    pub async fn shutdown(self) {
        for throttle in self.throttles {
            throttle.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MockClock;
    use std::time::Duration;

    const CONFIG: &str = r#"
limiters:
  - name: burst
    rate: 3/1s
    key: { strategy: ip }
  - name: sustained
    rate: 5/1m
    key: { strategy: ip }
    message: "Hourly budget spent, wait {wait}s"
"#;

    fn meta(ip: &str) -> RequestMeta {
        RequestMeta::new().with_header("X-Real-IP", ip)
    }

    #[tokio::test]
    async fn test_registry_from_config() {
        let config = GatekeeperConfig::from_yaml(CONFIG).unwrap();
        let registry = Registry::from_config(&config).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.get("burst").is_some());
        assert!(registry.get("missing").is_none());
        assert!(registry.require("missing").is_err());
        assert!(registry.iter().all(|t| t.has_sweeper()));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_check_runs_throttles_in_order() {
        let clock = MockClock::default();
        let config = GatekeeperConfig::from_yaml(CONFIG).unwrap();
        let registry = Registry::from_config_with_clock(&config, Arc::new(clock.clone())).unwrap();

        for _ in 0..3 {
            assert!(registry.check(&meta("10.0.0.1")).is_ok());
        }
        let burst = registry.check(&meta("10.0.0.1")).unwrap_err();
        assert_eq!(burst.retry_after, Duration::from_secs(1));

        clock.advance(Duration::from_secs(1));
        assert!(registry.check(&meta("10.0.0.1")).is_ok());
        assert!(registry.check(&meta("10.0.0.1")).is_ok());

        let sustained = registry.check(&meta("10.0.0.1")).unwrap_err();
        assert_eq!(sustained.retry_after, Duration::from_secs(59));
        assert_eq!(sustained.body["msg"], "Hourly budget spent, wait 59s");

        registry.shutdown().await;
    }

    #[test]
    fn test_registry_requires_runtime() {
        let config = GatekeeperConfig::from_yaml(CONFIG).unwrap();
        let err = Registry::from_config(&config).unwrap_err();
        assert!(matches!(err, GatekeeperError::Startup(_)));
    }
}
