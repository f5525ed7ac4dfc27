use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use gatekeeper::cache::MockClock;
use gatekeeper::{GatekeeperConfig, KeyDeriver, RateLimiter, RateSpec, Registry, RequestMeta, Throttle};

const BROWSER: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

fn browser_request() -> RequestMeta {
    RequestMeta::new()
        .with_remote_addr(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .with_header("User-Agent", BROWSER)
        .with_header("X-Forwarded-For", "127.0.0.1")
        .with_header("X-Real-Ip", "127.0.0.1")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_burst_then_window_reset() {
    let throttle = Arc::new(
        Throttle::builder(RateSpec::parse("35/1s").unwrap())
            .key(KeyDeriver::IpAndUserAgent)
            .build()
            .unwrap(),
    );

    let mut tasks = Vec::new();
    for _ in 0..35 {
        let throttle = throttle.clone();
        tasks.push(tokio::spawn(async move { throttle.check(&browser_request()) }));
    }
    for task in tasks {
        assert!(task.await.unwrap().is_ok());
    }

    let rejection = throttle.check(&browser_request()).unwrap_err();
    assert!(rejection.retry_after <= Duration::from_secs(1));
    assert_eq!(rejection.body["code"], 429);

    tokio::time::sleep(Duration::from_millis(1100)).await;
    assert!(throttle.check(&browser_request()).is_ok());
}

#[test]
fn test_concurrent_callers_on_fresh_key() {
    let limiter = RateLimiter::new(RateSpec::parse("35/1m").unwrap());

    let allowed: usize = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..100)
            .map(|_| scope.spawn(|| limiter.check("racer").is_allowed()))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum()
    });

    assert_eq!(allowed, 35);
    assert_eq!(limiter.counter_value("racer"), Some(35));
}

#[test]
fn test_sequential_budget_and_retry_hint() {
    let clock = MockClock::default();
    let throttle = Throttle::builder(RateSpec::parse("16/3m").unwrap())
        .clock(Arc::new(clock.clone()))
        .without_sweeper()
        .build()
        .unwrap();

    for i in 1..=16 {
        assert!(throttle.check(&browser_request()).is_ok(), "request {} should pass", i);
    }
    let rejection = throttle.check(&browser_request()).unwrap_err();
    assert_eq!(rejection.retry_after, Duration::from_secs(180));
    assert_eq!(rejection.body["msg"], "Too many requests, take a break ^_^ (180s)");

    clock.advance(Duration::from_secs(100));
    let again = throttle.check(&browser_request()).unwrap_err();
    assert_eq!(again.retry_after, Duration::from_secs(80));

    clock.advance(Duration::from_secs(80));
    assert!(throttle.check(&browser_request()).is_ok());
}

#[test]
fn test_distinct_keys_get_independent_budgets() {
    let limiter = RateLimiter::new(RateSpec::parse("35/1s").unwrap());

    for _ in 0..35 {
        assert!(limiter.check("alice").is_allowed());
    }
    assert!(!limiter.check("alice").is_allowed());

    for _ in 0..35 {
        assert!(limiter.check("bob").is_allowed());
    }
    assert!(!limiter.check("bob").is_allowed());
}

#[test]
fn test_tenants_never_share_a_budget() {
    let throttle = Throttle::builder(RateSpec::parse("2/1h").unwrap())
        .key(KeyDeriver::headers(["X-Tenant"]))
        .without_sweeper()
        .build()
        .unwrap();

    let acme = browser_request().with_header("X-Tenant", "acme");
    let globex = browser_request().with_header("X-Tenant", "globex");

    assert!(throttle.check(&acme).is_ok());
    assert!(throttle.check(&acme).is_ok());
    assert!(throttle.check(&acme).is_err());

    assert!(throttle.check(&globex).is_ok());
    assert!(throttle.check(&globex).is_ok());
    assert!(throttle.check(&globex).is_err());
}

#[test]
fn test_bad_rate_is_rejected_at_setup() {
    let err = RateSpec::parse("10/2x").unwrap_err();
    assert!(err.is_config());

    let yaml = r#"
limiters:
  - name: api
    rate: 10/2x
"#;
    assert!(GatekeeperConfig::from_yaml(yaml).is_err());
}

#[tokio::test]
async fn test_registry_end_to_end() {
    let yaml = r#"
cache:
  sweep_interval_secs: 1
  decay_factor: 0.5
limiters:
  - name: per_tenant
    rate: 3/1m
    key:
      strategy: headers
      names: [X-Tenant]
"#;
    let config = GatekeeperConfig::from_yaml(yaml).unwrap();
    let registry = Registry::from_config(&config).unwrap();

    let tenant = browser_request().with_header("X-Tenant", "initech");
    for _ in 0..3 {
        assert!(registry.check(&tenant).is_ok());
    }
    assert!(registry.check(&tenant).is_err());

    // No tenant header: bypassed.
    for _ in 0..10 {
        assert!(registry.check(&browser_request()).is_ok());
    }

    registry.shutdown().await;
}
