use super::FederatorConfig;
use super::types::CacheBackendKind;

#[test]
fn test_defaults() {
    let cfg = FederatorConfig::default();
    assert_eq!(cfg.retry_budget_client, 100.0);
    assert_eq!(cfg.endpoint.num_retries, 2);
    assert_eq!(cfg.stats.window_size, 10_000);
    assert_eq!(cfg.cache.backend, CacheBackendKind::Null);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
retry_budget_client = 80.0

[routing]
url = "http://resolver.example.org/eidaws/routing/1/query"

[endpoint]
timeout_secs = 120
num_retries = 1
retry_wait_secs = 0

[pool]
max_workers = 4

[cache]
backend = "redis"
ttl_secs = 600

[redis]
url = "redis://redis.example.org:6379/"
"#;
    let tmp = std::env::temp_dir().join("seisfed_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = FederatorConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.retry_budget_client, 80.0);
    assert_eq!(cfg.endpoint.timeout_secs, 120);
    assert_eq!(cfg.pool.max_workers, 4);
    assert_eq!(cfg.cache.backend, CacheBackendKind::Redis);
    assert_eq!(cfg.cache.ttl_secs, 600);
    assert!(cfg.routing.url.contains("resolver.example.org"));
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "routing": { "url": "http://resolver/eidaws/routing/1/query" },
        "stats": { "ttl_secs": 60, "window_size": 100 }
    }"#;
    let tmp = std::env::temp_dir().join("seisfed_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = FederatorConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.stats.ttl_secs, 60);
    assert_eq!(cfg.stats.window_size, 100);
    // Unspecified sections fall back to defaults.
    assert_eq!(cfg.endpoint.timeout_secs, 600);
}

#[test]
fn test_validate_rejects_bad_budget() {
    let mut cfg = FederatorConfig::default();
    cfg.retry_budget_client = 120.0;
    assert!(cfg.validate().is_err());
    cfg.retry_budget_client = -1.0;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rejects_zero_workers() {
    let mut cfg = FederatorConfig::default();
    cfg.pool.max_workers = 0;
    assert!(cfg.validate().is_err());
}
