//! Layered configuration loading.

use courier_server::config::Config;
use std::time::Duration;

#[test]
fn test_file_with_environment_overrides() {
    let path = std::env::temp_dir().join(format!("courier-{}.toml", std::process::id()));
    std::fs::write(
        &path,
        r#"
            port = 7000
            client_broadcasts = false

            [redis]
            consumers = 2
            pool_size = 4

            [long_poll]
            timeout_secs = 10
        "#,
    )
    .unwrap();

    std::env::set_var("COURIER__REDIS__POOL_SIZE", "6");
    std::env::set_var("COURIER__LONG_POLL__TIMEOUT_SECS", "45");
    let loaded = Config::load_from(Some(&path));
    std::env::remove_var("COURIER__REDIS__POOL_SIZE");
    std::env::remove_var("COURIER__LONG_POLL__TIMEOUT_SECS");
    std::fs::remove_file(&path).unwrap();

    let config = loaded.unwrap();
    assert_eq!(config.port, 7000);
    assert!(!config.client_broadcasts);
    assert_eq!(config.redis.consumers, 2);
    assert_eq!(config.redis.pool_size, 6);
    assert_eq!(config.long_poll.timeout_secs, 45);
    assert!(config.validate().is_ok());

    let hub = config.hub_config();
    assert_eq!(hub.queue.pool_size, 6);
    assert_eq!(hub.session.longpoll_timeout, Duration::from_secs(45));
}

#[test]
fn test_missing_file_is_an_error() {
    let path = std::env::temp_dir().join("courier-does-not-exist.toml");
    assert!(Config::from_file(&path).is_err());
    assert!(Config::load_from(Some(&path)).is_err());
}

#[test]
fn test_malformed_file_is_an_error() {
    let path = std::env::temp_dir().join(format!("courier-bad-{}.toml", std::process::id()));
    std::fs::write(&path, "port = \"not a number\"\n").unwrap();
    let result = Config::from_file(&path);
    std::fs::remove_file(&path).unwrap();
    assert!(result.is_err());
}
