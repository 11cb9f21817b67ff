use std::env;
use std::time::Duration;
use teamchain::{ConfigError, EngineSettings};

#[test]
fn test_engine_settings_from_env() {
    // Save original environment variables
    let original_attempts = env::var("TEAMCHAIN_POLL_ATTEMPTS").ok();
    let original_freshness = env::var("TEAMCHAIN_CACHE_FRESHNESS_MS").ok();
    let original_factor = env::var("TEAMCHAIN_POLL_FACTOR").ok();

    // Defaults when unset
    env::remove_var("TEAMCHAIN_POLL_ATTEMPTS");
    env::remove_var("TEAMCHAIN_CACHE_FRESHNESS_MS");
    env::remove_var("TEAMCHAIN_POLL_FACTOR");
    let settings = EngineSettings::from_env().unwrap();
    assert_eq!(settings, EngineSettings::default());
    assert_eq!(settings.poll_attempts, 10);
    assert_eq!(settings.cache_freshness, Duration::from_secs(6));

    // Overrides
    env::set_var("TEAMCHAIN_POLL_ATTEMPTS", "3");
    env::set_var("TEAMCHAIN_CACHE_FRESHNESS_MS", "250");
    let settings = EngineSettings::from_env().unwrap();
    assert_eq!(settings.poll_attempts, 3);
    assert_eq!(settings.cache_freshness, Duration::from_millis(250));

    // Garbage is reported with the variable name
    env::set_var("TEAMCHAIN_POLL_ATTEMPTS", "many");
    match EngineSettings::from_env() {
        Err(ConfigError::InvalidValue { var, value, .. }) => {
            assert_eq!(var, "TEAMCHAIN_POLL_ATTEMPTS");
            assert_eq!(value, "many");
        }
        other => panic!("expected invalid value, got {:?}", other),
    }
    env::set_var("TEAMCHAIN_POLL_ATTEMPTS", "3");

    // A backoff factor that would shrink or overflow the delay is refused
    for factor in ["-1", "0.5", "NaN", "inf"] {
        env::set_var("TEAMCHAIN_POLL_FACTOR", factor);
        match EngineSettings::from_env() {
            Err(ConfigError::InvalidValue { var, .. }) => {
                assert_eq!(var, "TEAMCHAIN_POLL_FACTOR")
            }
            other => panic!("factor {} accepted: {:?}", factor, other),
        }
    }
    env::set_var("TEAMCHAIN_POLL_FACTOR", "2");
    let settings = EngineSettings::from_env().unwrap();
    assert_eq!(settings.poll_factor, 2.0);
    let mut backoff = settings.poll_backoff();
    assert_eq!(backoff.nth(1), Some(Duration::from_millis(200)));

    // Restore original environment variables
    match original_attempts {
        Some(val) => env::set_var("TEAMCHAIN_POLL_ATTEMPTS", val),
        None => env::remove_var("TEAMCHAIN_POLL_ATTEMPTS"),
    }
    match original_freshness {
        Some(val) => env::set_var("TEAMCHAIN_CACHE_FRESHNESS_MS", val),
        None => env::remove_var("TEAMCHAIN_CACHE_FRESHNESS_MS"),
    }
    match original_factor {
        Some(val) => env::set_var("TEAMCHAIN_POLL_FACTOR", val),
        None => env::remove_var("TEAMCHAIN_POLL_FACTOR"),
    }
}
