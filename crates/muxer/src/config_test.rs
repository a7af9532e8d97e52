use super::*;
use crate::error::MuxerError;

// =============================================================================
// Uniform construction
// =============================================================================

#[test]
fn test_uniform_applies_shared_secret() {
    let config = MuxerConfig::uniform(
        vec!["tcp://a:4023".into(), "tcp://b:4023".into()],
        "secret",
    )
    .unwrap();
    assert_eq!(config.destinations.len(), 2);
    for t in &config.destinations {
        assert_eq!(t.secret, "secret");
    }
    assert_eq!(config.destinations[0].address, "tcp://a:4023");
}

#[test]
fn test_uniform_empty_secret() {
    let result = MuxerConfig::uniform(vec!["tcp://a:4023".into()], "");
    assert!(matches!(result, Err(MuxerError::EmptyAuth)));
}

#[test]
fn test_uniform_no_targets() {
    let result = MuxerConfig::uniform(vec![], "secret");
    assert!(matches!(result, Err(MuxerError::NoTargets)));
}

// =============================================================================
// Channel size coercion
// =============================================================================

#[test]
fn test_channel_size_default() {
    let config = MuxerConfig::default();
    assert_eq!(config.effective_channel_size(), DEFAULT_CHANNEL_SIZE);
}

#[test]
fn test_channel_size_coercion() {
    let config = MuxerConfig::default().with_channel_size(0);
    assert_eq!(config.effective_channel_size(), DEFAULT_CHANNEL_SIZE);

    let config = MuxerConfig::default().with_channel_size(-5);
    assert_eq!(config.effective_channel_size(), DEFAULT_CHANNEL_SIZE);

    let config = MuxerConfig::default().with_channel_size(128);
    assert_eq!(config.effective_channel_size(), 128);
}

// =============================================================================
// Builder setters
// =============================================================================

#[test]
fn test_builders() {
    let config = MuxerConfig::uniform(vec!["tcp://a:4023".into()], "secret")
        .unwrap()
        .with_tags(vec!["default".into(), "syslog".into()])
        .with_log_level(LogLevel::Info)
        .with_identity("test-ingester", "1.2.3", "0000-1111")
        .with_rate_limit_bps(1_000_000)
        .with_retry_interval(Duration::from_millis(250));

    assert_eq!(config.tags, vec!["default", "syslog"]);
    assert_eq!(config.retry_interval, Duration::from_millis(250));
    assert_eq!(config.log_level, LogLevel::Info);
    assert_eq!(config.ingester_name, "test-ingester");
    assert_eq!(config.ingester_version, "1.2.3");
    assert_eq!(config.ingester_uuid, "0000-1111");
    assert_eq!(config.rate_limit_bps, 1_000_000);
}

#[test]
fn test_with_cache_enables() {
    let config = MuxerConfig::default().with_cache(CacheConfig {
        file_backing_location: Some("/tmp/spool".into()),
        max_cache_size: 0,
    });
    assert!(config.enable_cache);
    assert!(config.cache_config.is_file_backed());
}

// =============================================================================
// Log level parsing
// =============================================================================

#[test]
fn test_log_level_from_str() {
    assert_eq!("OFF".parse::<LogLevel>().unwrap(), LogLevel::Off);
    assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
    assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
    assert_eq!(" error ".parse::<LogLevel>().unwrap(), LogLevel::Error);
    // unknown and empty fall back to the default
    assert_eq!("".parse::<LogLevel>().unwrap(), LogLevel::Error);
    assert_eq!("verbose".parse::<LogLevel>().unwrap(), LogLevel::Error);
}

#[test]
fn test_log_level_ordering() {
    assert!(LogLevel::Off < LogLevel::Error);
    assert!(LogLevel::Error < LogLevel::Warn);
    assert!(LogLevel::Warn < LogLevel::Info);
}

#[test]
fn test_log_level_display() {
    assert_eq!(LogLevel::Off.to_string(), "OFF");
    assert_eq!(LogLevel::Error.to_string(), "ERROR");
    assert_eq!(LogLevel::Warn.to_string(), "WARN");
    assert_eq!(LogLevel::Info.to_string(), "INFO");
}
