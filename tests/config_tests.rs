use tempfile::TempDir;

use visionwatch::config::WatchConfig;
use visionwatch::detection::Provider;

#[tokio::test]
async fn load_creates_default_file_when_missing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("visionwatch.toml");
    assert!(!path.exists());

    let config = WatchConfig::load(&path).await.unwrap();

    assert!(path.exists());
    assert_eq!(config.capture.interval_ms, 2000);
    assert_eq!(config.providers.default, Provider::StructuredLabel);
    assert_eq!(config.providers.openai.model_name, "gpt-4o");

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[capture]"));
    println!("✅ Default configuration written to {}", path.display());
}

#[tokio::test]
async fn file_values_override_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("custom.toml");
    std::fs::write(
        &path,
        r#"
[capture]
interval_ms = 500
jpeg_quality = 60

[providers]
default = "openai"

[providers.openai]
api_key = "sk-from-file"
max_tokens = 300

[fallback]
threshold = 0.5
"#,
    )
    .unwrap();

    let config = WatchConfig::load(&path).await.unwrap();

    assert_eq!(config.capture.interval_ms, 500);
    assert_eq!(config.capture.jpeg_quality, 60);
    assert_eq!(config.capture.width, 640);
    assert_eq!(config.providers.default, Provider::NaturalLanguage);
    assert_eq!(config.providers.api_key(Provider::NaturalLanguage), Some("sk-from-file"));
    assert_eq!(config.providers.openai.max_tokens, Some(300));
    assert_eq!(config.fallback.threshold, 0.5);
    assert_eq!(config.fallback.delay_ms, 1000);
}

#[tokio::test]
async fn saved_config_loads_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("saved.toml");

    let mut config = WatchConfig::default();
    config.capture.camera_device = 2;
    config.monitor.discard_stale_results = true;
    config.save(&path).await.unwrap();

    let loaded = WatchConfig::load(&path).await.unwrap();
    assert_eq!(loaded.capture.camera_device, 2);
    assert!(loaded.monitor.discard_stale_results);
}

#[test]
fn environment_overrides_file() {
    std::env::set_var("VISIONWATCH_ALERTS__NOTIFY_COMMAND", "dunstify");
    let config = WatchConfig::from_layers("[alerts]\nnotify_command = \"notify-send\"\n");
    std::env::remove_var("VISIONWATCH_ALERTS__NOTIFY_COMMAND");

    assert_eq!(config.unwrap().alerts.notify_command, "dunstify");
}

#[test]
fn malformed_file_is_rejected() {
    let result = WatchConfig::from_layers("[capture]\ninterval_ms = \"soon\"\n");
    assert!(result.is_err());
}
