use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tokio::fs;

use crate::detection::Provider;

/// Environment variable prefix for overrides, e.g.
/// `VISIONWATCH_PROVIDERS__OPENAI__API_KEY`.
pub const ENV_PREFIX: &str = "VISIONWATCH";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub capture: CaptureConfig,
    pub providers: ProvidersConfig,
    pub fallback: FallbackConfig,
    pub alerts: AlertConfig,
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Camera device index
    pub camera_device: u32,
    /// Requested camera resolution width
    pub width: u32,
    /// Requested camera resolution height
    pub height: u32,
    /// Capture period in milliseconds
    pub interval_ms: u64,
    /// JPEG quality, 1-100
    pub jpeg_quality: u8,
    /// Frames buffered between the capture thread and the monitor
    pub frame_queue: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            camera_device: 0,
            width: 640,
            height: 480,
            interval_ms: 2000,
            jpeg_quality: 80,
            frame_queue: 8,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    /// Provider selected at startup
    pub default: Provider,
    pub google: VisionApiConfig,
    pub openai: RemoteModelConfig,
}

impl ProvidersConfig {
    pub fn api_key(&self, provider: Provider) -> Option<&str> {
        let key = match provider {
            Provider::StructuredLabel => self.google.api_key.as_deref(),
            Provider::NaturalLanguage => self.openai.api_key.as_deref(),
        };
        key.filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionApiConfig {
    /// Image annotation endpoint
    pub base_url: String,
    pub api_key: Option<String>,
    /// Result limit for each requested feature
    pub max_results: u32,
    pub timeout_seconds: Option<u64>,
}

impl Default for VisionApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://vision.googleapis.com/v1/images:annotate".to_string(),
            api_key: None,
            max_results: 20,
            timeout_seconds: Some(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteModelConfig {
    /// Base URL of an OpenAI-compatible API
    pub base_url: String,
    pub api_key: Option<String>,
    pub model_name: String,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<usize>,
    pub timeout_seconds: Option<u64>,
    /// Optional `detail` hint for the inline image
    pub image_detail: Option<String>,
    pub additional_headers: Option<HashMap<String, String>>,
}

impl Default for RemoteModelConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model_name: "gpt-4o".to_string(),
            temperature: Some(0.1),
            top_p: None,
            max_tokens: Some(500),
            timeout_seconds: Some(60),
            image_detail: None,
            additional_headers: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Delay before a simulated result is returned
    pub delay_ms: u64,
    /// Random draw must exceed this for a simulated positive
    pub threshold: f64,
    /// Words that make a simulated positive possible
    pub vocabulary: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            delay_ms: 1000,
            threshold: 0.7,
            vocabulary: ["person", "car", "dog", "cat", "red", "blue", "green", "door", "window"]
                .iter()
                .map(|w| w.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Play the two-tone chime on detections
    pub sound: bool,
    /// Show desktop notifications on detections
    pub notifications: bool,
    pub notification_title: String,
    /// Command used to display desktop notifications
    pub notify_command: String,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            sound: true,
            notifications: true,
            notification_title: "AI Monitor Alert".to_string(),
            notify_command: "notify-send".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Drop results that belong to an earlier monitoring session
    pub discard_stale_results: bool,
}

impl WatchConfig {
    /// Loads defaults, then the TOML file, then `VISIONWATCH_*` environment overrides.
    /// A missing file is created with the default configuration.
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            let default_config = Self::default();
            default_config
                .save(path)
                .await
                .with_context(|| format!("failed to write default config to {}", path.display()))?;
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_layers(&content)
    }

    /// Layers a TOML document and the process environment over the defaults.
    pub fn from_layers(toml_content: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from_str(toml_content, config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to assemble configuration")?;

        let config: Self = settings
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(config)
    }

    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }
}
