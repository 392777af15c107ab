use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

use visionwatch::camera::{EncodedFrame, FrameSource};
use visionwatch::config::WatchConfig;
use visionwatch::pipeline::{FrameOutcome, MonitorEvent, MonitorPipeline};
use visionwatch::Provider;

#[derive(Parser)]
#[command(name = "visionwatch")]
#[command(about = "Watch a camera and raise alerts when a described target appears")]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "visionwatch.toml")]
    config: PathBuf,

    /// What to watch for, e.g. "person wearing a red jacket"
    #[arg(short, long)]
    prompt: Option<String>,

    /// Recognition provider: google or openai
    #[arg(long)]
    provider: Option<Provider>,

    /// API key for the selected provider (overrides config and environment)
    #[arg(long)]
    api_key: Option<String>,

    /// Camera device index
    #[arg(short = 'd', long)]
    camera_device: Option<u32>,

    /// Use a generated test pattern instead of a camera
    #[arg(long)]
    test_pattern: bool,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<u64>,

    /// Analyze a single image file and exit
    #[arg(long)]
    analyze: Option<PathBuf>,

    /// Disable the alert sound
    #[arg(long)]
    mute: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(format!("visionwatch={}", log_level))
        .try_init();

    info!("Starting visionwatch");

    let mut config = WatchConfig::load(&args.config).await?;
    info!("Configuration loaded from {}", args.config.display());

    if let Some(device) = args.camera_device {
        config.capture.camera_device = device;
    }
    if let Some(provider) = args.provider {
        config.providers.default = provider;
    }
    if args.mute {
        config.alerts.sound = false;
    }
    if args.api_key.is_none() && config.providers.api_key(config.providers.default).is_none() {
        warn!(
            "No API key for {}; pass --api-key or set {}_PROVIDERS__{}__API_KEY",
            config.providers.default.display_name(),
            visionwatch::config::ENV_PREFIX,
            config.providers.default.as_str().to_uppercase()
        );
    }

    match args.analyze.clone() {
        Some(path) => run_single_image(&args, config, path).await,
        None => run_monitor(&args, config).await,
    }
}

fn configure(pipeline: &MonitorPipeline, args: &Args, provider: Provider) -> Result<()> {
    if let Some(prompt) = &args.prompt {
        pipeline.set_prompt(prompt.clone());
    }
    if let Some(key) = &args.api_key {
        pipeline.set_credential(provider, key)?;
    }
    Ok(())
}

async fn run_single_image(args: &Args, config: WatchConfig, path: PathBuf) -> Result<()> {
    let provider = config.providers.default;
    let quality = config.capture.jpeg_quality;

    let image = image::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
    let frame = EncodedFrame::encode(&image, quality)?;

    let pipeline = MonitorPipeline::builder(config)
        .frame_source(FrameSource::detached("single-image analysis"))
        .build()?;
    configure(&pipeline, args, provider)?;

    match pipeline.analyze_frame(frame).await {
        FrameOutcome::Analyzed(detection) => {
            println!("{}", serde_json::to_string_pretty(&detection)?);
        }
        FrameOutcome::Failed(alert) => {
            error!("{}", alert.message);
            anyhow::bail!(alert.message);
        }
        FrameOutcome::Discarded => warn!("Result discarded"),
    }
    Ok(())
}

async fn run_monitor(args: &Args, config: WatchConfig) -> Result<()> {
    let provider = config.providers.default;

    let mut builder = MonitorPipeline::builder(config.clone());
    if args.test_pattern {
        builder = builder.frame_source(FrameSource::test_pattern(config.capture.clone()));
    }
    let pipeline = builder.build()?;
    configure(&pipeline, args, provider)?;

    let mut events = pipeline.subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                MonitorEvent::AlertRaised(alert) => {
                    let confidence = alert
                        .confidence
                        .map(|c| format!(" [{:.0}%]", c * 100.0))
                        .unwrap_or_default();
                    println!("{} ALERT {}{}", alert.timestamp.format("%H:%M:%S"), alert.message, confidence);
                }
                MonitorEvent::StateChanged(state) => info!("Monitor state: {:?}", state),
                MonitorEvent::FrameAnalyzed(_) | MonitorEvent::AlertDismissed(_) => {}
            }
        }
    });

    if let Err(e) = pipeline.start().await {
        error!("Cannot start monitoring: {}", e);
        return Err(e.into());
    }

    match args.duration {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => {
            tokio::signal::ctrl_c().await?;
            info!("Interrupt received");
        }
    }

    pipeline.shutdown(Duration::from_secs(5)).await;

    let snapshot = pipeline.snapshot();
    info!(
        "Session complete: {} detections, {} alerts",
        snapshot.detection_count,
        snapshot.alerts.len()
    );

    drop(pipeline);
    printer.abort();
    Ok(())
}
