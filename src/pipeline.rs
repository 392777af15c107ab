use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertLog};
use crate::audio::{AlertChime, RodioChime, SilentChime};
use crate::backend::{BackendRegistry, Credential};
use crate::camera::{EncodedFrame, FrameCallback, FrameSource, FrameSourceState};
use crate::config::WatchConfig;
use crate::detection::{Detection, Provider};
use crate::error::{DetectionError, StartError};
use crate::normalizer::{DetectionNormalizer, RandomSource, StdRandom};
use crate::notify::{CommandNotifier, DisabledNotifier, NotificationPermission, Notifier};
use crate::remote_model::RemoteModel;
use crate::vision_api::VisionApiBackend;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitorState {
    Idle,
    Monitoring,
}

#[derive(Debug, Clone)]
pub struct MonitoringSession {
    pub state: MonitorState,
    pub prompt: String,
    pub provider: Provider,
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    StateChanged(MonitorState),
    AlertRaised(Alert),
    AlertDismissed(String),
    FrameAnalyzed(Detection),
}

/// Read-only view of the monitor for display.
#[derive(Debug, Clone)]
pub struct MonitorSnapshot {
    pub state: MonitorState,
    pub prompt: String,
    pub provider: Provider,
    pub has_credential: bool,
    pub alerts: Vec<Alert>,
    pub detection_count: u64,
    /// Analyses currently in flight
    pub is_processing: usize,
    pub frame_source: FrameSourceState,
}

/// What became of one analyzed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Analyzed(Detection),
    Failed(Alert),
    /// Result belonged to an earlier monitoring session and was dropped.
    Discarded,
}

struct Settings {
    discard_stale_results: bool,
    frame_queue: usize,
    notification_title: String,
}

/// Orchestrates capture, analysis and alerting for one camera.
#[derive(Clone)]
pub struct MonitorPipeline {
    session: Arc<RwLock<MonitoringSession>>,
    cancel: Arc<Mutex<Option<CancellationToken>>>,
    generation: Arc<AtomicU64>,
    in_flight: Arc<AtomicUsize>,
    backends: BackendRegistry,
    normalizer: Arc<DetectionNormalizer>,
    frame_source: Arc<Mutex<FrameSource>>,
    alerts: Arc<Mutex<AlertLog>>,
    notifier: Arc<dyn Notifier>,
    chime: Arc<dyn AlertChime>,
    events: broadcast::Sender<MonitorEvent>,
    settings: Arc<Settings>,
}

pub struct PipelineBuilder {
    config: WatchConfig,
    backends: Option<BackendRegistry>,
    frame_source: Option<FrameSource>,
    notifier: Option<Arc<dyn Notifier>>,
    chime: Option<Arc<dyn AlertChime>>,
    random: Option<Box<dyn RandomSource>>,
}

impl PipelineBuilder {
    pub fn backends(mut self, backends: BackendRegistry) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn frame_source(mut self, frame_source: FrameSource) -> Self {
        self.frame_source = Some(frame_source);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn chime(mut self, chime: Arc<dyn AlertChime>) -> Self {
        self.chime = Some(chime);
        self
    }

    pub fn random(mut self, random: Box<dyn RandomSource>) -> Self {
        self.random = Some(random);
        self
    }

    /// Fills anything not supplied from the configuration: real backends,
    /// the physical camera, desktop notifications and the rodio chime.
    pub fn build(self) -> Result<MonitorPipeline> {
        let config = self.config;

        let backends = match self.backends {
            Some(backends) => backends,
            None => BackendRegistry::new()
                .with(Arc::new(
                    VisionApiBackend::new(config.providers.google.clone())
                        .context("failed to create structured-label backend")?,
                ))
                .with(Arc::new(
                    RemoteModel::new(config.providers.openai.clone())
                        .context("failed to create natural-language backend")?,
                )),
        };

        let frame_source = self
            .frame_source
            .unwrap_or_else(|| FrameSource::camera(config.capture.clone()));

        let notifier: Arc<dyn Notifier> = match self.notifier {
            Some(notifier) => notifier,
            None if config.alerts.notifications => {
                Arc::new(CommandNotifier::new(config.alerts.notify_command.clone()))
            }
            None => Arc::new(DisabledNotifier),
        };

        let chime: Arc<dyn AlertChime> = match self.chime {
            Some(chime) => chime,
            None if config.alerts.sound => Arc::new(RodioChime::new()),
            None => Arc::new(SilentChime),
        };

        let random: Box<dyn RandomSource> = match self.random {
            Some(random) => random,
            None => Box::new(StdRandom::from_entropy()),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        info!("Monitor pipeline initialized (provider: {})", config.providers.default);

        Ok(MonitorPipeline {
            session: Arc::new(RwLock::new(MonitoringSession {
                state: MonitorState::Idle,
                prompt: String::new(),
                provider: config.providers.default,
            })),
            cancel: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            backends,
            normalizer: Arc::new(DetectionNormalizer::new(config.fallback.clone(), random)),
            frame_source: Arc::new(Mutex::new(frame_source)),
            alerts: Arc::new(Mutex::new(AlertLog::new())),
            notifier,
            chime,
            events,
            settings: Arc::new(Settings {
                discard_stale_results: config.monitor.discard_stale_results,
                frame_queue: config.capture.frame_queue.max(1),
                notification_title: config.alerts.notification_title.clone(),
            }),
        })
    }
}

impl MonitorPipeline {
    pub fn builder(config: WatchConfig) -> PipelineBuilder {
        PipelineBuilder {
            config,
            backends: None,
            frame_source: None,
            notifier: None,
            chime: None,
            random: None,
        }
    }

    pub fn set_prompt(&self, prompt: impl Into<String>) {
        self.session.write().prompt = prompt.into();
    }

    /// Validates and installs the key for `provider`, then makes that provider
    /// active. A rejected key leaves the previous credential untouched.
    pub fn set_credential(&self, provider: Provider, secret: &str) -> Result<(), DetectionError> {
        let backend = self.backends.get(provider).ok_or_else(|| {
            DetectionError::Configuration(format!("no backend registered for provider {}", provider))
        })?;
        let credential = Credential::parse(secret).map_err(|e| {
            warn!("Rejected {} API key: {}", provider.display_name(), e);
            e
        })?;
        backend.set_credential(credential);
        self.session.write().provider = provider;
        info!("🔑 Credential set, active provider: {}", provider.display_name());
        Ok(())
    }

    pub fn state(&self) -> MonitorState {
        self.session.read().state
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let session = self.session.read().clone();
        let alerts = self.alerts.lock();
        MonitorSnapshot {
            state: session.state,
            has_credential: self.backends.has_credential(session.provider),
            prompt: session.prompt,
            provider: session.provider,
            alerts: alerts.alerts().to_vec(),
            detection_count: alerts.detection_count(),
            is_processing: self.in_flight.load(Ordering::SeqCst),
            frame_source: self.frame_source.lock().state(),
        }
    }

    /// Idle → Monitoring. Needs a target phrase and a credential for the
    /// active provider; a second call while monitoring changes nothing.
    pub async fn start(&self) -> Result<(), StartError> {
        let (prompt, provider) = {
            let session = self.session.read();
            if session.state == MonitorState::Monitoring {
                debug!("start ignored: already monitoring");
                return Ok(());
            }
            (session.prompt.clone(), session.provider)
        };

        if prompt.trim().is_empty() {
            return Err(StartError::EmptyPrompt);
        }
        if !self.backends.has_credential(provider) {
            return Err(StartError::MissingCredential(provider));
        }

        if self.notifier.permission() == NotificationPermission::Default {
            let notifier = Arc::clone(&self.notifier);
            tokio::spawn(async move {
                notifier.request_permission().await;
            });
        }

        let token = CancellationToken::new();
        let generation = {
            let mut session = self.session.write();
            if session.state == MonitorState::Monitoring {
                return Ok(());
            }
            session.state = MonitorState::Monitoring;
            *self.cancel.lock() = Some(token.clone());
            self.generation.fetch_add(1, Ordering::SeqCst) + 1
        };

        self.attach_capture(token, generation);
        let _ = self.events.send(MonitorEvent::StateChanged(MonitorState::Monitoring));
        info!("👁️ Monitoring for \"{}\" with {}", prompt.trim(), provider.display_name());
        Ok(())
    }

    /// Monitoring → Idle. Future ticks stop; analyses already in flight still
    /// complete and may append alerts unless stale results are discarded, in
    /// which case their results are dropped once they land.
    pub fn stop(&self) {
        {
            let mut session = self.session.write();
            if session.state == MonitorState::Idle {
                return;
            }
            session.state = MonitorState::Idle;
            // Anything still in flight now belongs to a finished session
            self.generation.fetch_add(1, Ordering::SeqCst);
        }

        if let Some(token) = self.cancel.lock().take() {
            token.cancel();
        }
        self.frame_source.lock().stop();

        let _ = self.events.send(MonitorEvent::StateChanged(MonitorState::Idle));
        info!("🛑 Monitoring stopped");
    }

    /// Removes exactly the alert with `id`; purely local.
    pub fn dismiss(&self, id: &str) -> bool {
        let removed = self.alerts.lock().dismiss(id);
        if removed {
            let _ = self.events.send(MonitorEvent::AlertDismissed(id.to_string()));
        }
        removed
    }

    /// Re-acquires the camera after it was unavailable, resuming capture if
    /// a monitoring session is active. The device probe runs on the blocking
    /// pool without holding the frame-source lock, so `stop` and `snapshot`
    /// stay responsive meanwhile.
    pub async fn retry_camera(&self) -> FrameSourceState {
        let pending = self.frame_source.lock().prepare_retry();
        let Some(pending) = pending else {
            return self.frame_source.lock().state();
        };

        info!("📷 Retrying camera acquisition");
        let state = match tokio::task::spawn_blocking(move || pending.acquire()).await {
            Ok(acquired) => self.frame_source.lock().install(acquired),
            Err(e) => {
                error!("Camera acquisition task failed: {}", e);
                self.frame_source.lock().state()
            }
        };

        if state == FrameSourceState::Ready && self.state() == MonitorState::Monitoring {
            let token = self.cancel.lock().clone();
            if let Some(token) = token {
                self.attach_capture(token, self.generation.load(Ordering::SeqCst));
            }
        }
        self.frame_source.lock().state()
    }

    /// Analyzes one frame against the current prompt and provider, applying
    /// the result to the alert log.
    pub async fn analyze_frame(&self, frame: EncodedFrame) -> FrameOutcome {
        let generation = self.generation.load(Ordering::SeqCst);
        self.process_frame(frame, generation).await
    }

    /// Stops monitoring and waits up to `grace` for in-flight analyses.
    pub async fn shutdown(&self, grace: Duration) {
        self.stop();
        let deadline = tokio::time::Instant::now() + grace;
        while self.in_flight.load(Ordering::SeqCst) > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let abandoned = self.in_flight.load(Ordering::SeqCst);
        if abandoned > 0 {
            warn!("Shutting down with {} analyses still in flight", abandoned);
        }
    }

    fn attach_capture(&self, token: CancellationToken, generation: u64) {
        let (tx, rx) = mpsc::channel(self.settings.frame_queue);
        let on_frame: FrameCallback = Box::new(move |frame| {
            if let Err(e) = tx.try_send(frame) {
                match e {
                    mpsc::error::TrySendError::Full(_) => warn!("Frame queue full, dropping frame"),
                    mpsc::error::TrySendError::Closed(_) => debug!("Frame dispatcher gone, dropping frame"),
                }
            }
        });

        if let Err(e) = self.frame_source.lock().start(on_frame) {
            warn!("📷 Monitoring without frames: {}", e);
            return;
        }

        tokio::spawn(self.clone().dispatch(rx, token, generation));
    }

    async fn dispatch(self, mut frames: mpsc::Receiver<EncodedFrame>, cancel: CancellationToken, generation: u64) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        // Analyses overlap freely; no queueing behind a slow backend
                        let pipeline = self.clone();
                        tokio::spawn(async move {
                            pipeline.process_frame(frame, generation).await;
                        });
                    }
                    None => break,
                },
            }
        }
        debug!("Frame dispatcher for session {} finished", generation);
    }

    async fn process_frame(&self, frame: EncodedFrame, generation: u64) -> FrameOutcome {
        let (prompt, provider) = {
            let session = self.session.read();
            (session.prompt.clone(), session.provider)
        };

        let Some(backend) = self.backends.get(provider) else {
            return FrameOutcome::Failed(self.raise_error(&format!("no backend registered for provider {}", provider)));
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let normalizer = Arc::clone(&self.normalizer);
        // Run on its own task so a panic inside the analysis surfaces as an error
        let task = tokio::spawn(async move { normalizer.detect(backend.as_ref(), &frame, &prompt).await });
        let result = task.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.settings.discard_stale_results && generation != self.generation.load(Ordering::SeqCst) {
            debug!("Discarding result from stale session {}", generation);
            return FrameOutcome::Discarded;
        }

        match result {
            Ok(Ok(detection)) => {
                self.apply_detection(&detection).await;
                FrameOutcome::Analyzed(detection)
            }
            Ok(Err(e)) => {
                error!("Frame analysis error: {}", e);
                FrameOutcome::Failed(self.raise_error(&e.to_string()))
            }
            Err(join_error) => {
                error!("Frame analysis task failed: {}", join_error);
                FrameOutcome::Failed(self.raise_error(&join_error.to_string()))
            }
        }
    }

    async fn apply_detection(&self, detection: &Detection) {
        if detection.detected {
            let alert = self
                .alerts
                .lock()
                .record_detection(detection.description.clone(), detection.confidence);
            info!("🚨 {} ({:.0}%)", alert.message, detection.confidence * 100.0);
            let _ = self.events.send(MonitorEvent::AlertRaised(alert));

            self.chime.play();
            if self.notifier.permission() == NotificationPermission::Granted {
                self.notifier
                    .show(&self.settings.notification_title, &detection.description)
                    .await;
            }
        }
        let _ = self.events.send(MonitorEvent::FrameAnalyzed(detection.clone()));
    }

    fn raise_error(&self, message: &str) -> Alert {
        let alert = self.alerts.lock().record_error(message);
        let _ = self.events.send(MonitorEvent::AlertRaised(alert.clone()));
        alert
    }
}
