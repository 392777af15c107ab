pub mod alerts;
pub mod audio;
pub mod backend;
pub mod camera;
pub mod config;
pub mod detection;
pub mod error;
pub mod normalizer;
pub mod notify;
pub mod pipeline;
pub mod remote_model;
pub mod vision_api;

pub use backend::{BackendRegistry, Credential, RecognitionBackend};
pub use camera::{EncodedFrame, FrameSource, FrameSourceState};
pub use config::WatchConfig;
pub use detection::{Detection, ObjectHit, Provider};
pub use error::{DetectionError, StartError};
pub use pipeline::{FrameOutcome, MonitorEvent, MonitorPipeline, MonitorState};
