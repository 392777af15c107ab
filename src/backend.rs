use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::camera::EncodedFrame;
use crate::detection::{Detection, Provider};
use crate::error::DetectionError;

/// Shortest key accepted from user input.
pub const MIN_CREDENTIAL_LEN: usize = 20;

/// Opaque API secret bound to one provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wraps a secret as-is apart from surrounding whitespace.
    pub fn new(secret: impl Into<String>) -> Self {
        let secret = secret.into();
        Self(secret.trim().to_string())
    }

    /// Validates a key typed in by the user: trimmed, non-blank and at least
    /// [`MIN_CREDENTIAL_LEN`] characters.
    pub fn parse(secret: &str) -> Result<Self, DetectionError> {
        let trimmed = secret.trim();
        if trimmed.is_empty() {
            return Err(DetectionError::Configuration("API key is empty".to_string()));
        }
        if trimmed.chars().count() < MIN_CREDENTIAL_LEN {
            return Err(DetectionError::Configuration(
                "API key appears to be too short".to_string(),
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(****)")
    }
}

/// Shared credential slot held by a backend. Writes replace the previous secret.
#[derive(Debug, Default)]
pub struct CredentialSlot(RwLock<Option<Credential>>);

impl CredentialSlot {
    pub fn new(initial: Option<Credential>) -> Self {
        Self(RwLock::new(initial))
    }

    pub fn set(&self, credential: Credential) {
        *self.0.write() = Some(credential);
    }

    pub fn get(&self) -> Option<Credential> {
        self.0.read().clone()
    }

    pub fn is_set(&self) -> bool {
        self.0.read().is_some()
    }
}

/// A remote recognition service that can judge one frame against a target phrase.
#[async_trait]
pub trait RecognitionBackend: Send + Sync {
    fn provider(&self) -> Provider;

    fn set_credential(&self, credential: Credential);

    fn has_credential(&self) -> bool;

    async fn analyze(&self, frame: &EncodedFrame, target: &str) -> Result<Detection, DetectionError>;
}

/// One backend per provider, built at setup time.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<Provider, Arc<dyn RecognitionBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn RecognitionBackend>) -> Self {
        self.register(backend);
        self
    }

    pub fn register(&mut self, backend: Arc<dyn RecognitionBackend>) {
        self.backends.insert(backend.provider(), backend);
    }

    pub fn get(&self, provider: Provider) -> Option<Arc<dyn RecognitionBackend>> {
        self.backends.get(&provider).cloned()
    }

    pub fn has_credential(&self, provider: Provider) -> bool {
        self.backends
            .get(&provider)
            .map(|b| b.has_credential())
            .unwrap_or(false)
    }
}
