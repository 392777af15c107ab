use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, warn};

use crate::backend::RecognitionBackend;
use crate::camera::EncodedFrame;
use crate::config::FallbackConfig;
use crate::detection::{clamp_confidence, Detection, Provider};
use crate::error::DetectionError;

/// Source of uniform draws in [0, 1).
pub trait RandomSource: Send + Sync {
    fn next_f64(&self) -> f64;
}

/// Seedable generator; `from_entropy` for production, `seeded` for tests.
pub struct StdRandom(Mutex<StdRng>);

impl StdRandom {
    pub fn from_entropy() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }

    pub fn seeded(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }
}

impl RandomSource for StdRandom {
    fn next_f64(&self) -> f64 {
        self.0.lock().gen::<f64>()
    }
}

/// Replays a fixed script of draws, repeating the last one when exhausted.
pub struct ScriptedRandom {
    draws: Mutex<VecDeque<f64>>,
    last: Mutex<f64>,
}

impl ScriptedRandom {
    pub fn new(draws: impl IntoIterator<Item = f64>) -> Self {
        Self {
            draws: Mutex::new(draws.into_iter().collect()),
            last: Mutex::new(0.0),
        }
    }
}

impl RandomSource for ScriptedRandom {
    fn next_f64(&self) -> f64 {
        let mut last = self.last.lock();
        if let Some(draw) = self.draws.lock().pop_front() {
            *last = draw;
        }
        *last
    }
}

/// Wraps backend calls and substitutes a simulated detection when they fail.
pub struct DetectionNormalizer {
    fallback: FallbackConfig,
    random: Box<dyn RandomSource>,
}

impl DetectionNormalizer {
    pub fn new(fallback: FallbackConfig, random: Box<dyn RandomSource>) -> Self {
        Self { fallback, random }
    }

    /// Runs one analysis. Backend failures never escape; only an empty frame does.
    pub async fn detect(
        &self,
        backend: &dyn RecognitionBackend,
        frame: &EncodedFrame,
        target: &str,
    ) -> Result<Detection, DetectionError> {
        if frame.is_empty() {
            return Err(DetectionError::EmptyFrame);
        }

        match backend.analyze(frame, target).await {
            Ok(detection) => {
                debug!(
                    "{} analysis: detected={} confidence={:.2}",
                    backend.provider(),
                    detection.detected,
                    detection.confidence
                );
                Ok(detection.normalized())
            }
            Err(e) => {
                warn!("AI detection error from {}: {}", backend.provider(), e);
                warn!("Falling back to simulated detection due to API error");
                tokio::time::sleep(Duration::from_millis(self.fallback.delay_ms)).await;
                Ok(self.simulate(backend.provider(), target))
            }
        }
    }

    /// Heuristic placeholder result used when the provider call failed.
    pub fn simulate(&self, provider: Provider, target: &str) -> Detection {
        let target_lower = target.to_lowercase();
        let has_common_keyword = target_lower
            .split_whitespace()
            .any(|word| self.fallback.vocabulary.iter().any(|known| known == word));

        let draw = self.random.next_f64();
        let detected = has_common_keyword && draw > self.fallback.threshold;
        let confidence = if detected {
            0.8 + self.random.next_f64() * 0.2
        } else {
            draw
        };

        let description = if detected {
            format!("Detected: {} (simulated - {} API failed)", target, provider)
        } else {
            format!("No {} detected in current frame (simulated - {} API failed)", target, provider)
        };

        Detection {
            detected,
            confidence: clamp_confidence(confidence as f32),
            description,
            objects: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer(draws: &[f64]) -> DetectionNormalizer {
        DetectionNormalizer::new(
            FallbackConfig { delay_ms: 0, ..FallbackConfig::default() },
            Box::new(ScriptedRandom::new(draws.to_vec())),
        )
    }

    #[test]
    fn high_draw_with_known_word_is_simulated_hit() {
        let detection = normalizer(&[0.9, 0.5]).simulate(Provider::StructuredLabel, "brown dog");
        assert!(detection.detected);
        assert!((0.8..=1.0).contains(&detection.confidence));
        assert_eq!(detection.description, "Detected: brown dog (simulated - google API failed)");
    }

    #[test]
    fn mid_draw_is_simulated_miss_with_draw_as_confidence() {
        let detection = normalizer(&[0.5]).simulate(Provider::NaturalLanguage, "dog");
        assert!(!detection.detected);
        assert_eq!(detection.confidence, 0.5);
        assert_eq!(
            detection.description,
            "No dog detected in current frame (simulated - openai API failed)"
        );
    }

    #[test]
    fn unknown_words_never_hit() {
        let detection = normalizer(&[0.99]).simulate(Provider::StructuredLabel, "giraffe");
        assert!(!detection.detected);
        assert!((detection.confidence - 0.99).abs() < 1e-6);
    }

    #[test]
    fn seeded_source_is_reproducible() {
        let a = StdRandom::seeded(7);
        let b = StdRandom::seeded(7);
        for _ in 0..5 {
            let draw = a.next_f64();
            assert_eq!(draw, b.next_f64());
            assert!((0.0..1.0).contains(&draw));
        }
    }
}
