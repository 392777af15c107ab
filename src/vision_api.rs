use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{Credential, CredentialSlot, RecognitionBackend};
use crate::camera::EncodedFrame;
use crate::config::VisionApiConfig;
use crate::detection::{clamp_confidence, BoundingBox, Detection, ObjectHit, Provider};
use crate::error::DetectionError;

/// Best match must beat this score to count as a detection.
pub const MATCH_THRESHOLD: f32 = 0.3;

#[derive(Serialize)]
struct AnnotateRequest {
    requests: Vec<AnnotateImageRequest>,
}

#[derive(Serialize)]
struct AnnotateImageRequest {
    image: ImageContent,
    features: Vec<Feature>,
}

#[derive(Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
    max_results: u32,
}

#[derive(Deserialize, Default)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageAnnotations>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ImageAnnotations {
    #[serde(default)]
    localized_object_annotations: Vec<LocalizedObject>,
    #[serde(default)]
    label_annotations: Vec<LabelAnnotation>,
    error: Option<ApiStatus>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocalizedObject {
    #[serde(default)]
    name: String,
    #[serde(default)]
    score: f32,
    bounding_poly: Option<BoundingPoly>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BoundingPoly {
    #[serde(default)]
    normalized_vertices: Vec<Vertex>,
}

#[derive(Deserialize)]
struct Vertex {
    x: Option<f32>,
    y: Option<f32>,
}

#[derive(Deserialize)]
struct LabelAnnotation {
    #[serde(default)]
    description: String,
    #[serde(default)]
    score: f32,
}

#[derive(Deserialize)]
struct ApiStatus {
    code: Option<u16>,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiStatus>,
}

/// Object localization + label detection backend.
pub struct VisionApiBackend {
    config: VisionApiConfig,
    credential: CredentialSlot,
    client: reqwest::Client,
}

impl VisionApiBackend {
    pub fn new(config: VisionApiConfig) -> Result<Self, DetectionError> {
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(30));
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("visionwatch/0.1")
            .build()?;

        let credential = CredentialSlot::new(
            config
                .api_key
                .as_deref()
                .filter(|key| !key.trim().is_empty())
                .map(Credential::new),
        );

        info!("🔎 Initialized structured-label client for: {}", config.base_url);

        Ok(Self { config, credential, client })
    }

    fn build_request(&self, frame: &EncodedFrame) -> AnnotateRequest {
        AnnotateRequest {
            requests: vec![AnnotateImageRequest {
                image: ImageContent { content: frame.to_base64() },
                features: vec![
                    Feature { kind: "OBJECT_LOCALIZATION", max_results: self.config.max_results },
                    Feature { kind: "LABEL_DETECTION", max_results: self.config.max_results },
                ],
            }],
        }
    }
}

#[async_trait]
impl RecognitionBackend for VisionApiBackend {
    fn provider(&self) -> Provider {
        Provider::StructuredLabel
    }

    fn set_credential(&self, credential: Credential) {
        self.credential.set(credential);
    }

    fn has_credential(&self) -> bool {
        self.credential.is_set()
    }

    async fn analyze(&self, frame: &EncodedFrame, target: &str) -> Result<Detection, DetectionError> {
        let credential = self
            .credential
            .get()
            .ok_or_else(|| DetectionError::missing_credential(self.provider()))?;

        let request = self.build_request(frame);
        debug!("📤 Sending {} byte frame to {}", frame.jpeg.len(), self.config.base_url);

        let response = self
            .client
            .post(&self.config.base_url)
            .query(&[("key", credential.expose())])
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&body)
                .ok()
                .and_then(|e| e.error)
                .map(|e| e.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown error").to_string());
            return Err(DetectionError::Upstream { status: status.as_u16(), message });
        }

        let body: AnnotateResponse = response
            .json()
            .await
            .map_err(|e| DetectionError::Parse(format!("invalid annotate response: {}", e)))?;

        let annotations = body
            .responses
            .into_iter()
            .next()
            .ok_or_else(|| DetectionError::Parse("annotate response contained no results".to_string()))?;

        if let Some(error) = annotations.error {
            return Err(DetectionError::Upstream {
                status: error.code.unwrap_or(status.as_u16()),
                message: error.message,
            });
        }

        let candidates = collect_candidates(annotations);
        debug!("Vision API returned {} candidates", candidates.len());
        Ok(match_target(candidates, target))
    }
}

/// Localized objects first, then labels, all names lowercased.
fn collect_candidates(annotations: ImageAnnotations) -> Vec<ObjectHit> {
    let objects = annotations.localized_object_annotations.into_iter().map(|obj| {
        let hit = ObjectHit::new(obj.name, obj.score);
        match obj.bounding_poly.and_then(|poly| bounding_box(&poly.normalized_vertices)) {
            Some(bbox) => hit.with_bounding_box(bbox),
            None => hit,
        }
    });
    let labels = annotations
        .label_annotations
        .into_iter()
        .map(|label| ObjectHit::new(label.description, label.score));

    objects.chain(labels).collect()
}

fn bounding_box(vertices: &[Vertex]) -> Option<BoundingBox> {
    if vertices.len() < 2 {
        return None;
    }
    let xs = vertices.iter().map(|v| v.x.unwrap_or(0.0));
    let ys = vertices.iter().map(|v| v.y.unwrap_or(0.0));
    let (min_x, max_x) = xs.fold((f32::MAX, f32::MIN), |(lo, hi), x| (lo.min(x), hi.max(x)));
    let (min_y, max_y) = ys.fold((f32::MAX, f32::MIN), |(lo, hi), y| (lo.min(y), hi.max(y)));

    Some(BoundingBox {
        x: min_x,
        y: min_y,
        width: max_x - min_x,
        height: max_y - min_y,
    })
}

fn names_overlap(candidate: &str, target_words: &[&str], target: &str) -> bool {
    let word_hit = target_words.iter().any(|target_word| {
        candidate
            .split_whitespace()
            .any(|word| word.contains(target_word) || target_word.contains(word))
    });
    word_hit || candidate.contains(target) || target.contains(candidate)
}

/// Picks the highest-scoring candidate whose name overlaps the target phrase.
///
/// Only strictly higher scores replace the current best, so the first of
/// several equal scores wins. A detection needs a best score above
/// [`MATCH_THRESHOLD`].
pub fn match_target(candidates: Vec<ObjectHit>, target: &str) -> Detection {
    let target_lower = target.to_lowercase();
    let target_words: Vec<&str> = target_lower
        .split_whitespace()
        .filter(|word| word.chars().count() > 2)
        .collect();

    let mut best: Option<usize> = None;
    let mut best_confidence = 0.0f32;

    for (index, candidate) in candidates.iter().enumerate() {
        if names_overlap(&candidate.name, &target_words, &target_lower) && candidate.confidence > best_confidence {
            best = Some(index);
            best_confidence = candidate.confidence;
        }
    }

    let best_confidence = clamp_confidence(best_confidence);
    let detected = best.is_some() && best_confidence > MATCH_THRESHOLD;

    let description = match best {
        Some(index) if detected => format!(
            "Detected: {} ({}% confidence)",
            candidates[index].name,
            (best_confidence * 100.0).round() as u32
        ),
        _ => format!("No \"{}\" detected in current frame", target),
    };

    Detection {
        detected,
        confidence: best_confidence,
        description,
        objects: candidates,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hits(pairs: &[(&str, f32)]) -> Vec<ObjectHit> {
        pairs.iter().map(|(name, score)| ObjectHit::new(*name, *score)).collect()
    }

    #[test]
    fn person_beats_dog_for_person_target() {
        let detection = match_target(hits(&[("person", 0.9), ("dog", 0.4)]), "person");
        assert!(detection.detected);
        assert_eq!(detection.confidence, 0.9);
        assert_eq!(detection.description, "Detected: person (90% confidence)");
    }

    #[test]
    fn low_scores_without_overlap_miss() {
        let detection = match_target(hits(&[("tree", 0.2), ("sky", 0.1)]), "car");
        assert!(!detection.detected);
        assert_eq!(detection.confidence, 0.0);
        assert_eq!(detection.description, "No \"car\" detected in current frame");
    }

    #[test]
    fn match_at_threshold_is_not_a_detection() {
        let detection = match_target(hits(&[("cat", 0.3)]), "cat");
        assert!(!detection.detected);
        assert_eq!(detection.confidence, 0.3);
    }

    #[test]
    fn first_of_equal_scores_wins() {
        let detection = match_target(hits(&[("red car", 0.8), ("car door", 0.8)]), "car");
        assert_eq!(detection.description, "Detected: red car (80% confidence)");
    }

    #[test]
    fn short_target_words_only_match_by_full_name() {
        // "a" and "of" are dropped, "cup" survives
        let detection = match_target(hits(&[("coffee cup", 0.7)]), "a cup of");
        assert!(detection.detected);

        // full phrase contains the candidate name
        let detection = match_target(hits(&[("ox", 0.6)]), "an ox");
        assert!(detection.detected);
    }

    #[test]
    fn bounding_box_spans_vertex_extremes() {
        let vertices = vec![
            Vertex { x: Some(0.1), y: Some(0.2) },
            Vertex { x: Some(0.5), y: None },
            Vertex { x: None, y: Some(0.6) },
        ];
        let bbox = bounding_box(&vertices).unwrap();
        assert_eq!(bbox.x, 0.0);
        assert_eq!(bbox.y, 0.0);
        assert_eq!(bbox.width, 0.5);
        assert_eq!(bbox.height, 0.6);

        assert!(bounding_box(&vertices[..1]).is_none());
    }
}
