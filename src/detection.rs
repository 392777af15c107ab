use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Remote recognition service variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provider {
    /// Object/label annotation service (Google Cloud Vision).
    #[serde(rename = "google", alias = "structured-label")]
    StructuredLabel,
    /// Multimodal chat-completion service (OpenAI).
    #[serde(rename = "openai", alias = "natural-language")]
    NaturalLanguage,
}

impl Provider {
    pub const ALL: [Provider; 2] = [Provider::StructuredLabel, Provider::NaturalLanguage];

    /// Short identifier used in config files, logs and simulated descriptions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::StructuredLabel => "google",
            Provider::NaturalLanguage => "openai",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Provider::StructuredLabel => "Google Cloud Vision",
            Provider::NaturalLanguage => "OpenAI",
        }
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::StructuredLabel
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "google" | "structured-label" | "vision" => Ok(Provider::StructuredLabel),
            "openai" | "natural-language" | "gpt" => Ok(Provider::NaturalLanguage),
            other => Err(format!("unknown provider '{}' (expected google or openai)", other)),
        }
    }
}

/// Normalized rectangle, all fields in image-relative units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectHit {
    pub name: String,
    pub confidence: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

impl ObjectHit {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into().to_lowercase(),
            confidence: clamp_confidence(confidence),
            bounding_box: None,
        }
    }

    pub fn with_bounding_box(mut self, bounding_box: BoundingBox) -> Self {
        self.bounding_box = Some(bounding_box);
        self
    }
}

/// Canonical result of analyzing one frame against one target phrase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub detected: bool,
    pub confidence: f32,
    pub description: String,
    #[serde(default)]
    pub objects: Vec<ObjectHit>,
}

impl Detection {
    /// Re-establishes the confidence invariants on every score in the record.
    pub fn normalized(mut self) -> Self {
        self.confidence = clamp_confidence(self.confidence);
        for object in &mut self.objects {
            object.confidence = clamp_confidence(object.confidence);
        }
        self
    }
}

/// Maps any score into [0, 1]; NaN collapses to 0.
pub fn clamp_confidence(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_out_of_range_scores() {
        assert_eq!(clamp_confidence(1.7), 1.0);
        assert_eq!(clamp_confidence(-0.2), 0.0);
        assert_eq!(clamp_confidence(f32::NAN), 0.0);
        assert_eq!(clamp_confidence(0.42), 0.42);
    }

    #[test]
    fn provider_parses_from_cli_names() {
        assert_eq!("google".parse::<Provider>().unwrap(), Provider::StructuredLabel);
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::NaturalLanguage);
        assert!("azure".parse::<Provider>().is_err());
    }

    #[test]
    fn normalized_clamps_nested_objects() {
        let detection = Detection {
            detected: true,
            confidence: 3.0,
            description: "x".into(),
            objects: vec![ObjectHit {
                name: "cat".into(),
                confidence: -1.0,
                bounding_box: None,
            }],
        }
        .normalized();

        assert_eq!(detection.confidence, 1.0);
        assert_eq!(detection.objects[0].confidence, 0.0);
    }
}
