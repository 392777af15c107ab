use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{Credential, CredentialSlot, RecognitionBackend};
use crate::camera::EncodedFrame;
use crate::config::RemoteModelConfig;
use crate::detection::{clamp_confidence, BoundingBox, Detection, ObjectHit, Provider};
use crate::error::DetectionError;

const DEFAULT_DESCRIPTION: &str = "No description provided";

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: Vec<ContentPart>,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
struct ImageUrl {
    url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

/// Multimodal chat-completion backend that reasons about the frame in natural language.
pub struct RemoteModel {
    config: RemoteModelConfig,
    credential: CredentialSlot,
    client: reqwest::Client,
}

impl RemoteModel {
    pub fn new(config: RemoteModelConfig) -> Result<Self, DetectionError> {
        let timeout = Duration::from_secs(config.timeout_seconds.unwrap_or(60));

        let mut default_headers = reqwest::header::HeaderMap::new();
        default_headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );

        if let Some(additional_headers) = &config.additional_headers {
            for (key, value) in additional_headers {
                let name = reqwest::header::HeaderName::from_bytes(key.as_bytes())
                    .map_err(|e| DetectionError::Configuration(format!("Invalid header name '{}': {}", key, e)))?;
                let value = reqwest::header::HeaderValue::from_str(value)
                    .map_err(|e| DetectionError::Configuration(format!("Invalid header value for '{}': {}", key, e)))?;
                default_headers.insert(name, value);
            }
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("visionwatch/0.1")
            .default_headers(default_headers)
            .build()?;

        let credential = CredentialSlot::new(
            config
                .api_key
                .as_deref()
                .filter(|key| !key.trim().is_empty())
                .map(Credential::new),
        );

        info!("🌐 Initialized remote model client for: {}", config.model_name);
        info!("🔗 Base URL: {}", config.base_url);

        Ok(Self { config, credential, client })
    }

    fn build_request(&self, frame: &EncodedFrame, target: &str) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.config.model_name.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: vec![
                    ContentPart::Text { text: instruction(target) },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: frame.to_data_url(),
                            detail: self.config.image_detail.clone(),
                        },
                    },
                ],
            }],
            temperature: self.config.temperature,
            top_p: self.config.top_p,
            max_tokens: self.config.max_tokens,
        }
    }
}

#[async_trait]
impl RecognitionBackend for RemoteModel {
    fn provider(&self) -> Provider {
        Provider::NaturalLanguage
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

        let start_time = std::time::Instant::now();
        let request = self.build_request(frame, target);
        debug!("📤 Sending request to: {}/chat/completions", self.config.base_url);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')))
            .bearer_auth(credential.expose())
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(DetectionError::Upstream { status: status.as_u16(), message: error_text });
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| DetectionError::Parse(format!("Failed to parse response from remote model: {}", e)))?;

        let reply = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| DetectionError::Parse("No response content from remote model".to_string()))?;

        debug!("✅ Remote model response received in {}ms", start_time.elapsed().as_millis());

        parse_reply(&reply)
    }
}

fn instruction(target: &str) -> String {
    format!(
        r#"Analyze this image and determine if it contains "{target}".

Please respond with a JSON object in this exact format:
{{
  "detected": boolean,
  "confidence": number (0-1),
  "description": "detailed description of what you see and whether the prompt matches",
  "objects": [
    {{
      "name": "object name",
      "confidence": number (0-1)
    }}
  ]
}}

Be specific about what you detect and provide confidence scores. If you see the requested item "{target}", set detected to true with appropriate confidence. If not found, set detected to false."#
    )
}

/// Returns the first balanced `{...}` span, ignoring braces inside string literals.
pub fn extract_json_object(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in reply[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&reply[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses a free-form model reply into a detection, defaulting missing fields.
pub fn parse_reply(reply: &str) -> Result<Detection, DetectionError> {
    let json = extract_json_object(reply)
        .ok_or_else(|| DetectionError::Parse("Invalid JSON response from remote model".to_string()))?;

    let value: Value = serde_json::from_str(json)
        .map_err(|e| DetectionError::Parse(format!("Malformed JSON in model reply: {}", e)))?;

    let detected = value.get("detected").and_then(Value::as_bool).unwrap_or(false);
    let confidence = score(value.get("confidence"));
    let description = value
        .get("description")
        .and_then(Value::as_str)
        .filter(|d| !d.is_empty())
        .unwrap_or(DEFAULT_DESCRIPTION)
        .to_string();
    let objects = value
        .get("objects")
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(object_hit).collect())
        .unwrap_or_default();

    Ok(Detection {
        detected,
        confidence,
        description,
        objects,
    })
}

fn score(value: Option<&Value>) -> f32 {
    clamp_confidence(value.and_then(Value::as_f64).unwrap_or(0.0) as f32)
}

fn object_hit(value: &Value) -> Option<ObjectHit> {
    let name = value.get("name")?.as_str()?;
    let hit = ObjectHit::new(name, score(value.get("confidence")));
    let bbox = value
        .get("boundingBox")
        .and_then(|b| serde_json::from_value::<BoundingBox>(b.clone()).ok());
    Some(match bbox {
        Some(bbox) => hit.with_bounding_box(bbox),
        None => hit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_after_leading_prose() {
        let reply = r#"Sure! Here is my analysis: {"detected":true,"confidence":0.75,"description":"x","objects":[]}"#;
        let detection = parse_reply(reply).unwrap();
        assert_eq!(
            detection,
            Detection {
                detected: true,
                confidence: 0.75,
                description: "x".to_string(),
                objects: vec![],
            }
        );
    }

    #[test]
    fn reply_without_object_is_parse_error() {
        let err = parse_reply("I cannot see anything useful here.").unwrap_err();
        assert!(matches!(err, DetectionError::Parse(_)));
    }

    #[test]
    fn missing_fields_take_defaults() {
        let detection = parse_reply("{}").unwrap();
        assert!(!detection.detected);
        assert_eq!(detection.confidence, 0.0);
        assert_eq!(detection.description, DEFAULT_DESCRIPTION);
        assert!(detection.objects.is_empty());
    }

    #[test]
    fn braces_inside_strings_do_not_close_the_object() {
        let reply = r#"```json
{"detected": false, "description": "a sign reading \"}\" and {curly}"} trailing {junk}
```"#;
        let json = extract_json_object(reply).unwrap();
        assert!(json.ends_with(r#"{curly}"}"#));
        let detection = parse_reply(reply).unwrap();
        assert_eq!(detection.description, r#"a sign reading "}" and {curly}"#);
    }

    #[test]
    fn unbalanced_reply_is_parse_error() {
        assert!(extract_json_object(r#"{"detected": true"#).is_none());
        assert!(matches!(parse_reply(r#"{"detected": true"#), Err(DetectionError::Parse(_))));
    }

    #[test]
    fn object_scores_are_clamped_and_names_lowercased() {
        let reply = r#"{"detected":true,"confidence":1.4,"description":"Dog on sofa","objects":[{"name":"Dog","confidence":2},{"confidence":0.3}]}"#;
        let detection = parse_reply(reply).unwrap();
        assert_eq!(detection.confidence, 1.0);
        assert_eq!(detection.objects, vec![ObjectHit::new("dog", 1.0)]);
    }
}
