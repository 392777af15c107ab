use mockito::Matcher;
use serde_json::json;

use visionwatch::backend::{Credential, RecognitionBackend};
use visionwatch::camera::EncodedFrame;
use visionwatch::config::{RemoteModelConfig, VisionApiConfig};
use visionwatch::error::DetectionError;
use visionwatch::remote_model::RemoteModel;
use visionwatch::vision_api::VisionApiBackend;

fn frame() -> EncodedFrame {
    EncodedFrame::from_jpeg(vec![0xFF, 0xD8, 0xFF, 0xD9], 2, 2)
}

fn vision_backend(url: &str, key: Option<&str>) -> VisionApiBackend {
    VisionApiBackend::new(VisionApiConfig {
        base_url: format!("{}/annotate", url),
        api_key: key.map(str::to_string),
        ..VisionApiConfig::default()
    })
    .unwrap()
}

fn remote_backend(url: &str, key: Option<&str>) -> RemoteModel {
    RemoteModel::new(RemoteModelConfig {
        base_url: url.to_string(),
        api_key: key.map(str::to_string),
        ..RemoteModelConfig::default()
    })
    .unwrap()
}

fn chat_reply(content: &str) -> String {
    json!({
        "choices": [{ "message": { "role": "assistant", "content": content } }]
    })
    .to_string()
}

#[tokio::test]
async fn vision_api_matches_localized_object() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/annotate")
        .match_query(Matcher::UrlEncoded("key".into(), "vision-key".into()))
        .match_body(Matcher::PartialJson(json!({
            "requests": [{
                "image": { "content": "/9j/2Q==" },
                "features": [
                    { "type": "OBJECT_LOCALIZATION", "maxResults": 20 },
                    { "type": "LABEL_DETECTION", "maxResults": 20 }
                ]
            }]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "responses": [{
                    "localizedObjectAnnotations": [{
                        "name": "Dog",
                        "score": 0.87,
                        "boundingPoly": { "normalizedVertices": [
                            { "x": 0.1, "y": 0.2 }, { "x": 0.5, "y": 0.2 },
                            { "x": 0.5, "y": 0.9 }, { "x": 0.1, "y": 0.9 }
                        ]}
                    }],
                    "labelAnnotations": [{ "description": "Grass", "score": 0.95 }]
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;

    let backend = vision_backend(&server.url(), Some("vision-key"));
    let detection = backend.analyze(&frame(), "brown dog").await.unwrap();

    mock.assert_async().await;
    assert!(detection.detected);
    assert!((detection.confidence - 0.87).abs() < 1e-6);
    assert_eq!(detection.description, "Detected: dog (87% confidence)");
    assert_eq!(detection.objects.len(), 2);
    let bbox = detection.objects[0].bounding_box.as_ref().unwrap();
    assert!((bbox.width - 0.4).abs() < 1e-6);
    assert!((bbox.height - 0.7).abs() < 1e-6);
    println!("✅ Structured-label match parsed from mock server");
}

#[tokio::test]
async fn vision_api_reports_upstream_error_message() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/annotate")
        .match_query(Matcher::Any)
        .with_status(403)
        .with_body(json!({ "error": { "code": 403, "message": "API key not valid." } }).to_string())
        .create_async()
        .await;

    let backend = vision_backend(&server.url(), Some("bad-key"));
    match backend.analyze(&frame(), "person").await {
        Err(DetectionError::Upstream { status, message }) => {
            assert_eq!(status, 403);
            assert_eq!(message, "API key not valid.");
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn vision_api_falls_back_to_status_text() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/annotate")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("oops")
        .create_async()
        .await;

    let backend = vision_backend(&server.url(), Some("key"));
    match backend.analyze(&frame(), "person").await {
        Err(DetectionError::Upstream { status, message }) => {
            assert_eq!(status, 500);
            assert_eq!(message, "Internal Server Error");
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn vision_api_per_image_error_is_upstream() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/annotate")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({ "responses": [{ "error": { "code": 3, "message": "Bad image data." } }] }).to_string())
        .create_async()
        .await;

    let backend = vision_backend(&server.url(), Some("key"));
    let err = backend.analyze(&frame(), "person").await.unwrap_err();
    assert!(matches!(err, DetectionError::Upstream { status: 3, ref message } if message == "Bad image data."));
}

#[tokio::test]
async fn vision_api_without_match_is_negative() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/annotate")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(json!({ "responses": [{ "labelAnnotations": [{ "description": "Sky", "score": 0.99 }] }] }).to_string())
        .create_async()
        .await;

    let backend = vision_backend(&server.url(), Some("key"));
    let detection = backend.analyze(&frame(), "red car").await.unwrap();
    assert!(!detection.detected);
    assert_eq!(detection.confidence, 0.0);
    assert_eq!(detection.objects.len(), 1);
}

#[tokio::test]
async fn missing_credential_makes_no_request() {
    let mut server = mockito::Server::new_async().await;
    let vision_mock = server.mock("POST", "/annotate").match_query(Matcher::Any).expect(0).create_async().await;
    let chat_mock = server.mock("POST", "/chat/completions").expect(0).create_async().await;

    let vision = vision_backend(&server.url(), None);
    let err = vision.analyze(&frame(), "person").await.unwrap_err();
    assert!(matches!(err, DetectionError::Configuration(ref m) if m == "Google Cloud Vision API key not configured"));

    let remote = remote_backend(&server.url(), Some("   "));
    assert!(!remote.has_credential());
    let err = remote.analyze(&frame(), "person").await.unwrap_err();
    assert!(matches!(err, DetectionError::Configuration(ref m) if m == "OpenAI API key not configured"));

    vision_mock.assert_async().await;
    chat_mock.assert_async().await;
}

#[tokio::test]
async fn credential_set_at_runtime_is_used() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-runtime")
        .with_status(200)
        .with_body(chat_reply(r#"{"detected": false, "confidence": 0.1, "description": "Empty room"}"#))
        .create_async()
        .await;

    let remote = remote_backend(&server.url(), None);
    remote.set_credential(Credential::new("sk-runtime"));
    let detection = remote.analyze(&frame(), "cat").await.unwrap();

    mock.assert_async().await;
    assert!(!detection.detected);
    assert_eq!(detection.description, "Empty room");
}

#[tokio::test]
async fn remote_model_parses_json_wrapped_in_prose() {
    let mut server = mockito::Server::new_async().await;
    let reply = "Sure! Here is my analysis:\n```json\n{\"detected\": true, \"confidence\": 0.92, \
                 \"description\": \"A person in a red jacket {near the door}\", \
                 \"objects\": [{\"name\": \"Person\", \"confidence\": 0.92}]}\n```\nLet me know!";
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer sk-test")
        .match_body(Matcher::PartialJson(json!({
            "model": "gpt-4o",
            "max_tokens": 500,
            "messages": [{ "role": "user" }]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(chat_reply(reply))
        .create_async()
        .await;

    let remote = remote_backend(&server.url(), Some("sk-test"));
    let detection = remote.analyze(&frame(), "person wearing a red jacket").await.unwrap();

    mock.assert_async().await;
    assert!(detection.detected);
    assert!((detection.confidence - 0.92).abs() < 1e-6);
    assert_eq!(detection.description, "A person in a red jacket {near the door}");
    assert_eq!(detection.objects[0].name, "person");
    println!("✅ Natural-language reply parsed from mock server");
}

#[tokio::test]
async fn remote_model_error_status_is_upstream() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(401)
        .with_body("invalid api key")
        .create_async()
        .await;

    let remote = remote_backend(&server.url(), Some("sk-bad"));
    match remote.analyze(&frame(), "person").await {
        Err(DetectionError::Upstream { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "invalid api key");
        }
        other => panic!("expected upstream error, got {:?}", other),
    }
}

#[tokio::test]
async fn remote_model_reply_without_json_is_parse_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(chat_reply("I cannot tell from this picture."))
        .create_async()
        .await;

    let remote = remote_backend(&server.url(), Some("sk-test"));
    let err = remote.analyze(&frame(), "person").await.unwrap_err();
    assert!(matches!(err, DetectionError::Parse(_)));
}

#[tokio::test]
async fn remote_model_empty_content_is_parse_error() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_body(json!({ "choices": [] }).to_string())
        .create_async()
        .await;

    let remote = remote_backend(&server.url(), Some("sk-test"));
    let err = remote.analyze(&frame(), "person").await.unwrap_err();
    assert!(matches!(err, DetectionError::Parse(_)));
}
