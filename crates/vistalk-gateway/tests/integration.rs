//! Gateway integration tests: start a real gateway over stub backends and
//! talk to it over HTTP.
//!
//! Run with: `cargo test -p vistalk-gateway --test integration`

use std::sync::Arc;

use base64::Engine;
use serde_json::json;

use vistalk_core::config::Config;
use vistalk_core::{StreamEvent, WireFormat};
use vistalk_gateway::GatewayState;
use vistalk_media::AudioStore;
use vistalk_pipeline::PipelineContext;
use vistalk_pipeline::testing::{StubCamera, StubSpeech, StubVision, stub_context};

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a gateway over `pipeline` and return its port.
async fn start_test_gateway(pipeline: PipelineContext) -> u16 {
    let port = find_free_port();
    let config = Config::parse(r#"{ gateway: { bind: "127.0.0.1" } }"#).unwrap();
    let state = Arc::new(GatewayState::new(Arc::new(config), Arc::new(pipeline)));

    tokio::spawn(async move {
        let _ = vistalk_gateway::start_gateway(state, port).await;
    });

    // Wait for gateway to be ready
    for _ in 0..50 {
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .is_ok()
        {
            break;
        }
    }
    port
}

fn default_pipeline() -> PipelineContext {
    stub_context(
        StubCamera::working(),
        StubVision::replying("I see a **soldering iron**. It is hot."),
        StubSpeech::seconds(1.5),
    )
}

fn png_base64() -> String {
    let mut out = std::io::Cursor::new(Vec::new());
    image::RgbImage::new(4, 4)
        .write_to(&mut out, image::ImageFormat::Png)
        .unwrap();
    base64::engine::general_purpose::STANDARD.encode(out.into_inner())
}

async fn post_stream(port: u16, path: &str, body: serde_json::Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}{path}"))
        .json(&body)
        .send()
        .await
        .expect("chat request failed")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_health_endpoint() {
    let port = start_test_gateway(default_pipeline()).await;

    for path in ["/health", "/api/chat/health"] {
        let resp = reqwest::get(format!("http://127.0.0.1:{port}{path}"))
            .await
            .expect("Health request failed");
        assert!(resp.status().is_success());
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["model_loaded"], true);
        assert_eq!(body["capture_available"], true);
        assert_eq!(body["model"], "stub-vlm");
        assert!(body["version"].is_string());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cameras_endpoint() {
    let port = start_test_gateway(default_pipeline()).await;
    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/api/chat/cameras"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cameras"][0]["device"], "stub");

    let absent = stub_context(
        StubCamera::absent(),
        StubVision::replying("ok"),
        StubSpeech::seconds(1.0),
    );
    let port = start_test_gateway(absent).await;
    let body: serde_json::Value = reqwest::get(format!("http://127.0.0.1:{port}/api/chat/cameras"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["cameras"], json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_video_capture_returns_jpeg() {
    let port = start_test_gateway(default_pipeline()).await;
    let status_url = format!("http://127.0.0.1:{port}/api/video/status");

    let before: serde_json::Value = reqwest::get(&status_url).await.unwrap().json().await.unwrap();
    assert_eq!(before["available"], true);
    assert_eq!(before["device"], "stub");
    assert!(before["width"].is_null());

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/video/capture"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "image/jpeg");
    let bytes = resp.bytes().await.unwrap();
    assert_eq!(&bytes[..2], &[0xFF, 0xD8]);

    let after: serde_json::Value = reqwest::get(&status_url).await.unwrap().json().await.unwrap();
    assert_eq!(after["width"], 8);
    assert_eq!(after["height"], 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_video_capture_without_camera() {
    let absent = stub_context(
        StubCamera::absent(),
        StubVision::replying("ok"),
        StubSpeech::seconds(1.0),
    );
    let port = start_test_gateway(absent).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/video/capture"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "capture");

    let status: serde_json::Value =
        reqwest::get(format!("http://127.0.0.1:{port}/api/video/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
    assert_eq!(status["available"], false);
    assert!(status["width"].is_null());
    assert!(status["height"].is_null());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_sse_event_order() {
    let port = start_test_gateway(default_pipeline()).await;

    let resp = post_stream(port, "/api/chat", json!({ "prompt": "what do you see?" })).await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );
    assert_eq!(resp.headers()["cache-control"].to_str().unwrap(), "no-cache");

    let body = resp.text().await.unwrap();
    let events = WireFormat::Sse.decode(&body).unwrap();
    let kinds: Vec<&str> = events.iter().map(StreamEvent::kind).collect();

    let deltas = kinds.iter().take_while(|k| **k == "text-delta").count();
    assert!(deltas > 0);
    assert_eq!(&kinds[deltas..], ["text-complete", "audio-chunk", "done"]);

    let joined: String = events[..deltas]
        .iter()
        .map(|e| match e {
            StreamEvent::TextDelta { delta } => delta.clone(),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(joined, "I see a soldering iron.");

    match &events[deltas + 1] {
        StreamEvent::AudioChunk(chunk) => {
            assert_eq!(chunk.encoding, "wav");
            assert!((chunk.duration - 1.5).abs() < 0.01);
            assert!(chunk.is_final);
            assert!(chunk.audio_url.is_none());
        }
        other => panic!("expected audio-chunk, got {other:?}"),
    }
    match events.last().unwrap() {
        StreamEvent::Done { full_text } => assert_eq!(full_text, "I see a soldering iron."),
        other => panic!("expected done, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_ndjson_on_realtime_route() {
    let port = start_test_gateway(default_pipeline()).await;

    let resp = post_stream(
        port,
        "/api/chat/realtime?format=ndjson",
        json!({ "messages": [{ "role": "user", "content": "hi" }], "enable_tts": false }),
    )
    .await;
    assert!(resp.status().is_success());
    assert_eq!(
        resp.headers()["content-type"].to_str().unwrap(),
        "application/x-ndjson"
    );

    let body = resp.text().await.unwrap();
    for line in body.lines() {
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(value["type"].is_string());
    }
    let events = WireFormat::Ndjson.decode(&body).unwrap();
    assert!(events.iter().all(|e| e.kind() != "audio-chunk"));
    assert_eq!(events.last().unwrap().kind(), "done");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_rejects_missing_prompt() {
    let port = start_test_gateway(default_pipeline()).await;

    let resp = post_stream(port, "/api/chat", json!({ "max_tokens": 20 })).await;
    assert_eq!(resp.status(), 400);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "protocol");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_rejects_malformed_json() {
    let port = start_test_gateway(default_pipeline()).await;

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/chat"))
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stream_capture_failure_is_single_error_event() {
    let vision = StubVision::replying("unused");
    let pipeline = stub_context(StubCamera::broken(), vision.clone(), StubSpeech::seconds(1.0));
    let port = start_test_gateway(pipeline).await;

    let body = post_stream(port, "/api/chat", json!({ "prompt": "look" }))
        .await
        .text()
        .await
        .unwrap();
    let events = WireFormat::Sse.decode(&body).unwrap();
    assert_eq!(events.len(), 1);
    match &events[0] {
        StreamEvent::Error { kind, error } => {
            assert_eq!(*kind, vistalk_core::ErrorKind::Capture);
            assert!(error.contains("Failed to capture webcam frame"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(vision.calls(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_webcam_chat_document() {
    let pipeline = stub_context(
        StubCamera::working(),
        StubVision::replying("Here you go. ROBOT_ACTION: pass_screwdriver"),
        StubSpeech::seconds(1.0),
    );
    let port = start_test_gateway(pipeline).await;

    let resp = post_stream(port, "/api/chat/webcam", json!({ "prompt": "hand me that" })).await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["ai_response"], "Here you go.");
    assert_eq!(body["prompt"], "hand me that");
    assert_eq!(body["has_webcam"], true);
    assert_eq!(body["audio"]["encoding"], "wav");
    assert_eq!(body["action"]["name"], "pass_screwdriver");
    assert_eq!(body["action"]["dispatched"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_webcam_chat_capture_failure_status() {
    let pipeline = stub_context(
        StubCamera::absent(),
        StubVision::replying("unused"),
        StubSpeech::seconds(1.0),
    );
    let port = start_test_gateway(pipeline).await;

    let resp = post_stream(port, "/api/chat/webcam", json!({ "prompt": "look" })).await;
    assert_eq!(resp.status(), 503);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "capture");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_image_chat_skips_camera() {
    let camera = StubCamera::working();
    let vision = StubVision::replying("A small black square.");
    let pipeline = stub_context(camera.clone(), vision.clone(), StubSpeech::seconds(1.0));
    let port = start_test_gateway(pipeline).await;

    let resp = post_stream(
        port,
        "/api/chat/image",
        json!({ "image_base64": png_base64(), "prompt": "describe", "enable_tts": false }),
    )
    .await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["ai_response"], "A small black square.");
    assert_eq!(body["has_webcam"], false);
    assert!(body.get("audio").is_none());
    assert_eq!(camera.reads(), 0);
    assert!(vision.prompts()[0].1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_image_chat_rejects_bad_image() {
    let port = start_test_gateway(default_pipeline()).await;

    let resp = post_stream(
        port,
        "/api/chat/image",
        json!({ "image_base64": "not-an-image", "prompt": "describe" }),
    )
    .await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tts_endpoint() {
    let port = start_test_gateway(default_pipeline()).await;

    let resp = post_stream(port, "/api/chat/tts", json!({ "text": "Hello." })).await;
    assert!(resp.status().is_success());
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["encoding"], "wav");
    assert_eq!(body["text"], "Hello.");
    let audio = base64::engine::general_purpose::STANDARD
        .decode(body["audio_data"].as_str().unwrap())
        .unwrap();
    assert!(audio.starts_with(b"RIFF"));

    let empty = post_stream(port, "/api/chat/tts", json!({ "text": "  " })).await;
    assert_eq!(empty.status(), 400);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tts_engine_failure_is_bad_gateway() {
    let pipeline = stub_context(
        StubCamera::working(),
        StubVision::replying("ok"),
        StubSpeech::failing(),
    );
    let port = start_test_gateway(pipeline).await;

    let resp = post_stream(port, "/api/chat/tts", json!({ "text": "Hello." })).await;
    assert_eq!(resp.status(), 502);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["kind"], "synthesis");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_published_audio_is_served() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = default_pipeline().with_audio_store(AudioStore::open(dir.path()).unwrap());
    let port = start_test_gateway(pipeline).await;

    let body = post_stream(port, "/api/chat", json!({ "prompt": "look" }))
        .await
        .text()
        .await
        .unwrap();
    let events = WireFormat::Sse.decode(&body).unwrap();
    let url = events
        .iter()
        .find_map(|e| match e {
            StreamEvent::AudioChunk(chunk) => chunk.audio_url.clone(),
            _ => None,
        })
        .expect("audio_url advertised");

    let resp = reqwest::get(format!("http://127.0.0.1:{port}{url}")).await.unwrap();
    assert!(resp.status().is_success());
    assert_eq!(resp.headers()["content-type"].to_str().unwrap(), "audio/wav");
    assert_eq!(
        resp.headers()["cache-control"].to_str().unwrap(),
        "no-cache, no-store, must-revalidate"
    );
    assert_eq!(resp.headers()["pragma"].to_str().unwrap(), "no-cache");
    assert_eq!(resp.headers()["expires"].to_str().unwrap(), "0");
    assert!(resp.bytes().await.unwrap().starts_with(b"RIFF"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_audio_retrieval_errors() {
    let dir = tempfile::tempdir().unwrap();
    let pipeline = default_pipeline().with_audio_store(AudioStore::open(dir.path()).unwrap());
    let port = start_test_gateway(pipeline).await;

    let bad = reqwest::get(format!("http://127.0.0.1:{port}/api/chat/audio/notes.txt"))
        .await
        .unwrap();
    assert_eq!(bad.status(), 400);

    let missing = reqwest::get(format!("http://127.0.0.1:{port}/api/chat/audio/tts_missing.wav"))
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_audio_retrieval_without_store() {
    let port = start_test_gateway(default_pipeline()).await;

    let resp = reqwest::get(format!("http://127.0.0.1:{port}/api/chat/audio/tts_1.wav"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}
