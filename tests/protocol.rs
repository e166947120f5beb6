//! Interaction protocol tests, driven through the transport-agnostic gateway

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    ScriptedLlm, ScriptedStt, TestClient, ambient_frame, kinds, new_session, speech_frame,
    test_gateway, test_registry,
};
use jsonwebtoken::{EncodingKey, Header, encode};
use secrecy::SecretString;
use serde_json::json;
use story_voice_gateway::api::auth::TokenClaims;
use story_voice_gateway::api::{Outbound, ProtocolGateway, TokenValidator, close_code};
use story_voice_gateway::db::SqliteTranscriptStore;
use story_voice_gateway::session::{SessionMode, SessionStatus};

const IDLE: Duration = Duration::from_secs(30);

/// Three seconds of 30 ms frames
const CALIBRATION_FRAMES: usize = 100;

async fn calibrate(client: &mut TestClient) -> serde_json::Value {
    client.send_type("start_calibration");
    let started = client.expect_event("calibration_started").await;
    assert!(started["durationMs"].as_u64().unwrap() > 0);

    for _ in 0..CALIBRATION_FRAMES {
        client.send_audio(ambient_frame());
    }
    client.send_type("complete_calibration");
    let completed = client.expect_event("calibration_completed").await;
    let status = client.expect_event("session_status_changed").await;
    assert_eq!(status["status"], "active");
    completed
}

#[tokio::test]
async fn test_interactive_conversation_end_to_end() {
    let stt = ScriptedStt::new(&["我想看小兔子", "大野狼在哪裡"]);
    let llm = ScriptedLlm::new(&["小兔子正在森林裡跳來跳去喔！", "這句不會送出"])
        .with_delays(&[Duration::ZERO, Duration::from_secs(3)]);
    let (_pool, registry) = test_registry(stt.clone(), llm.clone());
    let session = registry.create(new_session(SessionMode::Interactive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), Some("dev-token"));
    let established = client.next_event().await;
    assert_eq!(established["type"], "connection_established");
    assert_eq!(established["sessionId"], session.id());

    let completed = calibrate(&mut client).await;
    let floor = completed["noiseFloorDb"].as_f64().unwrap();
    assert!((-60.0..=-20.0).contains(&floor), "noise floor {floor}");
    assert!((floor - -50.0).abs() < 3.0, "noise floor {floor}");
    assert_eq!(completed["sampleCount"], CALIBRATION_FRAMES);
    assert_eq!(completed["calibrationDurationMs"], 3000);

    // first utterance
    client.send_type("speech_started");
    for _ in 0..50 {
        client.send_audio(speech_frame());
    }
    client.send(json!({"type": "speech_ended", "durationMs": 1000}));

    let transcription = client.expect_event("transcription_final").await;
    assert_eq!(transcription["text"], "我想看小兔子");
    assert!(transcription["segmentId"].as_str().is_some_and(|s| !s.is_empty()));
    client.expect_event("ai_processing_started").await;
    let response = client.expect_event("ai_response").await;
    assert_eq!(response["text"], "小兔子正在森林裡跳來跳去喔！");
    assert_eq!(response["isFallback"], false);

    // second utterance, interrupted while the model is thinking
    client.send_type("speech_started");
    for _ in 0..20 {
        client.send_audio(speech_frame());
    }
    client.send(json!({"type": "speech_ended", "durationMs": 600}));
    client.expect_event("transcription_final").await;
    client.expect_event("ai_processing_started").await;

    client.send_type("interrupt_ai");
    let items = client.drain_for(Duration::from_millis(3500)).await;
    let seen = kinds(&items);
    assert_eq!(
        seen.iter().filter(|k| *k == "ai_response_completed").count(),
        1,
        "{seen:?}"
    );
    assert!(!seen.iter().any(|k| k == "ai_response"), "{seen:?}");
    let completed = items
        .iter()
        .find_map(|item| match item {
            Outbound::Event(event) if event.kind() == "ai_response_completed" => {
                Some(serde_json::to_value(event).unwrap())
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(completed["wasInterrupted"], true);

    assert_eq!(session.history().len(), 3);
    assert_eq!(session.segments().len(), 2);

    client.close();
    client.task.await.unwrap();
}

#[tokio::test]
async fn test_ping_gets_exactly_one_pong() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    client.send_type("ping");
    let items = client.drain_for(Duration::from_millis(300)).await;
    assert_eq!(kinds(&items), vec!["pong"]);
}

#[tokio::test]
async fn test_unknown_message_type_keeps_connection_open() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    client.send(json!({"type": "dance", "timestamp": "2025-01-01T00:00:00Z"}));
    let error = client.next_event().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "unknown_message_type");
    assert_eq!(error["recoverable"], true);

    client.send_raw("{not json");
    let error = client.next_event().await;
    assert_eq!(error["code"], "invalid_json");

    client.send_type("ping");
    assert_eq!(client.next_event().await["type"], "pong");
}

#[tokio::test]
async fn test_end_session_sends_summary_then_closes() {
    let (pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    client.send_type("end_session");
    let status = client.next_event().await;
    assert_eq!(status["type"], "session_status_changed");
    assert_eq!(status["status"], "completed");

    let ended = client.next_event().await;
    assert_eq!(ended["type"], "session_ended");
    let transcript_id = ended["transcriptId"].as_str().unwrap().to_string();
    assert_eq!(ended["turnCount"], 0);

    assert_eq!(client.expect_close().await, close_code::NORMAL);
    client.task.await.unwrap();

    let stored = SqliteTranscriptStore::new(pool).get(&transcript_id).unwrap();
    assert!(stored.is_some());
    assert!(registry.get(session.id()).await.unwrap().is_none());
    assert_eq!(session.status(), SessionStatus::Completed);
}

#[tokio::test]
async fn test_idle_connection_expires() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, Duration::from_millis(300));

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    let error = client.next_event().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "session_expired");
    assert_eq!(error["recoverable"], false);
    assert_eq!(client.expect_close().await, close_code::SESSION_EXPIRED);
    client.task.await.unwrap();

    // the session outlives the connection until the reaper ends it
    assert_eq!(session.status(), SessionStatus::Active);
    assert!(session.detached_for().is_some());
}

#[tokio::test]
async fn test_traffic_keeps_connection_alive() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, Duration::from_millis(400));

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        client.send_type("ping");
        assert_eq!(client.next_event().await["type"], "pong");
    }
}

#[tokio::test]
async fn test_missing_token_is_rejected() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), None);
    assert_eq!(client.expect_close().await, close_code::UNAUTHORIZED);
}

#[tokio::test]
async fn test_unknown_session_is_rejected() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, "no-such-session", Some("t"));
    assert_eq!(client.expect_close().await, close_code::SESSION_NOT_FOUND);
}

fn signed_token(secret: &str, subject: &str) -> String {
    let claims = TokenClaims {
        sub: subject.to_string(),
        exp: u64::try_from(chrono::Utc::now().timestamp()).unwrap() + 600,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

#[tokio::test]
async fn test_token_subject_must_own_session() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let secret = SecretString::from("gateway-secret");
    let gateway = Arc::new(ProtocolGateway::new(
        Arc::clone(&registry),
        Arc::new(TokenValidator::new(Some(&secret))),
        IDLE,
    ));

    let mut stranger = TestClient::connect(
        &gateway,
        session.id(),
        Some(&signed_token("gateway-secret", "parent-2")),
    );
    assert_eq!(stranger.expect_close().await, close_code::UNAUTHORIZED);

    let mut forged = TestClient::connect(
        &gateway,
        session.id(),
        Some(&signed_token("other-secret", "parent-1")),
    );
    assert_eq!(forged.expect_close().await, close_code::UNAUTHORIZED);

    let mut owner = TestClient::connect(
        &gateway,
        session.id(),
        Some(&signed_token("gateway-secret", "parent-1")),
    );
    assert_eq!(owner.next_event().await["type"], "connection_established");
}

#[tokio::test]
async fn test_pause_twice_reports_invalid_transition() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    client.send_type("pause_session");
    let status = client.next_event().await;
    assert_eq!(status["status"], "paused");

    client.send_type("pause_session");
    let error = client.next_event().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "invalid_state_transition");
    assert_eq!(error["recoverable"], true);

    client.send_type("resume_session");
    assert_eq!(client.next_event().await["status"], "active");
}

#[tokio::test]
async fn test_speech_in_passive_mode_is_rejected() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    client.send_type("speech_started");
    let error = client.next_event().await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["recoverable"], true);
    assert!(!session.snapshot().is_speaking);
}

#[tokio::test]
async fn test_update_context_is_acknowledged() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Passive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    client.send(json!({
        "type": "update_context",
        "storyTitle": "三隻小豬",
        "currentScene": "磚頭房子",
        "playbackPositionMs": 42_000,
    }));
    assert_eq!(client.next_event().await["type"], "context_updated");

    let snapshot = session.snapshot();
    assert_eq!(snapshot.story.title, "三隻小豬");
    assert_eq!(snapshot.story.current_scene.as_deref(), Some("磚頭房子"));
    assert_eq!(snapshot.playback_position_ms, 42_000);
}

#[tokio::test]
async fn test_stop_listening_switches_to_passive() {
    let (_pool, registry) = test_registry(ScriptedStt::new(&[]), ScriptedLlm::new(&[]));
    let session = registry.create(new_session(SessionMode::Interactive)).await.unwrap();
    let gateway = test_gateway(&registry, IDLE);

    let mut client = TestClient::connect(&gateway, session.id(), Some("t"));
    client.expect_event("connection_established").await;

    client.send_type("stop_listening");
    let status = client.next_event().await;
    assert_eq!(status["status"], "active");
    assert_eq!(session.mode(), SessionMode::Passive);

    client.send_type("start_listening");
    let status = client.next_event().await;
    assert_eq!(status["status"], "calibrating");
    assert_eq!(session.mode(), SessionMode::Interactive);
}
