//! End-to-end call flow tests over the in-process doubles
//!
//! The SIP stack and media engine are mocks, the audio fork server and the
//! AI gateway stub are real sockets, and the speech chains run fake
//! providers. Together they exercise the same paths production takes:
//! state traces, resource teardown, conversation turns.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;

use voxbridge_call_engine::config::{DeviceConfig, EngineConfig};
use voxbridge_call_engine::conversation::SpeechStack;
use voxbridge_call_engine::device::DeviceRegistry;
use voxbridge_call_engine::engine::CallEngine;
use voxbridge_call_engine::media::mock::MockMediaEngine;
use voxbridge_call_engine::session::{CallMode, SessionEvent};
use voxbridge_call_engine::sip::mock::{InviteStep, MockDialogControl, MockSipStack};

use voxbridge_media_core::fork::{AudioForkServer, ForkConfig};
use voxbridge_speech_core::error::Result as SpeechResult;
use voxbridge_speech_core::gateway::{AiBridge, AiBridgeConfig};
use voxbridge_speech_core::stt::{SttChain, SttProvider};
use voxbridge_speech_core::tts::{TtsArtifact, TtsChain, TtsProvider, TtsRequest};
use voxbridge_speech_core::AudioStore;

struct InstantTts;

#[async_trait]
impl TtsProvider for InstantTts {
    fn name(&self) -> &'static str {
        "fake-tts"
    }

    async fn synthesize(&self, _request: &TtsRequest) -> SpeechResult<TtsArtifact> {
        Ok(TtsArtifact { bytes: b"ID3fake".to_vec(), extension: "mp3" })
    }
}

struct CannedStt(&'static str);

#[async_trait]
impl SttProvider for CannedStt {
    fn name(&self) -> &'static str {
        "fake-stt"
    }

    async fn transcribe(&self, _pcm: &[u8], _rate: u32, _lang: &str) -> SpeechResult<String> {
        Ok(self.0.to_string())
    }
}

/// Minimal HTTP responder that answers every request with the gateway
/// success envelope.
async fn spawn_gateway_stub(reply: &str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let body = format!(r#"{{"response":{{"speech":{{"plain":{{"speech":"{}"}}}}}}}}"#, reply);

    tokio::spawn(async move {
        loop {
            let Ok((mut sock, _)) = listener.accept().await else { return };
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 16384];
                let _ = sock.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = sock.write_all(reply.as_bytes()).await;
                let _ = sock.shutdown().await;
            });
        }
    });

    format!("http://{}", addr)
}

struct Harness {
    engine: Arc<CallEngine>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    sip: Arc<MockSipStack>,
    media: Arc<MockMediaEngine>,
    fork_port: u16,
    _audio_dir: tempfile::TempDir,
}

async fn harness(transcript: &'static str, ai_reply: &str) -> Harness {
    let fork_server = AudioForkServer::bind(ForkConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        expectation_timeout: Duration::from_secs(5),
        ..ForkConfig::default()
    })
    .await
    .unwrap();
    let fork_port = fork_server.local_addr().port();
    let expectations = fork_server.expectations();
    tokio::spawn(fork_server.run());

    let audio_dir = tempfile::tempdir().unwrap();
    let store = AudioStore::open(audio_dir.path(), "http://127.0.0.1:3100/audio-files").unwrap();
    let gateway_url = spawn_gateway_stub(ai_reply).await;

    let speech = Arc::new(SpeechStack {
        tts: Arc::new(TtsChain::with_providers(vec![Box::new(InstantTts)], store)),
        stt: Arc::new(SttChain::with_providers(vec![Box::new(CannedStt(transcript))])),
        ai: Arc::new(AiBridge::new(AiBridgeConfig::new(gateway_url))),
    });

    let devices = Arc::new(DeviceRegistry::new(
        &[
            DeviceConfig {
                extension: "12611".into(),
                name: "Morpheus".into(),
                language: Some("en".into()),
                greeting: Some("Hello, this is Morpheus.".into()),
                ..Default::default()
            },
            DeviceConfig {
                extension: "12612".into(),
                name: "Cephanie".into(),
                language: Some("he".into()),
                greeting: Some("שלום, כאן ספני.".into()),
                ..Default::default()
            },
        ],
        "en",
    ));

    let config = EngineConfig {
        external_address: "127.0.0.1".into(),
        ws_port: fork_port,
        ..Default::default()
    };

    let sip = MockSipStack::new();
    let media = MockMediaEngine::new();
    let (engine, events) = CallEngine::new(
        config,
        sip.clone(),
        media.clone(),
        speech,
        devices,
        expectations,
    );
    engine.start();

    Harness { engine, events, sip, media, fork_port, _audio_dir: audio_dir }
}

async fn collect_until_terminal(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<String> {
    let mut trace = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .expect("terminal event within deadline")
            .expect("events channel open");
        let terminal = event.event == "completed" || event.event == "failed";
        trace.push(event.event);
        if terminal {
            return trace;
        }
    }
}

fn speech_chunk() -> Vec<u8> {
    (0..320i16)
        .map(|i| if i % 2 == 0 { 16384i16 } else { -16384i16 })
        .flat_map(|s| s.to_le_bytes())
        .collect()
}

#[tokio::test]
async fn outbound_announce_runs_the_full_state_trace() {
    let mut h = harness("unused", "unused").await;

    let control = MockDialogControl::new("dlg-announce");
    h.sip.script_invite(vec![
        InviteStep::Ringing,
        InviteStep::Answer { control: control.clone(), remote_sdp: "v=0 remote".into() },
    ]);

    let call_id = h
        .engine
        .place_call(
            "+15551234567",
            "Backup complete.",
            CallMode::Announce,
            Some("Morpheus"),
            Duration::from_secs(30),
            None,
        )
        .unwrap();

    let trace = collect_until_terminal(&mut h.events).await;
    assert_eq!(trace, vec!["dialing", "ringing", "answered", "speaking", "completed"]);

    let snapshot = h.engine.call_snapshot(call_id.as_str()).await.unwrap();
    assert_eq!(snapshot.state, "completed");
    assert_eq!(snapshot.turn_count, 0);
    assert!(snapshot.duration.is_some());
    assert!(matches!(snapshot.mode, CallMode::Announce));

    // Target was rewritten for the trunk, From carries the device identity
    let invites = h.sip.invite_requests.lock();
    assert_eq!(invites[0].target_uri, "sip:95551234567@127.0.0.1");
    assert_eq!(invites[0].from_uri, "sip:12611@127.0.0.1");
    assert_eq!(invites[0].display_name.as_deref(), Some("Morpheus"));
    assert!(!invites[0].local_sdp.is_empty(), "early offer carries local SDP");
    drop(invites);

    // Endpoint torn down, dialog closed from our side
    let log = h.media.endpoint_log(0).unwrap();
    assert!(log.destroyed.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(control.hangup_count(), 1);
}

#[tokio::test]
async fn outbound_conversation_records_a_turn() {
    let mut h = harness("מה השעה?", "השעה שתים עשרה בדיוק").await;

    let control = MockDialogControl::new("dlg-conv");
    h.sip.script_invite(vec![
        InviteStep::Ringing,
        InviteStep::Answer { control: control.clone(), remote_sdp: "v=0 remote".into() },
    ]);

    let call_id = h
        .engine
        .place_call(
            "+15551234567",
            "",
            CallMode::Conversation,
            Some("Cephanie"),
            Duration::from_secs(30),
            None,
        )
        .unwrap();

    // Wait for the engine to attach the fork, then play the caller
    let forked = loop {
        if let Some(log) = h.media.endpoint_log(0) {
            if let Some(forked) = log.forked.lock().clone() {
                break forked;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(forked.1, call_id.to_string());
    assert_eq!(forked.0, format!("ws://127.0.0.1:{}/{}", h.fork_port, call_id));

    let (mut ws, _) = tokio_tungstenite::connect_async(&forked.0).await.unwrap();
    ws.send(Message::text(r#"{"sampleRate":16000}"#)).await.unwrap();
    for _ in 0..30 {
        ws.send(Message::binary(speech_chunk())).await.unwrap();
    }
    for _ in 0..80 {
        ws.send(Message::binary(vec![0u8; 640])).await.unwrap();
    }

    // One full turn lands in the session
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let snapshot = loop {
        let snapshot = h.engine.call_snapshot(call_id.as_str()).await.unwrap();
        if snapshot.turn_count >= 1 {
            break snapshot;
        }
        assert!(tokio::time::Instant::now() < deadline, "turn within deadline");
        tokio::time::sleep(Duration::from_millis(25)).await;
    };
    assert_eq!(snapshot.conversation[0].user, "מה השעה?");
    assert_eq!(snapshot.conversation[0].assistant, "השעה שתים עשרה בדיוק");

    // Remote BYE completes the call
    control.remote_hangup();
    let trace = collect_until_terminal(&mut h.events).await;
    assert!(trace.contains(&"speaking".to_string()) && trace.contains(&"listening".to_string()));

    let final_snapshot = h.engine.call_snapshot(call_id.as_str()).await.unwrap();
    assert_eq!(final_snapshot.state, "completed");
    assert!(h.media.endpoint_log(0).unwrap().destroyed.load(std::sync::atomic::Ordering::SeqCst));
    let _ = ws.close(None).await;
}

#[tokio::test]
async fn silent_ring_times_out_as_no_answer() {
    let mut h = harness("unused", "unused").await;
    h.sip.script_invite(vec![InviteStep::Silence]);

    h.engine
        .place_call(
            "+15550000000",
            "hello?",
            CallMode::Announce,
            Some("Morpheus"),
            Duration::from_millis(300),
            None,
        )
        .unwrap();

    let trace = collect_until_terminal(&mut h.events).await;
    assert_eq!(trace.last().map(String::as_str), Some("failed"));

    let calls = h.engine.list_calls().await;
    assert_eq!(calls[0].reason.as_deref(), Some("no_answer"));
    assert!(h.media.endpoint_log(0).unwrap().destroyed.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn busy_maps_to_its_reason() {
    let mut h = harness("unused", "unused").await;
    h.sip.script_invite(vec![InviteStep::Fail { code: 486, reason: "Busy Here".into() }]);

    let call_id = h
        .engine
        .place_call(
            "+15551112222",
            "msg",
            CallMode::Announce,
            Some("Morpheus"),
            Duration::from_secs(5),
            None,
        )
        .unwrap();

    collect_until_terminal(&mut h.events).await;
    let snapshot = h.engine.call_snapshot(call_id.as_str()).await.unwrap();
    assert_eq!(snapshot.state, "failed");
    assert_eq!(snapshot.reason.as_deref(), Some("busy"));
}

#[tokio::test]
async fn unknown_device_is_a_not_found() {
    let h = harness("unused", "unused").await;
    let err = h
        .engine
        .place_call("+15551234567", "m", CallMode::Announce, Some("Nobody"), Duration::from_secs(5), None)
        .unwrap_err();
    assert!(matches!(err, voxbridge_call_engine::CallEngineError::NotFound { .. }));
}

#[tokio::test]
async fn inbound_invite_is_answered_and_greeted() {
    let mut h = harness("what can you do?", "Plenty.").await;

    let control = MockDialogControl::new("dlg-in");
    let log = h.sip.inject_incoming("12611", "+15559876543", "v=0 caller", control.clone()).await;

    // Ringing + answer with our SDP
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if log.answered.lock().is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "answered within deadline");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(log.ringing_sent.load(std::sync::atomic::Ordering::SeqCst) >= 1);

    // State ran CREATED -> RINGING -> ACCEPTED -> ANSWERED -> SPEAKING
    let mut saw = Vec::new();
    for expected in ["ringing", "accepted", "answered", "speaking"] {
        let event = tokio::time::timeout(Duration::from_secs(5), h.events.recv())
            .await
            .expect("event within deadline")
            .unwrap();
        saw.push(event.event.clone());
        assert_eq!(event.event, expected, "trace so far: {:?}", saw);
    }

    // Remote SDP was bound to the endpoint before the 200 OK
    let ep = h.media.endpoint_log(0).unwrap();
    assert_eq!(ep.modified_with.lock().as_deref(), Some("v=0 caller"));

    // Caller hangs up; everything tears down
    control.remote_hangup();
    let calls = h.engine.list_calls().await;
    assert_eq!(calls.len(), 1);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let snapshot = h.engine.list_calls().await.into_iter().next().unwrap();
        if snapshot.state == "completed" {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "completion within deadline");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ep.destroyed.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn hangup_endpoint_cancels_a_live_call() {
    let mut h = harness("unused", "unused").await;

    let control = MockDialogControl::new("dlg-hang");
    h.sip.script_invite(vec![InviteStep::Answer {
        control: control.clone(),
        remote_sdp: "v=0 r".into(),
    }]);

    let call_id = h
        .engine
        .place_call("300", "", CallMode::Conversation, Some("Morpheus"), Duration::from_secs(5), None)
        .unwrap();

    // Let it get past answer, then force the hangup path
    tokio::time::sleep(Duration::from_millis(150)).await;
    h.engine.hangup(call_id.as_str()).unwrap();

    let trace = collect_until_terminal(&mut h.events).await;
    assert_eq!(trace.last().map(String::as_str), Some("completed"));
    assert!(h.engine.hangup("no-such-call").is_err());
}
