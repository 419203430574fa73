//! End-to-end engine flows against a loopback WebSocket server.

use futures_util::{SinkExt, StreamExt};
use parlance::{
    AudioBackend, CaptureError, CaptureStatus, ConnectionState, Conversation, InputHandle,
    NoHistory, Notifier, Role, Settings,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;

struct QuietNotifier {
    seen: Mutex<Vec<String>>,
}

impl QuietNotifier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
        })
    }
}

impl Notifier for QuietNotifier {
    fn notify(&self, message: &str) {
        self.seen.lock().unwrap().push(message.to_string());
    }
}

/// Microphone stand-in: the test pushes f32 frames by hand.
struct FakeMic {
    frames_tx: Mutex<Option<SyncSender<Vec<f32>>>>,
    live_handles: Arc<AtomicUsize>,
}

struct FakeMicHandle {
    live: Arc<AtomicUsize>,
}

impl InputHandle for FakeMicHandle {}

impl Drop for FakeMicHandle {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeMic {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames_tx: Mutex::new(None),
            live_handles: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn push(&self, frames: Vec<f32>) {
        self.frames_tx
            .lock()
            .unwrap()
            .as_ref()
            .expect("capture not running")
            .send(frames)
            .unwrap();
    }
}

impl AudioBackend for FakeMic {
    fn open_input(
        &self,
        _device_name: Option<&str>,
        frames_tx: SyncSender<Vec<f32>>,
    ) -> Result<(Box<dyn InputHandle>, u32), CaptureError> {
        *self.frames_tx.lock().unwrap() = Some(frames_tx);
        self.live_handles.fetch_add(1, Ordering::SeqCst);
        Ok((
            Box::new(FakeMicHandle {
                live: self.live_handles.clone(),
            }),
            16_000,
        ))
    }
}

async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

fn settings_for(addr: std::net::SocketAddr) -> Settings {
    Settings {
        server_url: format!("ws://{addr}"),
        user_id: "u-test".into(),
        ..Settings::default()
    }
}

fn text_frame(raw: &str) -> WsMessage {
    WsMessage::Text(raw.into())
}

#[tokio::test]
async fn optimistic_send_reconciles_against_snapshots() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (go_tx, go_rx) = tokio::sync::oneshot::channel::<()>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // First inbound frame must be the send, identity attached.
        let msg = ws.next().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(value["event"], "send_message");
        assert_eq!(value["userId"], "u-test");
        assert_eq!(value["content"], "Hello");

        ws.send(text_frame(
            r#"{"event":"message","textSnapshot":"Hi","referencesSnapshot":[],"finished":false}"#,
        ))
        .await
        .unwrap();

        // Hold the finishing snapshot until the test has observed the
        // intermediate state.
        go_rx.await.unwrap();
        ws.send(text_frame(
            r#"{"event":"message","textSnapshot":"Hi there","referencesSnapshot":[{"id":"r1","downloadURL":"https://files/r1","displayName":"notes.pdf"}],"finished":true}"#,
        ))
        .await
        .unwrap();

        while let Some(Ok(_)) = ws.next().await {}
    });

    let engine = Conversation::open_with_backend(
        &settings_for(addr),
        Arc::new(NoHistory),
        QuietNotifier::new(),
        FakeMic::new(),
    );
    wait_until("connection open", || {
        engine.connection_state() == ConnectionState::Open
    })
    .await;

    engine.send("Hello").unwrap();
    assert!(engine.awaiting_answer());
    let messages = engine.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Hello");

    wait_until("first snapshot", || {
        engine.messages().len() == 2 && engine.messages()[1].content == "Hi"
    })
    .await;
    assert!(engine.awaiting_answer());

    go_tx.send(()).unwrap();
    wait_until("finishing snapshot", || !engine.awaiting_answer()).await;
    let messages = engine.messages();
    assert_eq!(messages.len(), 2, "snapshots mutate, never append");
    assert_eq!(messages[1].content, "Hi there");
    assert_eq!(messages[1].references.len(), 1);
    assert_eq!(messages[1].references[0].display_name, "notes.pdf");

    engine.close();
    server.await.unwrap();
}

#[tokio::test]
async fn capture_streams_chunks_then_transcript_ends_the_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Two chunks, in emission order: the first carries 0.1-level
        // samples, the second 0.2-level ones.
        let mut expected = [3276_i16, 6553_i16].into_iter();
        while let Some(first) = expected.next() {
            let msg = ws.next().await.unwrap().unwrap();
            assert!(msg.is_binary(), "audio must arrive as binary frames");
            let data = msg.into_data();
            assert_eq!(data.len(), 8000, "250ms at 16kHz, 16-bit mono");
            assert_eq!(i16::from_le_bytes([data[0], data[1]]), first);
        }

        ws.send(text_frame(
            r#"{"event":"transcript","text":"hel","isFinal":false}"#,
        ))
        .await
        .unwrap();
        ws.send(text_frame(
            r#"{"event":"transcript","text":"hello","isFinal":true}"#,
        ))
        .await
        .unwrap();

        // The only thing left on the wire is the terminal marker.
        let mut saw_end_recording = 0;
        while let Some(Ok(msg)) = ws.next().await {
            if msg.is_close() {
                break;
            }
            assert!(!msg.is_binary(), "no audio may follow end_recording");
            if msg.is_text() {
                let value: serde_json::Value =
                    serde_json::from_str(msg.to_text().unwrap()).unwrap();
                assert_eq!(value["event"], "end_recording");
                saw_end_recording += 1;
            }
        }
        assert_eq!(saw_end_recording, 1, "end_recording exactly once");
    });

    let mic = FakeMic::new();
    let engine = Conversation::open_with_backend(
        &settings_for(addr),
        Arc::new(NoHistory),
        QuietNotifier::new(),
        mic.clone(),
    );
    wait_until("connection open", || {
        engine.connection_state() == ConnectionState::Open
    })
    .await;

    engine.start_capture().unwrap();
    assert_eq!(engine.capture_status(), CaptureStatus::Recording);
    assert_eq!(mic.live_handles.load(Ordering::SeqCst), 1);

    // 250ms of audio per push at 16kHz.
    mic.push(vec![0.1_f32; 4000]);
    mic.push(vec![0.2_f32; 4000]);

    wait_until("interim transcript staged", || engine.draft() == "hel").await;
    assert_eq!(engine.capture_status(), CaptureStatus::Recording);

    wait_until("final transcript ends the session", || {
        engine.capture_status() == CaptureStatus::Idle
    })
    .await;
    assert_eq!(engine.draft(), "hello");
    assert_eq!(
        mic.live_handles.load(Ordering::SeqCst),
        0,
        "microphone released"
    );

    engine.close();
    server.await.unwrap();
}

#[tokio::test]
async fn dropped_link_reconnects_and_keeps_working() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        // First connection: accept the handshake, then hang up.
        let (stream, _) = listener.accept().await.unwrap();
        let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        drop(ws);

        // Second connection: answer one turn.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let msg = ws.next().await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(msg.to_text().unwrap()).unwrap();
        assert_eq!(value["event"], "send_message");
        ws.send(text_frame(
            r#"{"event":"message","textSnapshot":"back online","referencesSnapshot":[],"finished":true}"#,
        ))
        .await
        .unwrap();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let engine = Conversation::open_with_backend(
        &settings_for(addr),
        Arc::new(NoHistory),
        QuietNotifier::new(),
        FakeMic::new(),
    );

    // The hangup parks the engine in the backoff window (>= 1s, so the
    // 25ms polls cannot miss it); retries never give up, so the link comes
    // back on its own.
    wait_until("link loss noticed", || {
        engine.connection_state() == ConnectionState::Reconnecting
    })
    .await;
    wait_until("reconnected", || {
        engine.connection_state() == ConnectionState::Open
    })
    .await;

    engine.send("ping").unwrap();
    wait_until("turn completes after reconnect", || {
        !engine.awaiting_answer()
            && engine
                .messages()
                .last()
                .map(|m| m.content == "back online")
                .unwrap_or(false)
    })
    .await;

    engine.close();
    server.await.unwrap();
}
