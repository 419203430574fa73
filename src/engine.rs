//! The conversation engine: one instance per mounted conversation view. Owns
//! the connection, the message list, the compose buffer and the capture
//! session; a pump task applies inbound events to them in arrival order.
//! Collaborators (history fetch, notification sink) are constructor-injected
//! so every test can run its own independent instance. Dropping the engine
//! tears everything down: capture stopped, microphone released, socket
//! closed, no handler left to fire into a dead view.

use crate::audio::{AudioBackend, CaptureSession, CaptureStatus, CpalBackend};
use crate::chat::{ChatLog, Message};
use crate::compose::ComposeBuffer;
use crate::connection::{Connection, ConnectionState};
use crate::error::EngineError;
use crate::protocol::{Outbound, ServerEvent};
use crate::service::ConversationSource;
use crate::settings::Settings;
use crate::transcript;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const EVENT_QUEUE: usize = 64;
const AUDIO_QUEUE: usize = 256;
const NOTE_QUEUE: usize = 8;

/// Sink for user-facing, non-fatal problem reports (the hosting view's
/// toast, a status line, anything). Never called for benign protocol races.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Fallback notifier for hosts without a notification surface.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        log::warn!("[notice] {}", message);
    }
}

struct Core {
    chat: ChatLog,
    compose: ComposeBuffer,
    capture: CaptureSession,
}

/// Internal lifecycle notes from worker tasks to the pump.
enum PumpNote {
    /// The audio queue drained and `end_recording` went out.
    CaptureDrained,
}

pub struct Conversation {
    core: Arc<Mutex<Core>>,
    conn: Connection,
    notifier: Arc<dyn Notifier>,
    notes_tx: mpsc::Sender<PumpNote>,
    user_id: Option<String>,
}

impl Conversation {
    /// Open the engine against the configured server with the real
    /// microphone backend. Must be called within a Tokio runtime.
    pub fn open(
        settings: &Settings,
        source: Arc<dyn ConversationSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Conversation {
        Self::open_with_backend(settings, source, notifier, Arc::new(CpalBackend))
    }

    /// Same as [`Conversation::open`] with an explicit audio backend.
    pub fn open_with_backend(
        settings: &Settings,
        source: Arc<dyn ConversationSource>,
        notifier: Arc<dyn Notifier>,
        backend: Arc<dyn AudioBackend>,
    ) -> Conversation {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let conn = Connection::open(settings.server_url.clone(), events_tx);

        let mic_device = if settings.mic_device.is_empty() {
            None
        } else {
            Some(settings.mic_device.clone())
        };
        let core = Arc::new(Mutex::new(Core {
            chat: ChatLog::new(),
            compose: ComposeBuffer::new(),
            capture: CaptureSession::new(
                backend,
                mic_device,
                settings.sample_rate,
                settings.chunk_ms,
            ),
        }));

        let (notes_tx, notes_rx) = mpsc::channel(NOTE_QUEUE);
        tokio::spawn(run_pump(core.clone(), events_rx, notes_rx));

        // Seed the list with persisted history; on failure the view stays
        // usable with an empty transcript.
        let fetch_core = core.clone();
        let fetch_notifier = notifier.clone();
        tokio::spawn(async move {
            match tokio::task::spawn_blocking(move || source.fetch()).await {
                Ok(Ok(messages)) => {
                    log::info!("[engine] loaded {} history messages", messages.len());
                    if let Ok(mut core) = fetch_core.lock() {
                        core.chat.seed(messages);
                    }
                }
                Ok(Err(e)) => {
                    log::warn!("[engine] {}", EngineError::FetchFailed(e));
                    fetch_notifier.notify(
                        "Something went wrong while fetching the messages, please try again",
                    );
                }
                Err(e) => {
                    log::warn!("[engine] history fetch task failed: {}", e);
                }
            }
        });

        Conversation {
            core,
            conn,
            notifier,
            notes_tx,
            user_id: if settings.user_id.is_empty() {
                None
            } else {
                Some(settings.user_id.clone())
            },
        }
    }

    pub fn messages(&self) -> Vec<Message> {
        self.core.lock().map(|c| c.chat.messages().to_vec()).unwrap_or_default()
    }

    pub fn awaiting_answer(&self) -> bool {
        self.core.lock().map(|c| c.chat.awaiting_answer()).unwrap_or(false)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn capture_status(&self) -> CaptureStatus {
        self.core
            .lock()
            .map(|c| c.capture.status())
            .unwrap_or(CaptureStatus::Idle)
    }

    pub fn draft(&self) -> String {
        self.core
            .lock()
            .map(|c| c.compose.value().to_string())
            .unwrap_or_default()
    }

    /// Manual edit of the compose buffer. Ignored while a capture session is
    /// active; the transcript is the only writer then.
    pub fn set_draft(&self, text: &str) {
        if let Ok(mut core) = self.core.lock() {
            if core.capture.status() != CaptureStatus::Idle {
                log::debug!("[engine] ignoring manual edit during capture");
                return;
            }
            core.compose.set(text);
        }
    }

    /// Stage one of the host's quick prompts. Same guarded path as typing.
    pub fn apply_quick_prompt(&self, text: &str) {
        self.set_draft(text);
    }

    /// Send whatever is staged in the compose buffer. Empty drafts are a
    /// no-op; the buffer is cleared before the send goes out.
    pub fn submit(&self) -> Result<(), EngineError> {
        let mut core = match self.core.lock() {
            Ok(core) => core,
            Err(_) => return Ok(()),
        };
        let text = core.compose.take();
        if text.trim().is_empty() {
            return Ok(());
        }
        self.send_locked(&mut core, text)
    }

    /// Send the given text as a new user turn: optimistic local append, then
    /// the outbound frame. A send failure is surfaced rather than swallowed;
    /// the appended message stays, to be reconciled when the server answers
    /// after a retry.
    pub fn send(&self, text: impl Into<String>) -> Result<(), EngineError> {
        let mut core = match self.core.lock() {
            Ok(core) => core,
            Err(_) => return Ok(()),
        };
        self.send_locked(&mut core, text.into())
    }

    fn send_locked(&self, core: &mut Core, text: String) -> Result<(), EngineError> {
        core.chat.append_user(text.clone())?;
        if let Err(e) = self.conn.send(Outbound::SendMessage {
            user_id: self.user_id.clone(),
            content: text,
        }) {
            self.notifier
                .notify("Something went wrong while sending the message, please try again");
            return Err(e);
        }
        Ok(())
    }

    /// Begin a capture session. No-op while one is already active; on
    /// acquisition failure nothing changes and the error is surfaced.
    pub fn start_capture(&self) -> Result<(), EngineError> {
        let (audio_tx, audio_rx) = mpsc::channel(AUDIO_QUEUE);
        {
            let mut core = match self.core.lock() {
                Ok(core) => core,
                Err(_) => return Ok(()),
            };
            if core.capture.status() != CaptureStatus::Idle {
                return Ok(());
            }
            if let Err(e) = core.capture.start(audio_tx) {
                log::warn!("[engine] capture start failed: {}", e);
                self.notifier.notify(&format!("Could not start the microphone: {e}"));
                return Err(e.into());
            }
            // Only now that the microphone is actually ours: live
            // transcription owns the draft from here.
            core.compose.clear();
        }

        let conn = self.conn.clone();
        let notes_tx = self.notes_tx.clone();
        tokio::spawn(forward_audio(audio_rx, conn, notes_tx));
        Ok(())
    }

    /// End the active capture session, if any.
    pub fn stop_capture(&self) {
        if let Ok(mut core) = self.core.lock() {
            core.capture.stop();
        }
    }

    /// Tear the engine down. Idempotent; also runs on drop.
    pub fn close(&self) {
        if let Ok(mut core) = self.core.lock() {
            core.capture.stop();
            core.capture.finish();
        }
        self.conn.close();
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ship captured chunks out in emission order; once the capture side closes
/// the channel, emit the terminal marker exactly once and report back.
async fn forward_audio(
    mut audio_rx: mpsc::Receiver<Vec<u8>>,
    conn: Connection,
    notes_tx: mpsc::Sender<PumpNote>,
) {
    while let Some(chunk) = audio_rx.recv().await {
        if let Err(e) = conn.send(Outbound::AudioChunk(chunk)) {
            log::warn!("[engine] dropping audio chunk: {}", e);
        }
    }
    if let Err(e) = conn.send(Outbound::EndRecording) {
        log::warn!("[engine] end_recording not delivered: {}", e);
    }
    let _ = notes_tx.send(PumpNote::CaptureDrained).await;
}

async fn run_pump(
    core: Arc<Mutex<Core>>,
    mut events_rx: mpsc::Receiver<ServerEvent>,
    mut notes_rx: mpsc::Receiver<PumpNote>,
) {
    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else { break };
                let Ok(mut core) = core.lock() else { break };
                match event {
                    ServerEvent::Message(snapshot) => {
                        if let Err(e) = core.chat.apply_snapshot(snapshot) {
                            // Benign race, not user-actionable.
                            log::debug!("[engine] {}", e);
                        }
                    }
                    ServerEvent::Transcript(event) => {
                        let Core { capture, compose, .. } = &mut *core;
                        transcript::apply(event, capture, compose);
                    }
                }
            }
            note = notes_rx.recv() => {
                let Some(note) = note else { break };
                match note {
                    PumpNote::CaptureDrained => {
                        if let Ok(mut core) = core.lock() {
                            core.capture.finish();
                        }
                    }
                }
            }
        }
    }
    log::debug!("[engine] event pump ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::InputHandle;
    use crate::error::CaptureError;
    use crate::service::NoHistory;
    use std::sync::mpsc::SyncSender;
    use std::time::Duration;

    struct NullBackend;
    struct NullHandle;

    impl InputHandle for NullHandle {}

    impl AudioBackend for NullBackend {
        fn open_input(
            &self,
            _device_name: Option<&str>,
            _frames_tx: SyncSender<Vec<f32>>,
        ) -> Result<(Box<dyn InputHandle>, u32), CaptureError> {
            Ok((Box::new(NullHandle), 16_000))
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, message: &str) {
            self.seen.lock().unwrap().push(message.to_string());
        }
    }

    fn offline_settings() -> Settings {
        Settings {
            // Nothing listens here; the connection never opens.
            server_url: "ws://127.0.0.1:9".into(),
            ..Settings::default()
        }
    }

    fn offline_engine(notifier: Arc<RecordingNotifier>) -> Conversation {
        Conversation::open_with_backend(
            &offline_settings(),
            Arc::new(NoHistory),
            notifier,
            Arc::new(NullBackend),
        )
    }

    struct DeniedBackend;

    impl AudioBackend for DeniedBackend {
        fn open_input(
            &self,
            _device_name: Option<&str>,
            _frames_tx: SyncSender<Vec<f32>>,
        ) -> Result<(Box<dyn InputHandle>, u32), CaptureError> {
            Err(CaptureError::PermissionDenied)
        }
    }

    #[tokio::test]
    async fn denied_microphone_leaves_the_draft_alone() {
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = Conversation::open_with_backend(
            &offline_settings(),
            Arc::new(NoHistory),
            notifier.clone(),
            Arc::new(DeniedBackend),
        );
        engine.set_draft("half-typed thought");

        let err = engine.start_capture().unwrap_err();
        assert!(matches!(
            err,
            EngineError::Capture(CaptureError::PermissionDenied)
        ));
        assert_eq!(engine.capture_status(), CaptureStatus::Idle);
        assert_eq!(engine.draft(), "half-typed thought");
        assert_eq!(notifier.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn send_while_disconnected_is_surfaced_not_swallowed() {
        let notifier = Arc::new(RecordingNotifier::default());
        let engine = offline_engine(notifier.clone());

        let err = engine.send("Hello").unwrap_err();
        assert!(matches!(err, EngineError::ConnectionUnavailable));
        // The optimistic append still happened and a notification went out.
        assert_eq!(engine.messages().len(), 1);
        assert_eq!(notifier.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_submit_is_a_no_op() {
        let engine = offline_engine(Arc::new(RecordingNotifier::default()));
        engine.set_draft("   ");
        engine.submit().unwrap();
        assert!(engine.messages().is_empty());
    }

    #[tokio::test]
    async fn manual_edits_are_ignored_while_capturing() {
        let engine = offline_engine(Arc::new(RecordingNotifier::default()));
        engine.set_draft("typed before");
        engine.start_capture().unwrap();
        assert_eq!(engine.capture_status(), CaptureStatus::Recording);
        // Starting the capture claimed the draft.
        assert_eq!(engine.draft(), "");

        engine.set_draft("typed during");
        assert_eq!(engine.draft(), "");

        engine.stop_capture();
        // The forward task drains, emits end_recording (undeliverable here,
        // logged) and reports back; the session then reads idle again.
        let mut status = engine.capture_status();
        for _ in 0..50 {
            if status == CaptureStatus::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = engine.capture_status();
        }
        assert_eq!(status, CaptureStatus::Idle);

        engine.set_draft("typed after");
        assert_eq!(engine.draft(), "typed after");
    }
}
