use crate::audio::{CaptureSession, CaptureStatus};
use crate::compose::ComposeBuffer;
use crate::protocol::TranscriptEvent;

/// Apply one transcript event against the current capture session.
///
/// A transcript that arrives while nothing is recording is a late straggler
/// (the session was stopped manually or by an earlier final); it stops the
/// session again and its text is discarded. Otherwise the text, which
/// is the full transcription so far rather than a delta, replaces the
/// compose buffer, and a final transcript ends the session.
pub fn apply(event: TranscriptEvent, capture: &mut CaptureSession, compose: &mut ComposeBuffer) {
    if capture.status() != CaptureStatus::Recording {
        log::debug!("[transcript] event outside an active session, discarding");
        capture.stop();
        return;
    }
    compose.set(event.text);
    if event.is_final {
        capture.stop();
    }
}
