use thiserror::Error;

/// Failure to acquire the microphone. The capture session stays idle.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Everything the engine can surface to its host.
///
/// Recoverable conditions (send failure, fetch failure, capture failure) are
/// also reported through the [`Notifier`](crate::engine::Notifier) so the
/// hosting view never has to crash on them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A send was attempted while the connection was not open. The payload
    /// was not delivered and the caller is told so.
    #[error("connection is not open")]
    ConnectionUnavailable,
    /// A new user message was submitted before the previous assistant turn
    /// finished.
    #[error("a reply is still in progress")]
    TurnInFlight,
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to load conversation history: {0}")]
    FetchFailed(String),
    /// An inbound event arrived with no matching turn or session. Logged and
    /// discarded, never shown to the user.
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
}
