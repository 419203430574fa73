/// The text currently staged for sending, shared between manual edits,
/// quick-prompt insertion and live transcription. Last writer wins; the
/// engine keeps manual writes out while a capture session is active.
#[derive(Debug, Default)]
pub struct ComposeBuffer {
    value: String,
}

impl ComposeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set(&mut self, text: impl Into<String>) {
        self.value = text.into();
    }

    pub fn clear(&mut self) {
        self.value.clear();
    }

    /// Take the staged text out, leaving the buffer empty.
    pub fn take(&mut self) -> String {
        std::mem::take(&mut self.value)
    }
}
