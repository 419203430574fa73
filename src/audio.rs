//! Microphone capture: one acquisition-to-transcription lifecycle at a time.
//!
//! A cpal input stream delivers raw f32 frames into a bounded channel; a
//! processing thread resamples them to the configured rate, converts to
//! 16-bit little-endian PCM and emits one chunk per 250ms of audio into the
//! engine's audio channel. Closing that channel is the end-of-stream signal:
//! the engine sends `end_recording` only after the last queued chunk, so
//! audio can never follow the terminal marker.

use crate::error::CaptureError;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc as async_mpsc;

/// Queue depth between the capture callback and the processing thread.
const RAW_FRAME_QUEUE: usize = 128;
/// How often the processor re-checks liveness while the mic is silent.
const PROCESSOR_POLL_MS: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Idle,
    Recording,
    /// Recorder halted, chunk queue still draining toward `end_recording`.
    Finalizing,
}

/// A live microphone acquisition. Dropping the handle releases the device.
pub trait InputHandle: Send {}

/// Seam between the capture session and the actual audio host, so tests can
/// run a fake microphone.
pub trait AudioBackend: Send + Sync {
    /// Acquire the input device and deliver mono f32 frames to `frames_tx`
    /// until the returned handle is dropped. Returns the rate the frames
    /// arrive at, which need not match the requested rate.
    fn open_input(
        &self,
        device_name: Option<&str>,
        frames_tx: SyncSender<Vec<f32>>,
    ) -> Result<(Box<dyn InputHandle>, u32), CaptureError>;
}

pub struct CaptureSession {
    backend: Arc<dyn AudioBackend>,
    device_name: Option<String>,
    sample_rate: u32,
    chunk_ms: u32,
    status: CaptureStatus,
    active: Option<ActiveCapture>,
}

struct ActiveCapture {
    /// Owns the device for the lifetime of the recording.
    handle: Box<dyn InputHandle>,
    /// Cleared on stop; the processor checks it before every forward.
    live: Arc<AtomicBool>,
}

impl CaptureSession {
    pub fn new(
        backend: Arc<dyn AudioBackend>,
        device_name: Option<String>,
        sample_rate: u32,
        chunk_ms: u32,
    ) -> Self {
        Self {
            backend,
            device_name,
            sample_rate: sample_rate.max(1),
            chunk_ms: chunk_ms.max(1),
            status: CaptureStatus::Idle,
            active: None,
        }
    }

    pub fn status(&self) -> CaptureStatus {
        self.status
    }

    /// Acquire the microphone and start streaming chunks into `audio_tx`.
    /// No-op unless idle; on acquisition failure the status stays idle and
    /// nothing was taken.
    pub fn start(&mut self, audio_tx: async_mpsc::Sender<Vec<u8>>) -> Result<(), CaptureError> {
        if self.status != CaptureStatus::Idle {
            return Ok(());
        }

        let (frames_tx, frames_rx) = std::sync::mpsc::sync_channel::<Vec<f32>>(RAW_FRAME_QUEUE);
        let (handle, input_rate) = self
            .backend
            .open_input(self.device_name.as_deref(), frames_tx)?;

        let live = Arc::new(AtomicBool::new(true));
        let chunk_bytes =
            ((self.sample_rate as usize * 2 * self.chunk_ms as usize) / 1000).max(2);
        let target_rate = self.sample_rate;
        let processor_live = live.clone();
        std::thread::spawn(move || {
            run_processor(
                frames_rx,
                audio_tx,
                processor_live,
                input_rate,
                target_rate,
                chunk_bytes,
            );
        });

        self.active = Some(ActiveCapture { handle, live });
        self.status = CaptureStatus::Recording;
        log::info!(
            "[audio] capture started: input={}Hz target={}Hz chunk={}ms",
            input_rate,
            target_rate,
            self.chunk_ms
        );
        Ok(())
    }

    /// Halt the recorder and release the device. Safe from any state; chunks
    /// produced after this point are discarded, and the engine emits
    /// `end_recording` once the already-queued tail has drained.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.live.store(false, Ordering::SeqCst);
            drop(active.handle);
            self.status = CaptureStatus::Finalizing;
            log::info!("[audio] capture stopped, draining chunk queue");
        }
    }

    /// The chunk queue has drained and `end_recording` went out. Only acts
    /// while finalizing, so a drain report from an already-ended session
    /// cannot touch a newer one.
    pub fn finish(&mut self) {
        if self.status == CaptureStatus::Finalizing {
            self.status = CaptureStatus::Idle;
        }
    }
}

fn run_processor(
    frames_rx: Receiver<Vec<f32>>,
    audio_tx: async_mpsc::Sender<Vec<u8>>,
    live: Arc<AtomicBool>,
    input_rate: u32,
    target_rate: u32,
    chunk_bytes: usize,
) {
    let mut resampler = ResamplerState::default();
    let mut pending: Vec<u8> = Vec::with_capacity(chunk_bytes * 2);

    while live.load(Ordering::SeqCst) {
        let frames = match frames_rx.recv_timeout(Duration::from_millis(PROCESSOR_POLL_MS)) {
            Ok(f) => f,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        let samples = if input_rate == target_rate {
            frames
        } else {
            resample_linear(&frames, input_rate, target_rate, &mut resampler)
        };
        for &sample in &samples {
            let clamped = (sample * 32767.0).clamp(-32768.0, 32767.0) as i16;
            pending.extend_from_slice(&clamped.to_le_bytes());
        }

        while pending.len() >= chunk_bytes {
            if !live.load(Ordering::SeqCst) {
                return;
            }
            let chunk: Vec<u8> = pending.drain(..chunk_bytes).collect();
            match audio_tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("[audio] chunk queue full, dropping chunk");
                }
                Err(TrySendError::Closed(_)) => return,
            }
        }
    }
    // audio_tx drops here; the closed channel tells the engine the stream
    // is complete.
    log::debug!("[audio] processor thread exiting");
}

/// Production backend: cpal host, device lookup, stream on an owner thread.
pub struct CpalBackend;

struct CpalInput {
    stop_tx: std::sync::mpsc::Sender<()>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl InputHandle for CpalInput {}

impl Drop for CpalInput {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl AudioBackend for CpalBackend {
    fn open_input(
        &self,
        device_name: Option<&str>,
        frames_tx: SyncSender<Vec<f32>>,
    ) -> Result<(Box<dyn InputHandle>, u32), CaptureError> {
        let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<u32, CaptureError>>(1);
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let device_name = device_name.map(String::from);

        let join = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(device_name.as_deref(), frames_tx) {
                    Ok((stream, rate)) => {
                        let _ = ready_tx.send(Ok(rate));
                        stream
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                // Park until released; dropping the stream stops the device.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| CaptureError::DeviceUnavailable(format!("capture thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(rate)) => Ok((
                Box::new(CpalInput {
                    stop_tx,
                    join: Some(join),
                }),
                rate,
            )),
            Ok(Err(e)) => {
                let _ = join.join();
                Err(e)
            }
            Err(_) => {
                let _ = join.join();
                Err(CaptureError::DeviceUnavailable(
                    "capture thread died during setup".into(),
                ))
            }
        }
    }
}

fn build_input_stream(
    device_name: Option<&str>,
    frames_tx: SyncSender<Vec<f32>>,
) -> Result<(cpal::Stream, u32), CaptureError> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name {
        host.input_devices()
            .map_err(|e| CaptureError::DeviceUnavailable(format!("device list: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::DeviceUnavailable(format!("device '{name}' not found")))?
    } else {
        host.default_input_device()
            .ok_or_else(|| CaptureError::DeviceUnavailable("no default input device".into()))?
    };

    let default = device
        .default_input_config()
        .map_err(|e| map_acquire_error(e.to_string()))?;
    let config = StreamConfig {
        channels: default.channels(),
        sample_rate: default.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    let rate = config.sample_rate.0;
    let channels = config.channels as usize;
    log::info!(
        "[audio] using device '{}' at {}Hz {}ch",
        device.name().unwrap_or_else(|_| "unknown".into()),
        rate,
        channels
    );

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Downmix to mono if the device is stereo.
                let mono: Vec<f32> = if channels > 1 {
                    data.chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect()
                } else {
                    data.to_vec()
                };
                let _ = frames_tx.try_send(mono);
            },
            |err| {
                log::warn!("[audio] stream error: {}", err);
            },
            None,
        )
        .map_err(|e| map_acquire_error(e.to_string()))?;

    stream
        .play()
        .map_err(|e| map_acquire_error(e.to_string()))?;

    Ok((stream, rate))
}

/// cpal reports OS permission refusals as backend-specific errors; classify
/// by message so the caller can tell "denied" from "not there".
fn map_acquire_error(message: String) -> CaptureError {
    let lowered = message.to_lowercase();
    if lowered.contains("permission") || lowered.contains("denied") || lowered.contains("access") {
        CaptureError::PermissionDenied
    } else {
        CaptureError::DeviceUnavailable(message)
    }
}

#[derive(Default)]
struct ResamplerState {
    /// Fractional read position past the carried sample, in input samples.
    offset: f64,
    carry: Option<f32>,
}

/// Streaming linear interpolation. The last input sample of each call is
/// carried into the next so interpolation stays continuous across chunk
/// boundaries.
fn resample_linear(
    samples: &[f32],
    input_rate: u32,
    target_rate: u32,
    state: &mut ResamplerState,
) -> Vec<f32> {
    if samples.is_empty() || input_rate == target_rate {
        return samples.to_vec();
    }

    let mut buf = Vec::with_capacity(samples.len() + 1);
    if let Some(carry) = state.carry {
        buf.push(carry);
    }
    buf.extend_from_slice(samples);

    let step = input_rate as f64 / target_rate as f64;
    let mut out = Vec::with_capacity((samples.len() as f64 / step) as usize + 2);
    let mut pos = state.offset;
    let last_index = buf.len() - 1;
    loop {
        let base = pos as usize;
        if base >= last_index {
            break;
        }
        let frac = (pos - base as f64) as f32;
        out.push(buf[base] + (buf[base + 1] - buf[base]) * frac);
        pos += step;
    }

    state.offset = pos - last_index as f64;
    state.carry = Some(buf[last_index]);
    out
}
