//! One persistent socket per mounted conversation view. A single task owns
//! the WebSocket for the life of the view: it connects, pumps frames in both
//! directions, and on any loss of the link reconnects forever with a capped
//! backoff. Because that task is the only thing that ever touches a socket,
//! events from a stale connection cannot be delivered after a reconnect, and
//! ending the task drops the event sender so nothing fires into a torn-down
//! view.

use crate::error::EngineError;
use crate::protocol::{self, Outbound, ServerEvent};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::connect_async;

const RECONNECT_BASE_MS: u64 = 1_000;
const RECONNECT_MAX_MS: u64 = 5_000;
const OUTBOUND_QUEUE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Delay before reconnect attempt `attempt` (1-based). Non-decreasing,
/// starting at 1s and capped at 5s; retries never stop on their own.
fn reconnect_delay_ms(attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(10);
    let factor = 1u64 << exp;
    RECONNECT_BASE_MS.saturating_mul(factor).min(RECONNECT_MAX_MS)
}

/// Handle to the connection task. Cheap to clone; all clones share the one
/// underlying socket.
#[derive(Clone)]
pub struct Connection {
    outbound_tx: mpsc::Sender<Outbound>,
    state_rx: watch::Receiver<ConnectionState>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
}

impl Connection {
    /// Establish the connection and start pumping. Decoded inbound events
    /// are delivered on `events_tx` in the order the remote side emitted
    /// them (FIFO per connection).
    pub fn open(url: String, events_tx: mpsc::Sender<ServerEvent>) -> Connection {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let shutdown = Arc::new(Notify::new());
        let closed = Arc::new(AtomicBool::new(false));

        let task_shutdown = shutdown.clone();
        let task_closed = closed.clone();
        tokio::spawn(async move {
            run_connection(url, outbound_rx, events_tx, state_tx, task_shutdown, task_closed)
                .await;
        });

        Connection {
            outbound_tx,
            state_rx,
            shutdown,
            closed,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Queue a frame for delivery. Fails fast while the connection is not
    /// open; payloads are never silently dropped.
    pub fn send(&self, frame: Outbound) -> Result<(), EngineError> {
        if self.state() != ConnectionState::Open {
            return Err(EngineError::ConnectionUnavailable);
        }
        self.outbound_tx
            .try_send(frame)
            .map_err(|_| EngineError::ConnectionUnavailable)
    }

    /// Tear the connection down. Idempotent; safe to call any number of
    /// times. The owning task stops delivering events before the socket is
    /// closed.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            // notify_one stores the wakeup, so the task sees it even if it
            // is not parked on the shutdown future right now.
            self.shutdown.notify_one();
        }
    }
}

async fn run_connection(
    url: String,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    events_tx: mpsc::Sender<ServerEvent>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
) {
    let mut attempts: u32 = 0;
    let mut connected_before = false;
    loop {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        attempts += 1;
        let _ = state_tx.send(if connected_before || attempts > 1 {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Connecting
        });
        if connected_before || attempts > 1 {
            log::info!("[connection] reconnecting (attempt {})", attempts);
        }

        let connected = tokio::select! {
            result = connect_async(url.as_str()) => result,
            _ = shutdown.notified() => break,
        };

        let ws_stream = match connected {
            Ok((stream, _)) => stream,
            Err(e) => {
                let delay_ms = reconnect_delay_ms(attempts);
                log::warn!(
                    "[connection] connect failed (attempt {}): {}; retrying in {}ms",
                    attempts,
                    e,
                    delay_ms
                );
                let _ = state_tx.send(ConnectionState::Reconnecting);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                    _ = shutdown.notified() => break,
                }
                continue;
            }
        };
        attempts = 0;
        connected_before = true;
        log::info!("[connection] socket open");
        let _ = state_tx.send(ConnectionState::Open);

        let finished =
            pump(ws_stream, &mut outbound_rx, &events_tx, &shutdown).await;
        if finished == PumpEnd::Shutdown || closed.load(Ordering::SeqCst) {
            break;
        }

        // The link dropped out from under us. Flag it and go again after the
        // base delay.
        log::warn!("[connection] socket lost; reconnecting");
        let _ = state_tx.send(ConnectionState::Reconnecting);
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(RECONNECT_BASE_MS)) => {}
            _ = shutdown.notified() => break,
        }
    }
    let _ = state_tx.send(ConnectionState::Closed);
    log::info!("[connection] closed");
}

#[derive(PartialEq)]
enum PumpEnd {
    Shutdown,
    LinkLost,
}

async fn pump(
    ws_stream: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
    events_tx: &mpsc::Sender<ServerEvent>,
    shutdown: &Notify,
) -> PumpEnd {
    let (mut ws_tx, mut ws_rx) = ws_stream.split();
    loop {
        tokio::select! {
            frame = outbound_rx.recv() => {
                let frame = match frame {
                    Some(f) => f,
                    // All handles dropped: the view is gone.
                    None => return PumpEnd::Shutdown,
                };
                if let Err(e) = ws_tx.send(frame.into_ws()).await {
                    log::warn!("[connection] send failed: {}", e);
                    return PumpEnd::LinkLost;
                }
            }
            msg = ws_rx.next() => {
                let msg = match msg {
                    Some(Ok(m)) => m,
                    Some(Err(e)) => {
                        log::warn!("[connection] socket error: {}", e);
                        return PumpEnd::LinkLost;
                    }
                    None => return PumpEnd::LinkLost,
                };
                if msg.is_close() {
                    return PumpEnd::LinkLost;
                }
                if let Some(event) = protocol::decode(&msg) {
                    if events_tx.send(event).await.is_err() {
                        // Receiver torn down; stop delivering.
                        return PumpEnd::Shutdown;
                    }
                }
            }
            _ = shutdown.notified() => {
                let _ = ws_tx.close().await;
                return PumpEnd::Shutdown;
            }
        }
    }
}
