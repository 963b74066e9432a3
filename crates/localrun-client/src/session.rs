//! Tunnel session controller
//!
//! Owns the control WebSocket and every timer attached to it: the
//! reconnect loop with jittered exponential backoff, the keepalive ping,
//! and the chunk reassembly table. Inbound requests are handed to
//! forwarding units that run concurrently; all outbound frames funnel
//! through this loop so chunk runs stay contiguous on the wire.

use crate::broker::TunnelInfo;
use crate::forwarder::{now_millis, Forwarder};
use crate::TunnelEvent;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use localrun_proto::{encode_outbound, ChunkAssembler, Frame, PingPayload, RequestPayload};
use rand::Rng;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

/// Interval between keepalive pings once connected.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Ceiling on the WebSocket handshake.
const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Settle delay between registration and the first connect.
const POST_REGISTER_DELAY: Duration = Duration::from_millis(10);

/// Consecutive failed reconnects before the session gives up.
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

const RECONNECT_CAP_MS: f64 = 30_000.0;
const RECONNECT_MULTIPLIER: f64 = 1.5;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

enum ConnectionOutcome {
    /// `close()` was called; stop for good.
    Intentional,
    /// Handshake never completed.
    FailedConnect,
    /// An established connection dropped.
    Lost,
}

pub(crate) struct Session {
    pub info: TunnelInfo,
    pub ws_url: String,
    pub events: mpsc::UnboundedSender<TunnelEvent>,
    pub closed: watch::Receiver<bool>,
    pub assembler: Arc<StdMutex<ChunkAssembler>>,
    pub forwarder: Arc<Forwarder>,
    /// Outbound frames from forwarding units; drained by the connection
    /// loop. Frames queued while disconnected flush on the next connect.
    pub frame_rx: mpsc::UnboundedReceiver<Frame>,
    /// Kept so the channel never closes while the session lives.
    pub frame_tx: mpsc::UnboundedSender<Frame>,
}

impl Session {
    pub(crate) async fn run(mut self) {
        if self.sleep_or_closed(POST_REGISTER_DELAY).await {
            self.teardown();
            return;
        }

        let mut attempts: u32 = 0;
        loop {
            if *self.closed.borrow() {
                break;
            }

            match self.connect_and_run().await {
                ConnectionOutcome::Intentional => break,
                outcome => {
                    if matches!(outcome, ConnectionOutcome::Lost) {
                        // The connection was up, so the failure streak
                        // starts over.
                        attempts = 0;
                    }
                    attempts += 1;
                    if attempts >= MAX_RECONNECT_ATTEMPTS {
                        error!(
                            "Giving up after {} failed reconnect attempts",
                            attempts
                        );
                        self.emit(TunnelEvent::Error(format!(
                            "Tunnel lost after {} reconnect attempts",
                            attempts
                        )));
                        break;
                    }
                    let delay = reconnect_delay(attempts);
                    info!("Reconnecting in {:?} (attempt {})", delay, attempts);
                    if self.sleep_or_closed(delay).await {
                        break;
                    }
                }
            }
        }

        self.teardown();
    }

    async fn connect_and_run(&mut self) -> ConnectionOutcome {
        debug!("Connecting to {}", self.ws_url);

        let closed = self.closed.clone();
        let connect = timeout(WS_HANDSHAKE_TIMEOUT, connect_async(self.ws_url.as_str()));
        let ws = tokio::select! {
            _ = wait_closed(closed) => return ConnectionOutcome::Intentional,
            result = connect => match result {
                Ok(Ok((ws, _response))) => ws,
                Ok(Err(e)) => {
                    warn!("WebSocket connect failed: {}", e);
                    return ConnectionOutcome::FailedConnect;
                }
                Err(_) => {
                    warn!("WebSocket handshake timed out");
                    return ConnectionOutcome::FailedConnect;
                }
            },
        };

        info!("Tunnel live at {}", self.info.url);
        self.emit(TunnelEvent::Url(self.info.url.clone()));

        let (sink, stream) = ws.split();
        self.drive_connection(sink, stream).await
    }

    async fn drive_connection(
        &mut self,
        mut sink: WsSink,
        mut stream: SplitStream<WsStream>,
    ) -> ConnectionOutcome {
        let assembler = self.assembler.clone();
        let forwarder = self.forwarder.clone();
        let frame_tx = self.frame_tx.clone();
        let spawn_closed = self.closed.clone();
        let closed = self.closed.clone();
        let frame_rx = &mut self.frame_rx;

        let mut keepalive = interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        keepalive.tick().await; // the first tick is immediate
        let mut last_pong = Instant::now();

        loop {
            tokio::select! {
                // wait_for sees a close that landed before this connection
                // was established; changed() alone would miss it.
                _ = wait_closed(closed.clone()) => {
                    debug!("Close requested, shutting down WebSocket");
                    let _ = sink.close().await;
                    return ConnectionOutcome::Intentional;
                }
                _ = keepalive.tick() => {
                    if last_pong.elapsed() > KEEPALIVE_INTERVAL * 2 {
                        warn!(
                            "No pong from broker for {:?}, forcing reconnect",
                            last_pong.elapsed()
                        );
                        return ConnectionOutcome::Lost;
                    }
                    let ping = Frame::Ping(PingPayload { timestamp: now_millis() });
                    if write_frame(&mut sink, ping).await.is_err() {
                        return ConnectionOutcome::Lost;
                    }
                }
                frame = frame_rx.recv() => {
                    let Some(frame) = frame else {
                        return ConnectionOutcome::Lost;
                    };
                    if write_frame(&mut sink, frame).await.is_err() {
                        return ConnectionOutcome::Lost;
                    }
                }
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            on_text(&assembler, &forwarder, &frame_tx, &spawn_closed, &text, &mut last_pong);
                        }
                        Some(Ok(Message::Close(_))) => {
                            debug!("WebSocket closed by broker");
                            return ConnectionOutcome::Lost;
                        }
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                            // Transport-level keepalive; tungstenite answers
                            // pings itself.
                            trace!("WebSocket-level ping/pong");
                        }
                        Some(Ok(other)) => {
                            warn!("Ignoring non-text WebSocket message ({} bytes)", other.len());
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket read error: {}", e);
                            return ConnectionOutcome::Lost;
                        }
                        None => {
                            debug!("WebSocket stream ended");
                            return ConnectionOutcome::Lost;
                        }
                    }
                }
            }
        }
    }

    /// Sleep, returning early (true) if `close()` fires first.
    async fn sleep_or_closed(&self, duration: Duration) -> bool {
        let closed = self.closed.clone();
        tokio::select! {
            _ = sleep(duration) => false,
            _ = wait_closed(closed) => true,
        }
    }

    fn emit(&self, event: TunnelEvent) {
        let _ = self.events.send(event);
    }

    fn teardown(&mut self) {
        self.assembler.lock().unwrap().clear();
        self.emit(TunnelEvent::Closed);
        debug!("Session closed");
    }
}

/// Encode one logical frame and write its message run. Writing the whole
/// run here keeps chunk sequences contiguous per message id.
async fn write_frame(sink: &mut WsSink, frame: Frame) -> Result<(), ()> {
    let messages = match encode_outbound(&frame) {
        Ok(messages) => messages,
        Err(e) => {
            error!("Failed to encode outbound frame: {}", e);
            return Ok(());
        }
    };

    for message in messages {
        if let Err(e) = sink.send(Message::Text(message)).await {
            warn!("WebSocket write failed: {}", e);
            return Err(());
        }
    }
    Ok(())
}

fn on_text(
    assembler: &Arc<StdMutex<ChunkAssembler>>,
    forwarder: &Arc<Forwarder>,
    frame_tx: &mpsc::UnboundedSender<Frame>,
    closed: &watch::Receiver<bool>,
    text: &str,
    last_pong: &mut Instant,
) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Dropping unparseable frame: {}", e);
            return;
        }
    };
    dispatch_frame(assembler, forwarder, frame_tx, closed, frame, last_pong);
}

fn dispatch_frame(
    assembler: &Arc<StdMutex<ChunkAssembler>>,
    forwarder: &Arc<Forwarder>,
    frame_tx: &mpsc::UnboundedSender<Frame>,
    closed: &watch::Receiver<bool>,
    frame: Frame,
    last_pong: &mut Instant,
) {
    match frame {
        Frame::Request(request) => spawn_forwarder(forwarder, closed, request),
        Frame::Chunk(chunk) => {
            let completed = assembler.lock().unwrap().accept(chunk);
            match completed {
                Ok(Some(inner)) => {
                    dispatch_frame(assembler, forwarder, frame_tx, closed, inner, last_pong)
                }
                Ok(None) => {}
                Err(e) => warn!("Dropping chunked message: {}", e),
            }
        }
        Frame::Ping(ping) => {
            trace!("Ping from broker, replying with pong");
            let _ = frame_tx.send(Frame::Pong(ping));
        }
        Frame::Pong(pong) => {
            trace!("Pong from broker (timestamp {})", pong.timestamp);
            *last_pong = Instant::now();
        }
        other => warn!("Unexpected inbound frame type {:?}", other.kind()),
    }
}

/// Each request gets an independent forwarding unit, cancelled when the
/// session closes.
fn spawn_forwarder(
    forwarder: &Arc<Forwarder>,
    closed: &watch::Receiver<bool>,
    request: RequestPayload,
) {
    let forwarder = forwarder.clone();
    let closed = closed.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = forwarder.handle(request) => {}
            _ = wait_closed(closed) => {
                debug!("Request handling aborted by shutdown");
            }
        }
    });
}

pub(crate) async fn wait_closed(mut closed: watch::Receiver<bool>) {
    // A dropped sender also means the session is gone.
    let _ = closed.wait_for(|closed| *closed).await;
}

/// Jittered exponential backoff for reconnect attempt `attempt`
/// (1-indexed): `random(1000..2000) * 1.5^(attempt-1)`, capped at 30 s.
fn reconnect_delay(attempt: u32) -> Duration {
    let base = rand::thread_rng().gen_range(1000..2000) as f64;
    let ms = (base * RECONNECT_MULTIPLIER.powi(attempt.saturating_sub(1) as i32))
        .min(RECONNECT_CAP_MS);
    Duration::from_millis(ms as u64)
}
