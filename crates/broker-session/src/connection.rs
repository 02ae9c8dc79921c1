// §4.4 StreamConnection: owns the single persistent socket, drives the
// connect frame, demuxes by subscription id, and supervises heartbeat
// liveness. Exactly one reader task consumes the socket (§5); the codec and
// its baseline table live exclusively on that task.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use broker_codec::{connect_frame, sub_frame, unsub_frame, Codec};
use broker_protocol::{Clock, ConnectDescriptor, FrameCode, WireError};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::MaybeTlsStream;

use crate::registry::{SubscriptionEvent, SubscriptionRegistry, SubscriptionSink};

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Heartbeat supervisor timing (§4.4: tick every 20s, dead after 40s of
/// silence). Exposed so integration tests can use short durations instead
/// of waiting on the real 20s/40s window.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    pub tick: Duration,
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(20),
            timeout: Duration::from_secs(40),
        }
    }
}

/// Owns the single socket for the lifetime of one connection. Dropping this
/// (or a heartbeat timeout) tears down the reader and supervisor tasks.
pub struct StreamConnection {
    write: AsyncMutex<futures_util::stream::SplitSink<WsStream, Message>>,
    registry: Arc<SubscriptionRegistry>,
    last_message_time: Arc<StdMutex<Instant>>,
    alive: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
    _reader_task: tokio::task::JoinHandle<()>,
    _supervisor_task: tokio::task::JoinHandle<()>,
}

impl StreamConnection {
    /// Dial the streaming endpoint, send the cookie header, send the
    /// connect frame, and spawn the reader + heartbeat supervisor tasks.
    pub async fn connect(
        url: &str,
        cookie_header: &str,
        descriptor: &ConnectDescriptor,
        clock: Arc<dyn Clock>,
        heartbeat: HeartbeatConfig,
    ) -> Result<Arc<Self>, WireError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| WireError::ConnectSendFailed(format!("invalid url: {e}")))?;
        if !cookie_header.is_empty() {
            request.headers_mut().insert(
                "Cookie",
                cookie_header
                    .parse()
                    .map_err(|e| WireError::ConnectSendFailed(format!("invalid cookie header: {e}")))?,
            );
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| WireError::ConnectSendFailed(e.to_string()))?;
        let (mut write, read) = ws.split();

        write
            .send(Message::Text(connect_frame(descriptor).into()))
            .await
            .map_err(|e| WireError::ConnectSendFailed(e.to_string()))?;

        let registry = Arc::new(SubscriptionRegistry::new());
        let last_message_time = Arc::new(StdMutex::new(clock.now()));
        let alive = Arc::new(AtomicBool::new(true));

        let reader_task = tokio::spawn(run_reader(
            read,
            registry.clone(),
            last_message_time.clone(),
            alive.clone(),
            clock.clone(),
        ));
        let supervisor_task = tokio::spawn(run_heartbeat_supervisor(
            clock.clone(),
            last_message_time.clone(),
            alive.clone(),
            registry.clone(),
            heartbeat,
        ));

        tracing::info!("stream connection established");
        Ok(Arc::new(Self {
            write: AsyncMutex::new(write),
            registry,
            last_message_time,
            alive,
            clock,
            _reader_task: reader_task,
            _supervisor_task: supervisor_task,
        }))
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Allocate an id, register `sink`, and send `sub <id> {...}`.
    pub async fn subscribe(
        &self,
        topic: &str,
        payload: Option<serde_json::Map<String, serde_json::Value>>,
        sink: SubscriptionSink,
    ) -> Result<u64, WireError> {
        let id = self.registry.allocate_id();
        self.registry.register(id, sink);
        if let Err(e) = self.send_frame(sub_frame(id, topic, payload)).await {
            self.registry.deregister(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Send `unsub <id>` (best effort) and remove the sink. Safe on unknown
    /// ids and on a dead connection.
    pub async fn unsubscribe(&self, id: u64) {
        self.registry.deregister(id);
        if self.is_alive() {
            if let Err(e) = self.send_frame(unsub_frame(id)).await {
                tracing::debug!(id, error = %e, "unsub send failed (connection likely closing)");
            }
        }
    }

    async fn send_frame(&self, frame: String) -> Result<(), WireError> {
        let mut write = self.write.lock().await;
        write
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| WireError::ConnectSendFailed(e.to_string()))
    }

    /// Observed "now" through the injected clock, for tests asserting on
    /// staleness without real sleeps.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

async fn run_reader(
    mut read: futures_util::stream::SplitStream<WsStream>,
    registry: Arc<SubscriptionRegistry>,
    last_message_time: Arc<StdMutex<Instant>>,
    alive: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
) {
    let mut codec = Codec::new();
    loop {
        if !alive.load(Ordering::SeqCst) {
            break;
        }
        match read.next().await {
            None => {
                tracing::info!("stream closed by peer");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(error = %e, "websocket read error");
                break;
            }
            Some(Ok(Message::Text(text))) => {
                *last_message_time.lock().expect("clock mutex poisoned") = clock.now();
                dispatch_frame(&mut codec, &registry, &text);
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                *last_message_time.lock().expect("clock mutex poisoned") = clock.now();
            }
            Some(Ok(Message::Close(_))) => {
                tracing::info!("received close frame");
                break;
            }
            Some(Ok(_)) => {}
        }
    }
    alive.store(false, Ordering::SeqCst);
    registry.fail_all();
}

/// Each inbound WebSocket text message is exactly one protocol frame — the
/// frame grammar's payload may itself contain raw newlines (spec §4.3), so
/// frames are never split on `\n`; the transport's own message framing is
/// the frame boundary.
fn dispatch_frame(codec: &mut Codec, registry: &SubscriptionRegistry, text: &str) {
    match codec.decode(text) {
        Ok(message) => {
            let event = match message.code {
                FrameCode::Answer => SubscriptionEvent::Answer(message.payload.unwrap_or_default()),
                FrameCode::Delta => SubscriptionEvent::Delta(message.payload.unwrap_or_default()),
                FrameCode::Complete => SubscriptionEvent::Complete,
                FrameCode::Error => SubscriptionEvent::Error(
                    message
                        .payload
                        .as_ref()
                        .map(broker_protocol::extract_error_message)
                        .unwrap_or_else(|| "unknown broker error".to_owned()),
                ),
            };
            registry.dispatch(message.id, event);
        }
        Err(e) => {
            tracing::warn!(error = %e, frame = %text, "failed to decode inbound frame");
        }
    }
}

async fn run_heartbeat_supervisor(
    clock: Arc<dyn Clock>,
    last_message_time: Arc<StdMutex<Instant>>,
    alive: Arc<AtomicBool>,
    registry: Arc<SubscriptionRegistry>,
    config: HeartbeatConfig,
) {
    let mut interval = tokio::time::interval(config.tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if !alive.load(Ordering::SeqCst) {
            break;
        }
        let last = *last_message_time.lock().expect("clock mutex poisoned");
        if clock.now().duration_since(last) >= config.timeout {
            tracing::warn!("connection declared dead: no frame within heartbeat window");
            alive.store(false, Ordering::SeqCst);
            registry.fail_all();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_protocol::SystemClock;

    #[test]
    fn heartbeat_staleness_check_is_pure() {
        let clock = SystemClock;
        let last = clock.now() - Duration::from_secs(41);
        assert!(clock.now().duration_since(last) >= HeartbeatConfig::default().timeout);
    }
}
