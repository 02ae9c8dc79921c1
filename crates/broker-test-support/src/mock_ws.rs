// An in-process mock of the broker's streaming endpoint (§4.4, §6): accepts
// one WebSocket connection, lets the test script outbound frames and
// inspect inbound ones. Modeled directly on `rt-test-utils::MockWsServer`'s
// accept-loop-plus-channel shape, adapted from the timing protocol's
// typed `WsMessage` enum to this protocol's line-oriented text frames.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_tungstenite::tungstenite::protocol::Message;

pub struct MockBrokerServer {
    addr: SocketAddr,
    to_client: mpsc::UnboundedSender<String>,
    from_client: AsyncMutex<mpsc::UnboundedReceiver<String>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockBrokerServer {
    /// Bind a random port and accept exactly one connection (one
    /// `StreamConnection` per test, matching the core's single-socket
    /// model).
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock broker server");
        let addr = listener.local_addr().expect("local addr");

        let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<String>();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel::<String>();

        let task = tokio::spawn(async move {
            let (stream, _peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            let ws = match tokio_tungstenite::accept_async(stream).await {
                Ok(ws) => ws,
                Err(_) => return,
            };
            let (mut write, mut read) = ws.split();

            loop {
                tokio::select! {
                    inbound = read.next() => {
                        match inbound {
                            Some(Ok(Message::Text(text))) => {
                                let _ = from_client_tx.send(text.to_string());
                            }
                            Some(Ok(Message::Ping(data))) => {
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(_)) => break,
                            _ => {}
                        }
                    }
                    outbound = to_client_rx.recv() => {
                        match outbound {
                            Some(frame) => {
                                if write.send(Message::Text(frame.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                }
            }
        });

        Self {
            addr,
            to_client: to_client_tx,
            from_client: AsyncMutex::new(from_client_rx),
            _task: task,
        }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Queue a frame to be sent to the (single) connected client.
    pub fn send_frame(&self, frame: impl Into<String>) {
        let _ = self.to_client.send(frame.into());
    }

    /// Await the next frame the client sent (e.g. the initial `connect`
    /// frame, or a `sub`/`unsub`).
    pub async fn recv_client_frame(&self) -> Option<String> {
        self.from_client.lock().await.recv().await
    }
}
