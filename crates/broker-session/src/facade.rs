// §4.5 SubscriptionRegistry & Session Facade: the authenticated surface
// every collaborator service is built on — `subscribe`/`unsubscribe` for
// raw streaming consumers, and the two high-level patterns `await_answer`
// and `await_event`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use broker_keystore::{KeyStore, KeyStoreError};
use broker_protocol::{
    AuthState, AuthenticationError, Clock, ConnectDescriptor, ConnectionState, Credentials,
    Session as CookieJar, SecondFactorRequired, SubscriptionError, WireError,
};
use futures_util::future::select_all;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::connection::{HeartbeatConfig, StreamConnection};
use crate::handshake::HandshakeClient;
use crate::predicate::{snapshot_from_ticker_payload, PredicateState, PredicateSubscription, Snapshot, TriggeredCondition};
use crate::registry::{SubscriptionEvent, SubscriptionSink};

/// The sole outcome of `await_answer`.
#[derive(Debug, Error)]
pub enum AwaitAnswerError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("payload failed schema validation: {0}")]
    SchemaMismatch(String),
    #[error("timed out waiting for an answer")]
    Timeout,
}

/// The sole outcome of `await_event`, on the error path.
#[derive(Debug, Error)]
pub enum AwaitEventError {
    #[error(transparent)]
    Authentication(#[from] AuthenticationError),
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error(transparent)]
    Subscription(#[from] SubscriptionError),
    #[error("awaitEvent requires 1-5 subscriptions, got {0}")]
    InvalidSubscriptionCount(usize),
    #[error("each subscription requires 1-5 conditions, got {0}")]
    InvalidConditionCount(usize),
    #[error("timeoutSeconds must be in 1-55, got {0}")]
    InvalidTimeout(u64),
}

/// One entry of an `await_event` request.
pub struct EventSubscriptionRequest {
    pub topic: String,
    pub payload: Option<serde_json::Map<String, serde_json::Value>>,
    pub predicate: PredicateSubscription,
}

/// The triggering outcome, a timeout, or early broker-side completion of
/// every subscription — each carries the last-seen snapshot per instrument.
#[derive(Debug)]
pub enum EventVerdict {
    Triggered {
        subscription_index: usize,
        id: u64,
        triggered_conditions: Vec<TriggeredCondition>,
        snapshot: Snapshot,
    },
    Timeout {
        last_tickers: HashMap<u64, Snapshot>,
        duration_secs: u64,
    },
    /// Every subscription reached `C` (broker-side completion) before the
    /// predicate fired or the timer elapsed. Distinct from `Timeout`: no
    /// timeout actually occurred, so this does not claim `duration_secs`.
    AllSubscriptionsCompleted {
        last_tickers: HashMap<u64, Snapshot>,
    },
}

/// The authenticated session facade: guards every gated call with
/// `AuthState == Authenticated`, owns the handshake client and (once
/// connected) the single `StreamConnection`.
pub struct BrokerSession {
    auth_state: std::sync::Mutex<AuthState>,
    pending_process_id: std::sync::Mutex<Option<String>>,
    cookies: std::sync::Mutex<CookieJar>,
    handshake: HandshakeClient,
    connection: AsyncMutex<Option<Arc<StreamConnection>>>,
    clock: Arc<dyn Clock>,
    heartbeat: HeartbeatConfig,
    key_store: KeyStore,
}

impl BrokerSession {
    pub fn new(handshake: HandshakeClient, clock: Arc<dyn Clock>, heartbeat: HeartbeatConfig) -> Self {
        Self::with_key_store(handshake, clock, heartbeat, KeyStore::with_default_dir())
    }

    /// Same as [`BrokerSession::new`] but with an explicit key store
    /// directory, for tests and non-default config locations.
    pub fn with_key_store(
        handshake: HandshakeClient,
        clock: Arc<dyn Clock>,
        heartbeat: HeartbeatConfig,
        key_store: KeyStore,
    ) -> Self {
        Self {
            auth_state: std::sync::Mutex::new(AuthState::Unauthenticated),
            pending_process_id: std::sync::Mutex::new(None),
            cookies: std::sync::Mutex::new(CookieJar::empty()),
            handshake,
            connection: AsyncMutex::new(None),
            clock,
            heartbeat,
            key_store,
        }
    }

    /// This device's long-lived public key point (§4.1), generating and
    /// persisting a key pair on first use. Collaborator services that sign
    /// requests outside the core's own REST/WS surface use this as their
    /// device identity.
    pub fn device_identity(&self) -> Result<String, KeyStoreError> {
        let key_pair = self.key_store.load_or_generate()?;
        key_pair.public_key_point_base64()
    }

    pub fn auth_state(&self) -> AuthState {
        self.auth_state.lock().expect("auth mutex poisoned").clone()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        match &*self.connection.lock().await {
            Some(connection) if connection.is_alive() => ConnectionState::Connected,
            Some(_) => ConnectionState::Disconnected,
            None => ConnectionState::Disconnected,
        }
    }

    /// Step 1 of login (§4.2). Moves `AuthState` to `AwaitingSecondFactor`
    /// on success.
    pub async fn begin_login(&self, credentials: &Credentials) -> Result<SecondFactorRequired, AuthenticationError> {
        let (started, session) = self.handshake.begin_login(credentials).await?;
        *self.cookies.lock().expect("cookie mutex poisoned") = session;
        *self.pending_process_id.lock().expect("process id mutex poisoned") = Some(started.process_id.clone());
        *self.auth_state.lock().expect("auth mutex poisoned") = AuthState::AwaitingSecondFactor {
            masked_phone: started.signal.masked_phone.clone(),
        };
        Ok(started.signal)
    }

    /// Step 2 of login (§4.2). Moves `AuthState` to `Authenticated` on
    /// success; reverts to `Unauthenticated` on failure.
    pub async fn submit_second_factor(&self, code: &str) -> Result<(), AuthenticationError> {
        let process_id = self
            .pending_process_id
            .lock()
            .expect("process id mutex poisoned")
            .clone()
            .ok_or(AuthenticationError::NotAuthenticated)?;

        match self.handshake.submit_second_factor(&process_id, code).await {
            Ok(refreshed) => {
                self.cookies.lock().expect("cookie mutex poisoned").merge(refreshed);
                *self.auth_state.lock().expect("auth mutex poisoned") = AuthState::Authenticated;
                Ok(())
            }
            Err(e) => {
                *self.auth_state.lock().expect("auth mutex poisoned") = AuthState::Unauthenticated;
                Err(e)
            }
        }
    }

    fn require_authenticated(&self) -> Result<(), AuthenticationError> {
        if self.auth_state().is_authenticated() {
            Ok(())
        } else {
            Err(AuthenticationError::NotAuthenticated)
        }
    }

    /// Dial the streaming endpoint with the session's cookie jar. Requires
    /// `AuthState == Authenticated`.
    pub async fn connect(&self, ws_url: &str, descriptor: &ConnectDescriptor) -> Result<(), AuthenticationError> {
        self.require_authenticated()?;
        let cookie_header = self.cookies.lock().expect("cookie mutex poisoned").cookie_header();
        let connection = StreamConnection::connect(ws_url, &cookie_header, descriptor, self.clock.clone(), self.heartbeat)
            .await
            .map_err(|e| AuthenticationError::Network(e.to_string()))?;
        *self.connection.lock().await = Some(connection);
        Ok(())
    }

    async fn active_connection(&self) -> Result<Arc<StreamConnection>, AuthenticationError> {
        self.require_authenticated()?;
        self.connection
            .lock()
            .await
            .clone()
            .filter(|c| c.is_alive())
            .ok_or(AuthenticationError::NotAuthenticated)
    }

    /// `subscribe(topic, payload) -> id` (§4.5). The caller-provided `sink`
    /// receives every subsequent frame for this id; there is no delivery
    /// guarantee if the socket drops between send and the broker's reply.
    pub async fn subscribe(
        &self,
        topic: &str,
        payload: Option<serde_json::Map<String, serde_json::Value>>,
        sink: SubscriptionSink,
    ) -> Result<u64, AuthenticationError> {
        let connection = self.active_connection().await?;
        connection
            .subscribe(topic, payload, sink)
            .await
            .map_err(|e| AuthenticationError::Network(e.to_string()))
    }

    /// `unsubscribe(id)` (§4.5). Safe on unknown ids and on a dead
    /// connection.
    pub async fn unsubscribe(&self, id: u64) {
        if let Some(connection) = self.connection.lock().await.clone() {
            connection.unsubscribe(id).await;
        }
    }

    /// Order modification is not a broker operation (§9): callers must
    /// cancel the existing order and place a new one instead.
    pub fn modify_order(&self) -> Result<(), AuthenticationError> {
        Err(AuthenticationError::NotSupported)
    }

    /// The single-shot pattern (§4.5): resolves on the subscription's first
    /// `A` frame, rejects on `E`/timeout/connection death. Always tears
    /// down the subscription before returning.
    pub async fn await_answer<T: DeserializeOwned>(
        &self,
        topic: &str,
        payload: Option<serde_json::Map<String, serde_json::Value>>,
        timeout: Duration,
    ) -> Result<T, AwaitAnswerError> {
        let connection = self.active_connection().await.map_err(AwaitAnswerError::Authentication)?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = connection.subscribe(topic, payload, tx).await?;

        let sleep = tokio::time::sleep(timeout);
        tokio::pin!(sleep);

        let outcome = loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(SubscriptionEvent::Answer(value)) => {
                            break serde_json::from_value(value)
                                .map_err(|e| AwaitAnswerError::SchemaMismatch(e.to_string()));
                        }
                        Some(SubscriptionEvent::Error(message)) => {
                            break Err(AwaitAnswerError::Subscription(SubscriptionError { id, message }));
                        }
                        Some(SubscriptionEvent::ConnectionDead) => {
                            break Err(AwaitAnswerError::Wire(WireError::ConnectionDead));
                        }
                        // D frames and C before A are ignored: awaitAnswer callers
                        // don't use delta streams (§4.5).
                        Some(SubscriptionEvent::Delta(_) | SubscriptionEvent::Complete) => continue,
                        None => break Err(AwaitAnswerError::Wire(WireError::ConnectionDead)),
                    }
                }
                () = &mut sleep => {
                    break Err(AwaitAnswerError::Timeout);
                }
            }
        };

        connection.unsubscribe(id).await;
        outcome
    }

    /// The streaming pattern (§4.5): opens one subscription per entry,
    /// evaluates each inbound ticker through the predicate engine, and
    /// resolves on the first hit or the overall timeout. Always tears down
    /// every subscription on exit.
    pub async fn await_event(
        &self,
        subscriptions: Vec<EventSubscriptionRequest>,
        timeout_seconds: u64,
    ) -> Result<EventVerdict, AwaitEventError> {
        if !(1..=5).contains(&subscriptions.len()) {
            return Err(AwaitEventError::InvalidSubscriptionCount(subscriptions.len()));
        }
        for sub in &subscriptions {
            let n = sub.predicate.conditions.len();
            if !(1..=5).contains(&n) {
                return Err(AwaitEventError::InvalidConditionCount(n));
            }
        }
        if !(1..=55).contains(&timeout_seconds) {
            return Err(AwaitEventError::InvalidTimeout(timeout_seconds));
        }

        let connection = self.active_connection().await.map_err(AwaitEventError::Authentication)?;

        let mut ids = Vec::with_capacity(subscriptions.len());
        let mut receivers = Vec::with_capacity(subscriptions.len());
        let mut predicate_states: HashMap<u64, PredicateState> = HashMap::new();
        let mut last_tickers: HashMap<u64, Snapshot> = HashMap::new();

        for request in &subscriptions {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = match connection.subscribe(&request.topic, request.payload.clone(), tx).await {
                Ok(id) => id,
                Err(e) => {
                    for id in &ids {
                        connection.unsubscribe(*id).await;
                    }
                    return Err(AwaitEventError::Wire(e));
                }
            };
            ids.push(id);
            receivers.push(Some(rx));
            predicate_states.insert(id, PredicateState::new());
        }

        let sleep = tokio::time::sleep(Duration::from_secs(timeout_seconds));
        tokio::pin!(sleep);

        let result = loop {
            if receivers.iter().all(Option::is_none) {
                break Ok(EventVerdict::AllSubscriptionsCompleted {
                    last_tickers: last_tickers.clone(),
                });
            }

            // Each future below borrows a *different* slice element
            // (`iter_mut` yields disjoint `&mut` references), so collecting
            // them all into one `Vec` for `select_all` is sound even though
            // they're polled concurrently.
            let futs: Vec<PendingRecv<'_>> = receivers
                .iter_mut()
                .enumerate()
                .filter_map(|(i, slot)| {
                    slot.as_mut().map(|rx| {
                        let fut: PendingRecv<'_> = Box::pin(async move { (i, rx.recv().await) });
                        fut
                    })
                })
                .collect();

            tokio::select! {
                (outcome, _index_in_futs, remaining) = select_all(futs) => {
                    // `remaining` still holds `&mut` borrows into `receivers`
                    // (each pending future was built from `iter_mut()`); drop
                    // it explicitly before mutating `receivers` below, or the
                    // borrow checker sees it as live for the rest of the arm.
                    drop(remaining);
                    let (i, event) = outcome;
                    let id = ids[i];
                    match event {
                        Some(SubscriptionEvent::Answer(value)) | Some(SubscriptionEvent::Delta(value)) => {
                            if let Some(snapshot) = snapshot_from_ticker_payload(&value) {
                                last_tickers.insert(id, snapshot);
                                let state = predicate_states.get_mut(&id).expect("state registered at subscribe time");
                                let triggered = state.evaluate(&subscriptions[i].predicate, snapshot);
                                if !triggered.is_empty() {
                                    break Ok(EventVerdict::Triggered {
                                        subscription_index: i,
                                        id,
                                        triggered_conditions: triggered,
                                        snapshot,
                                    });
                                }
                            }
                        }
                        Some(SubscriptionEvent::Error(message)) => {
                            break Err(AwaitEventError::Subscription(SubscriptionError { id, message }));
                        }
                        Some(SubscriptionEvent::ConnectionDead) => {
                            break Err(AwaitEventError::Wire(WireError::ConnectionDead));
                        }
                        Some(SubscriptionEvent::Complete) | None => {
                            receivers[i] = None;
                        }
                    }
                }
                () = &mut sleep => {
                    break Ok(EventVerdict::Timeout {
                        last_tickers: last_tickers.clone(),
                        duration_secs: timeout_seconds,
                    });
                }
            }
        };

        for id in &ids {
            connection.unsubscribe(*id).await;
        }
        result
    }
}

type PendingRecv<'a> = std::pin::Pin<Box<dyn std::future::Future<Output = (usize, Option<SubscriptionEvent>)> + Send + 'a>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_identity_is_stable_across_calls() {
        let dir = tempfile::tempdir().unwrap();
        let session = BrokerSession::with_key_store(
            HandshakeClient::new(),
            Arc::new(broker_protocol::SystemClock),
            HeartbeatConfig::default(),
            KeyStore::new(dir.path()),
        );
        let first = session.device_identity().unwrap();
        let second = session.device_identity().unwrap();
        assert_eq!(first, second);
    }
}
