// broker-session: HandshakeClient, StreamConnection, SubscriptionRegistry,
// the Session facade (`subscribe`/`unsubscribe`/`await_answer`/
// `await_event`), and the EventPredicate engine (spec §4.2, §4.4, §4.5,
// §4.6). This is where the two high-level patterns every collaborator
// service is built on live.

mod connection;
mod facade;
mod handshake;
mod predicate;
mod registry;

pub use broker_keystore::{KeyStore, KeyStoreError};
pub use broker_protocol::{Clock, SystemClock};
pub use connection::{HeartbeatConfig, StreamConnection};
pub use facade::{AwaitAnswerError, AwaitEventError, BrokerSession, EventSubscriptionRequest, EventVerdict};
pub use handshake::{HandshakeClient, LoginStarted};
pub use predicate::{
    snapshot_from_ticker_payload, Condition, Field, Logic, Operator, PredicateState, PredicateSubscription,
    Snapshot, TriggeredCondition,
};
pub use registry::{SubscriptionEvent, SubscriptionRegistry, SubscriptionSink};
