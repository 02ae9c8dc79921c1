// End-to-end scenarios against in-process mocks, covering spec §8's
// concrete scenarios 1, 3, 4, 5 plus the auth gate and heartbeat death.

use std::sync::Arc;
use std::time::Duration;

use broker_protocol::{AuthState, Credentials, SystemClock};
use broker_session::{
    BrokerSession, Condition, EventSubscriptionRequest, EventVerdict, Field, HandshakeClient, HeartbeatConfig,
    KeyStore, Logic, Operator, PredicateSubscription,
};
use broker_protocol::ConnectDescriptor;
use broker_test_support::{MockBrokerServer, MockRestServer};
use tokio::sync::mpsc;

fn test_session(handshake: HandshakeClient, heartbeat: HeartbeatConfig) -> (BrokerSession, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let session =
        BrokerSession::with_key_store(handshake, Arc::new(SystemClock), heartbeat, KeyStore::new(dir.path()));
    (session, dir)
}

async fn authenticated_session(rest: &MockRestServer) -> BrokerSession {
    let handshake = HandshakeClient::new().with_base_url(rest.base_url());
    let (session, _dir) = test_session(handshake, HeartbeatConfig::default());
    rest.set_process_id("proc-1").await;
    rest.accept_second_factor("1234").await;
    let creds = Credentials::new("+491701234567", "1234").unwrap();
    session.begin_login(&creds).await.unwrap();
    session.submit_second_factor("1234").await.unwrap();
    assert!(matches!(session.auth_state(), AuthState::Authenticated));
    session
}

async fn next_sub_id(broker: &MockBrokerServer) -> u64 {
    loop {
        let frame = broker.recv_client_frame().await.expect("client frame");
        if let Some(rest) = frame.strip_prefix("sub ") {
            let id_str = rest.split_whitespace().next().expect("sub frame has an id");
            return id_str.parse().expect("sub id is numeric");
        }
    }
}

#[tokio::test]
async fn scenario_1_baseline_answer_resolves_and_unsubscribes() {
    let rest = MockRestServer::start().await;
    let broker = MockBrokerServer::start().await;
    let session = authenticated_session(&rest).await;

    session.connect(&broker.ws_url(), &ConnectDescriptor::default()).await.unwrap();
    // First client frame is always the connect frame.
    let connect_frame = broker.recv_client_frame().await.unwrap();
    assert!(connect_frame.starts_with("connect 31 "));

    let driver = async {
        let id = next_sub_id(&broker).await;
        broker.send_frame(format!(r#"{id} A {{"bid":{{"price":64}},"ask":{{"price":65}}}}"#));
        id
    };

    let (answer, id) = tokio::join!(
        session.await_answer::<serde_json::Value>("ticker", None, Duration::from_secs(2)),
        driver
    );
    assert_eq!(answer.unwrap(), serde_json::json!({"bid":{"price":64},"ask":{"price":65}}));

    let unsub_frame = broker.recv_client_frame().await.unwrap();
    assert_eq!(unsub_frame, format!("unsub {id}"));
}

#[tokio::test]
async fn scenario_3_crossing_detection_triggers_on_second_tick() {
    let rest = MockRestServer::start().await;
    let broker = MockBrokerServer::start().await;
    let session = authenticated_session(&rest).await;

    session.connect(&broker.ws_url(), &ConnectDescriptor::default()).await.unwrap();
    broker.recv_client_frame().await.unwrap(); // connect frame

    let driver = async {
        let id = next_sub_id(&broker).await;
        broker.send_frame(format!(r#"{id} A {{"bid":{{"price":64}},"ask":{{"price":65}}}}"#));
        broker.send_frame(format!(r#"{id} D =0"#)); // no-op delta to trigger re-evaluation path
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.send_frame(format!(r#"{id} A {{"bid":{{"price":66}},"ask":{{"price":67}}}}"#));
    };

    let request = EventSubscriptionRequest {
        topic: "ticker".to_owned(),
        payload: None,
        predicate: PredicateSubscription {
            conditions: vec![Condition {
                field: Field::Bid,
                operator: Operator::CrossAbove,
                threshold: 65.0,
            }],
            logic: Logic::Any,
        },
    };

    let (verdict, ()) = tokio::join!(session.await_event(vec![request], 5), driver);
    match verdict.unwrap() {
        EventVerdict::Triggered { triggered_conditions, snapshot, .. } => {
            assert_eq!(triggered_conditions.len(), 1);
            assert_eq!(triggered_conditions[0].actual_value, 66.0);
            assert_eq!(snapshot.bid, 66.0);
        }
        other => panic!("expected a trigger, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_4_all_logic_requires_both_conditions() {
    let rest = MockRestServer::start().await;
    let broker = MockBrokerServer::start().await;
    let session = authenticated_session(&rest).await;

    session.connect(&broker.ws_url(), &ConnectDescriptor::default()).await.unwrap();
    broker.recv_client_frame().await.unwrap();

    let driver = async {
        let id = next_sub_id(&broker).await;
        broker.send_frame(format!(r#"{id} A {{"bid":{{"price":66}},"ask":{{"price":68}}}}"#));
        tokio::time::sleep(Duration::from_millis(20)).await;
        broker.send_frame(format!(r#"{id} A {{"bid":{{"price":66}},"ask":{{"price":72}}}}"#));
    };

    let request = EventSubscriptionRequest {
        topic: "ticker".to_owned(),
        payload: None,
        predicate: PredicateSubscription {
            conditions: vec![
                Condition { field: Field::Bid, operator: Operator::Gt, threshold: 65.0 },
                Condition { field: Field::Ask, operator: Operator::Gt, threshold: 70.0 },
            ],
            logic: Logic::All,
        },
    };

    let (verdict, ()) = tokio::join!(session.await_event(vec![request], 1), driver);
    match verdict.unwrap() {
        EventVerdict::Triggered { triggered_conditions, .. } => assert_eq!(triggered_conditions.len(), 2),
        other => panic!("expected a trigger, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_5_timeout_carries_last_seen_snapshots() {
    let rest = MockRestServer::start().await;
    let broker = MockBrokerServer::start().await;
    let session = authenticated_session(&rest).await;

    session.connect(&broker.ws_url(), &ConnectDescriptor::default()).await.unwrap();
    broker.recv_client_frame().await.unwrap();

    let driver = async {
        let id_a = next_sub_id(&broker).await;
        let id_b = next_sub_id(&broker).await;
        broker.send_frame(format!(r#"{id_a} A {{"bid":{{"price":10}},"ask":{{"price":11}}}}"#));
        broker.send_frame(format!(r#"{id_b} A {{"bid":{{"price":20}},"ask":{{"price":21}}}}"#));
        (id_a, id_b)
    };

    let requests = vec![
        EventSubscriptionRequest {
            topic: "ticker".to_owned(),
            payload: None,
            predicate: PredicateSubscription {
                conditions: vec![Condition { field: Field::Bid, operator: Operator::Gt, threshold: 1000.0 }],
                logic: Logic::Any,
            },
        },
        EventSubscriptionRequest {
            topic: "ticker".to_owned(),
            payload: None,
            predicate: PredicateSubscription {
                conditions: vec![Condition { field: Field::Bid, operator: Operator::Gt, threshold: 1000.0 }],
                logic: Logic::Any,
            },
        },
    ];

    let (verdict, (id_a, id_b)) = tokio::join!(session.await_event(requests, 1), driver);
    match verdict.unwrap() {
        EventVerdict::Timeout { last_tickers, duration_secs } => {
            assert_eq!(duration_secs, 1);
            assert_eq!(last_tickers.len(), 2);
            assert!(last_tickers.contains_key(&id_a));
            assert!(last_tickers.contains_key(&id_b));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn unauthenticated_subscribe_is_rejected() {
    let rest = MockRestServer::start().await;
    let handshake = HandshakeClient::new().with_base_url(rest.base_url());
    let (session, _dir) = test_session(handshake, HeartbeatConfig::default());
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = session.subscribe("ticker", None, tx).await.unwrap_err();
    assert!(matches!(err, broker_protocol::AuthenticationError::NotAuthenticated));
}

#[tokio::test]
async fn heartbeat_timeout_fails_active_subscriptions() {
    let rest = MockRestServer::start().await;
    let broker = MockBrokerServer::start().await;

    let fast_heartbeat = HeartbeatConfig {
        tick: Duration::from_millis(10),
        timeout: Duration::from_millis(30),
    };
    // Short heartbeat window so the test doesn't wait the real 40s.
    let handshake = HandshakeClient::new().with_base_url(rest.base_url());
    let (session, _dir) = test_session(handshake, fast_heartbeat);
    let creds = Credentials::new("+491701234567", "1234").unwrap();
    rest.accept_second_factor("1234").await;
    session.begin_login(&creds).await.unwrap();
    session.submit_second_factor("1234").await.unwrap();
    session.connect(&broker.ws_url(), &ConnectDescriptor::default()).await.unwrap();
    broker.recv_client_frame().await.unwrap(); // connect frame

    let result = session
        .await_answer::<serde_json::Value>("ticker", None, Duration::from_millis(200))
        .await;
    assert!(matches!(
        result,
        Err(broker_session::AwaitAnswerError::Wire(broker_protocol::WireError::ConnectionDead))
    ));
}
