// An in-process mock of the REST handshake gateway (§4.2, §6), built with
// `axum` in the style of `services/server`'s router setup — a handful of
// routes over shared, lockable state, bound to a random port so each test
// gets an isolated instance.

use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Clone, Default)]
struct RestState {
    process_id: String,
    expected_code: Option<String>,
    login_rejection: Option<(String, String)>,
    second_factor_rejection: Option<(String, String)>,
}

pub struct MockRestServer {
    addr: std::net::SocketAddr,
    state: Arc<Mutex<RestState>>,
    _task: tokio::task::JoinHandle<()>,
}

#[derive(Debug, Deserialize)]
struct LoginBody {
    #[allow(dead_code)]
    #[serde(rename = "phoneNumber")]
    phone_number: String,
    #[allow(dead_code)]
    pin: String,
}

impl MockRestServer {
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(RestState {
            process_id: "proc-1".to_owned(),
            ..Default::default()
        }));

        let router = Router::new()
            .route("/api/v1/auth/web/login", post(handle_login))
            .route("/api/v1/auth/web/login/:process_id/:code", post(handle_second_factor))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind mock rest server");
        let addr = listener.local_addr().expect("local addr");
        let task = tokio::spawn(async move {
            axum::serve(listener, router).await.expect("mock rest server crashed");
        });

        Self { addr, state, _task: task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn set_process_id(&self, process_id: &str) {
        self.state.lock().expect("state mutex poisoned").process_id = process_id.to_owned();
    }

    pub async fn reject_login(&self, error_code: &str, error_message: &str) {
        self.state.lock().expect("state mutex poisoned").login_rejection =
            Some((error_code.to_owned(), error_message.to_owned()));
    }

    pub async fn accept_second_factor(&self, code: &str) {
        let mut state = self.state.lock().expect("state mutex poisoned");
        state.expected_code = Some(code.to_owned());
        state.second_factor_rejection = None;
    }

    pub async fn reject_second_factor(&self, error_code: &str, error_message: &str) {
        self.state.lock().expect("state mutex poisoned").second_factor_rejection =
            Some((error_code.to_owned(), error_message.to_owned()));
    }
}

async fn handle_login(
    State(state): State<Arc<Mutex<RestState>>>,
    Json(_body): Json<LoginBody>,
) -> (StatusCode, HeaderMap, Json<serde_json::Value>) {
    let snapshot = state.lock().expect("state mutex poisoned").clone();
    let mut headers = HeaderMap::new();

    if let Some((code, message)) = snapshot.login_rejection {
        let body = json!({"errorCode": code, "errorMessage": message});
        return (StatusCode::BAD_REQUEST, headers, Json(body));
    }

    headers.insert(
        axum::http::header::SET_COOKIE,
        format!("sessionId={}; Path=/", uuid::Uuid::new_v4()).parse().expect("valid cookie header"),
    );
    (StatusCode::OK, headers, Json(json!({"processId": snapshot.process_id})))
}

async fn handle_second_factor(
    State(state): State<Arc<Mutex<RestState>>>,
    Path((_process_id, code)): Path<(String, String)>,
) -> (StatusCode, HeaderMap, Json<serde_json::Value>) {
    let snapshot = state.lock().expect("state mutex poisoned").clone();
    let mut headers = HeaderMap::new();

    if let Some((error_code, message)) = snapshot.second_factor_rejection {
        let body = json!({"errors": [{"errorCode": error_code, "errorMessage": message}]});
        return (StatusCode::BAD_REQUEST, headers, Json(body));
    }

    if snapshot.expected_code.as_deref() != Some(code.as_str()) {
        let body = json!({"errors": [{"errorCode": "2FA_INVALID", "errorMessage": "invalid second factor code"}]});
        return (StatusCode::BAD_REQUEST, headers, Json(body));
    }

    headers.insert(
        axum::http::header::SET_COOKIE,
        format!("sessionId={}; Path=/", uuid::Uuid::new_v4()).parse().expect("valid cookie header"),
    );
    (StatusCode::OK, headers, Json(json!({})))
}
