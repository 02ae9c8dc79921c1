// §4.2 HandshakeClient: the two-step REST login dance.
//
// Both calls are bounded by a 10s timeout and share one `reqwest::Client`
// (DI seam per §9: the client and base URL are constructor arguments so
// tests point it at an in-process mock server instead of the real gateway).

use std::time::Duration;

use broker_protocol::{AuthenticationError, Credentials, SecondFactorRequired, Session};
use serde::Deserialize;

const DEFAULT_BASE_URL: &str = "https://api.traderepublic.com";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "processId")]
    process_id: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelopeShape {
    #[serde(default)]
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(default)]
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    errors: Option<Vec<ErrorEntry>>,
}

#[derive(Debug, Deserialize)]
struct ErrorEntry {
    #[serde(default)]
    #[serde(rename = "errorCode")]
    error_code: Option<String>,
    #[serde(default)]
    #[serde(rename = "errorMessage")]
    error_message: Option<String>,
}

/// Outcome of the REST login handshake.
pub struct LoginStarted {
    pub process_id: String,
    pub signal: SecondFactorRequired,
}

/// Performs the REST login dance against the broker's auth gateway.
pub struct HandshakeClient {
    http: reqwest::Client,
    base_url: String,
}

impl HandshakeClient {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    /// Inject a preconfigured client (e.g. with a custom connector in
    /// tests).
    pub fn with_client(http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_owned(),
        }
    }

    /// Point the client at a different base URL (mock server in tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Step 1: `POST /api/v1/auth/web/login`. On success, returns the
    /// process id and a [`SecondFactorRequired`] signal carrying the masked
    /// phone number, plus the cookie jar captured from `Set-Cookie`.
    pub async fn begin_login(
        &self,
        credentials: &Credentials,
    ) -> Result<(LoginStarted, Session), AuthenticationError> {
        let url = format!("{}/api/v1/auth/web/login", self.base_url);
        let body = serde_json::json!({
            "phoneNumber": credentials.phone_number,
            "pin": credentials.pin,
        });
        let response = self
            .http
            .post(&url)
            .timeout(HANDSHAKE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .map_err(|e| AuthenticationError::Network(e.to_string()))?;

        let session = session_from_response(&response);

        if !response.status().is_success() {
            return Err(decode_login_error(response.status().as_u16(), response.text().await));
        }

        let parsed: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthenticationError::Network(format!("decoding login response: {e}")))?;

        let masked_phone = credentials.masked_phone();
        tracing::info!(process_id = %parsed.process_id, masked_phone = %masked_phone, "login requires second factor");
        Ok((
            LoginStarted {
                process_id: parsed.process_id.clone(),
                signal: SecondFactorRequired {
                    masked_phone,
                    process_id: parsed.process_id,
                },
            },
            session,
        ))
    }

    /// Step 2: `POST /api/v1/auth/web/login/<processId>/<code>`. On
    /// success, returns the refreshed cookie jar.
    pub async fn submit_second_factor(
        &self,
        process_id: &str,
        code: &str,
    ) -> Result<Session, AuthenticationError> {
        let url = format!("{}/api/v1/auth/web/login/{}/{}", self.base_url, process_id, code);
        let response = self
            .http
            .post(&url)
            .timeout(HANDSHAKE_TIMEOUT)
            .send()
            .await
            .map_err(|e| AuthenticationError::Network(e.to_string()))?;

        let session = session_from_response(&response);

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await;
            return Err(match decode_login_error(status, body) {
                AuthenticationError::LoginFailed { message, code } => {
                    AuthenticationError::SecondFactorRejected { message, code }
                }
                other => other,
            });
        }

        tracing::info!("second factor accepted");
        Ok(session)
    }
}

impl Default for HandshakeClient {
    fn default() -> Self {
        Self::new()
    }
}

fn session_from_response(response: &reqwest::Response) -> Session {
    let cookies = response
        .headers()
        .get_all(reqwest::header::SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_owned));
    Session::from_set_cookie_headers(cookies)
}

fn decode_login_error(status: u16, body: Result<String, reqwest::Error>) -> AuthenticationError {
    let text = match body {
        Ok(text) => text,
        Err(e) => return AuthenticationError::Network(format!("reading error body: {e}")),
    };
    let Ok(parsed) = serde_json::from_str::<ErrorEnvelopeShape>(&text) else {
        return AuthenticationError::LoginFailed {
            message: format!("HTTP {status}: {text}"),
            code: None,
        };
    };

    let (message, code) = if let Some(first) = parsed.errors.as_ref().and_then(|e| e.first()) {
        let message = non_empty(&first.error_message)
            .or_else(|| non_empty(&first.error_code))
            .unwrap_or_else(|| format!("HTTP {status}"));
        (message, first.error_code.clone())
    } else {
        let message = non_empty(&parsed.message)
            .or_else(|| non_empty(&parsed.error_message))
            .or_else(|| non_empty(&parsed.error_code))
            .unwrap_or_else(|| format!("HTTP {status}"));
        (message, parsed.error_code.clone())
    };

    tracing::warn!(status, code = ?code, "login request failed");
    AuthenticationError::LoginFailed { message, code }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_ref().filter(|s| !s.is_empty()).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_test_support::mock_rest::MockRestServer;

    #[tokio::test]
    async fn begin_login_returns_second_factor_signal_and_cookies() {
        let server = MockRestServer::start().await;
        server.set_process_id("abc").await;
        let client = HandshakeClient::new().with_base_url(server.base_url());
        let creds = Credentials::new("+491701234567", "1234").unwrap();

        let (started, session) = client.begin_login(&creds).await.unwrap();
        assert_eq!(started.process_id, "abc");
        assert_eq!(started.signal.masked_phone, "+49170***67");
        assert!(!session.is_empty());
    }

    #[tokio::test]
    async fn begin_login_surfaces_pin_invalid() {
        let server = MockRestServer::start().await;
        server.reject_login("PIN_INVALID", "invalid pin").await;
        let client = HandshakeClient::new().with_base_url(server.base_url());
        let creds = Credentials::new("+491701234567", "0000").unwrap();

        let err = client.begin_login(&creds).await.unwrap_err();
        match err {
            AuthenticationError::LoginFailed { message, code } => {
                assert_eq!(message, "invalid pin");
                assert_eq!(code.as_deref(), Some("PIN_INVALID"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn submit_second_factor_promotes_to_authenticated_cookies() {
        let server = MockRestServer::start().await;
        server.set_process_id("abc").await;
        server.accept_second_factor("1234").await;
        let client = HandshakeClient::new().with_base_url(server.base_url());
        let creds = Credentials::new("+491701234567", "1234").unwrap();

        let (started, _) = client.begin_login(&creds).await.unwrap();
        let session = client
            .submit_second_factor(&started.process_id, "1234")
            .await
            .unwrap();
        assert!(!session.is_empty());
    }

    #[tokio::test]
    async fn submit_second_factor_rejects_wrong_code() {
        let server = MockRestServer::start().await;
        server.set_process_id("abc").await;
        server.accept_second_factor("1234").await;
        let client = HandshakeClient::new().with_base_url(server.base_url());

        let err = client.submit_second_factor("abc", "0000").await.unwrap_err();
        assert!(matches!(err, AuthenticationError::SecondFactorRejected { .. }));
    }
}
