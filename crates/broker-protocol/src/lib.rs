// broker-protocol: Data model and error types shared by the broker session
// core crates.
//
// No I/O lives here — just the wire-adjacent structs, the auth/connection
// state machines, and the three error kinds the core surfaces to callers.

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod error;
pub use clock::{Clock, SystemClock};
pub use error::{AuthenticationError, SecondFactorRequired, SubscriptionError, WireError};

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Phone number + PIN, held only in memory by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub phone_number: String,
    pub pin: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CredentialsError {
    #[error("phone number '{0}' is not a valid E.164 number")]
    InvalidPhoneNumber(String),
    #[error("pin must be exactly 4 digits")]
    InvalidPin,
}

impl Credentials {
    /// Validate and construct. Phone must match `^\+[1-9]\d{1,14}$`; pin must
    /// be exactly 4 ASCII digits.
    pub fn new(phone_number: impl Into<String>, pin: impl Into<String>) -> Result<Self, CredentialsError> {
        let phone_number = phone_number.into();
        let pin = pin.into();
        if !is_valid_e164(&phone_number) {
            return Err(CredentialsError::InvalidPhoneNumber(phone_number));
        }
        if pin.len() != 4 || !pin.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CredentialsError::InvalidPin);
        }
        Ok(Self { phone_number, pin })
    }

    /// Masked form for diagnostics: `<first 6>***<last 2>`, or
    /// `<first 3>***<last 2>` if the number is too short for the long form.
    pub fn masked_phone(&self) -> String {
        mask_phone(&self.phone_number)
    }
}

fn is_valid_e164(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some('+') => {}
        _ => return false,
    }
    let rest: Vec<char> = chars.collect();
    // `^\+[1-9]\d{1,14}$`: one leading non-zero digit plus 1-14 more digits.
    if rest.len() < 2 || rest.len() > 15 {
        return false;
    }
    if rest[0] == '0' {
        return false;
    }
    rest.iter().all(|c| c.is_ascii_digit())
}

/// `<first 6>***<last 2>` when the string has at least 9 characters (enough
/// that the prefix and suffix windows never overlap), else `<first 3>***<last 2>`.
pub fn mask_phone(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let len = chars.len();
    let (prefix_len, suffix_len) = if len >= 9 { (6, 2) } else { (3.min(len), 2.min(len)) };
    let prefix: String = chars.iter().take(prefix_len).collect();
    let suffix: String = chars.iter().rev().take(suffix_len).collect::<Vec<_>>().into_iter().rev().collect();
    format!("{prefix}***{suffix}")
}

// ---------------------------------------------------------------------------
// Session (cookie jar)
// ---------------------------------------------------------------------------

/// Opaque cookie jar captured from the handshake's `Set-Cookie` headers.
///
/// Cookies are stored verbatim and replayed as a single `Cookie` header on
/// the socket upgrade; the core does not interpret cookie attributes
/// (expiry, domain, path, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    cookies: Vec<(String, String)>,
}

impl Session {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from a list of raw `Set-Cookie` header values, replacing any
    /// prior cookie with the same name (later headers win).
    pub fn from_set_cookie_headers<I, S>(headers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut session = Self::empty();
        for header in headers {
            if let Some((name, value)) = parse_set_cookie(header.as_ref()) {
                session.set(name, value);
            }
        }
        session
    }

    fn set(&mut self, name: String, value: String) {
        if let Some(existing) = self.cookies.iter_mut().find(|(n, _)| *n == name) {
            existing.1 = value;
        } else {
            self.cookies.push((name, value));
        }
    }

    /// Merge another jar's cookies into this one (later wins).
    pub fn merge(&mut self, other: Session) {
        for (name, value) in other.cookies {
            self.set(name, value);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Render as a single `Cookie` header value: `name=value; name2=value2`.
    pub fn cookie_header(&self) -> String {
        self.cookies
            .iter()
            .map(|(n, v)| format!("{n}={v}"))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

fn parse_set_cookie(header_value: &str) -> Option<(String, String)> {
    let first_attr = header_value.split(';').next()?.trim();
    let (name, value) = first_attr.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    Some((name.to_owned(), value.trim().to_owned()))
}

// ---------------------------------------------------------------------------
// AuthState / ConnectionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// Carries the masked phone number so the UI can re-display it while
    /// prompting for the second-factor code.
    AwaitingSecondFactor { masked_phone: String },
    Authenticated,
}

impl AuthState {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthState::Authenticated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub fn permits_subscriptions(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

// ---------------------------------------------------------------------------
// Wire message model
// ---------------------------------------------------------------------------

/// A single decoded broker frame, after delta reconstruction (if any) and
/// JSON parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub id: u64,
    pub code: FrameCode,
    /// `None` for `C` (complete); a JSON value for `A`/`D`/`E`.
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameCode {
    Answer,
    Delta,
    Complete,
    Error,
}

impl FrameCode {
    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(FrameCode::Answer),
            'D' => Some(FrameCode::Delta),
            'C' => Some(FrameCode::Complete),
            'E' => Some(FrameCode::Error),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Outbound connect descriptor
// ---------------------------------------------------------------------------

/// The fixed handshake descriptor sent as the payload of the `connect`
/// frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectDescriptor {
    pub locale: String,
    #[serde(rename = "platformId")]
    pub platform_id: String,
    #[serde(rename = "platformVersion")]
    pub platform_version: String,
    #[serde(rename = "clientId")]
    pub client_id: String,
    #[serde(rename = "clientVersion")]
    pub client_version: String,
}

impl Default for ConnectDescriptor {
    fn default() -> Self {
        Self {
            locale: "en".to_owned(),
            platform_id: "webtrading".to_owned(),
            platform_version: "chrome - 120.0.0".to_owned(),
            client_id: "app.traderepublic.com".to_owned(),
            client_version: "1.0.0".to_owned(),
        }
    }
}

/// Protocol version number embedded in the literal `connect <n> <json>` frame.
pub const CONNECT_PROTOCOL_VERSION: u32 = 31;

// ---------------------------------------------------------------------------
// Error-envelope extraction (shared by HandshakeClient and E-frame handling)
// ---------------------------------------------------------------------------

/// Extract a human-readable message from a broker error envelope.
///
/// Tries, in order: `errors[0].errorMessage` → `errors[0].errorCode` →
/// `message` → `errorMessage` → `errorCode`; falls back to a generic string
/// if none of those fields are populated.
pub fn extract_error_message(value: &serde_json::Value) -> String {
    if let Some(errors) = value.get("errors").and_then(|e| e.as_array()) {
        if let Some(first) = errors.first() {
            if let Some(s) = non_empty_str(first, "errorMessage") {
                return s;
            }
            if let Some(s) = non_empty_str(first, "errorCode") {
                return s;
            }
        }
    }
    for field in ["message", "errorMessage", "errorCode"] {
        if let Some(s) = non_empty_str(value, field) {
            return s;
        }
    }
    "unknown broker error".to_owned()
}

fn non_empty_str(value: &serde_json::Value, field: &str) -> Option<String> {
    value
        .get(field)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_credentials_round_trip() {
        let creds = Credentials::new("+491701234567", "1234").unwrap();
        assert_eq!(creds.phone_number, "+491701234567");
    }

    #[test]
    fn rejects_malformed_phone() {
        assert!(Credentials::new("491701234567", "1234").is_err());
        assert!(Credentials::new("+0701234567", "1234").is_err());
        // A single digit after `+` fails `\d{1,14}` after the leading `[1-9]`.
        assert!(Credentials::new("+7", "1234").is_err());
    }

    #[test]
    fn rejects_malformed_pin() {
        assert!(Credentials::new("+491701234567", "123").is_err());
        assert!(Credentials::new("+491701234567", "12a4").is_err());
    }

    #[test]
    fn masks_long_phone_number() {
        assert_eq!(mask_phone("+491701234567"), "+49170***67");
    }

    #[test]
    fn masks_short_phone_number() {
        assert_eq!(mask_phone("+491"), "+49***91");
    }

    #[test]
    fn session_renders_cookie_header_and_dedupes() {
        let session = Session::from_set_cookie_headers([
            "sessionId=abc; Path=/; HttpOnly",
            "deviceId=xyz; Secure",
            "sessionId=def; Path=/",
        ]);
        assert_eq!(session.cookie_header(), "sessionId=def; deviceId=xyz");
    }

    #[test]
    fn extract_error_message_priority_order() {
        let v = serde_json::json!({
            "errors": [{"errorCode": "PIN_INVALID", "errorMessage": ""}],
            "message": "fallback"
        });
        assert_eq!(extract_error_message(&v), "PIN_INVALID");

        let v2 = serde_json::json!({"message": "top level message"});
        assert_eq!(extract_error_message(&v2), "top level message");

        let v3 = serde_json::json!({"errorCode": "2FA_INVALID"});
        assert_eq!(extract_error_message(&v3), "2FA_INVALID");
    }
}
