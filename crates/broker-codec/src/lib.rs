// broker-codec: parses and emits the broker's framed text protocol.
//
// Frame grammar: `<digits> WS (A|D|C|E) WS <payload>`. On `D`, the payload is
// a tab-separated delta edit script applied against the per-subscription
// baseline; on `A`/`E` it's a JSON document; `C` carries no payload.
//
// The baseline table (`PreviousResponses` in spec terms) is owned
// exclusively by this crate's `Codec`, mirroring the single-reader-task
// discipline the session layer must uphold: only the reader task may touch
// a `Codec` instance.

use std::collections::HashMap;

use broker_protocol::{FrameCode, WireError, WireMessage};

mod delta;
mod frame;
mod outbound;

pub use delta::apply_delta;
pub use frame::{parse_frame, RawFrame};
pub use outbound::{connect_frame, sub_frame, unsub_frame};

/// Decodes inbound frames, applying delta reconstruction and owning the
/// per-subscription baseline table.
#[derive(Debug, Default)]
pub struct Codec {
    baselines: HashMap<u64, String>,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one inbound text frame into a [`WireMessage`], mutating the
    /// baseline table as needed.
    ///
    /// A JSON parse failure raises a [`WireError::Json`] for this frame only
    /// — it does not disturb the baseline or any other subscription's state.
    pub fn decode(&mut self, raw: &str) -> Result<WireMessage, WireError> {
        let frame = parse_frame(raw)?;
        match frame.code {
            FrameCode::Answer => {
                let json_str = frame.payload.to_owned();
                let payload = parse_json(frame.id, &json_str)?;
                self.baselines.insert(frame.id, json_str);
                Ok(WireMessage {
                    id: frame.id,
                    code: FrameCode::Answer,
                    payload: Some(payload),
                })
            }
            FrameCode::Delta => {
                let baseline = self
                    .baselines
                    .get(&frame.id)
                    .ok_or(WireError::NoBaseline { id: frame.id })?;
                let reconstructed = apply_delta(baseline, frame.payload, frame.id)?;
                let payload = parse_json(frame.id, &reconstructed)?;
                self.baselines.insert(frame.id, reconstructed);
                Ok(WireMessage {
                    id: frame.id,
                    code: FrameCode::Delta,
                    payload: Some(payload),
                })
            }
            FrameCode::Complete => {
                self.baselines.remove(&frame.id);
                Ok(WireMessage {
                    id: frame.id,
                    code: FrameCode::Complete,
                    payload: None,
                })
            }
            FrameCode::Error => {
                let payload = parse_json(frame.id, frame.payload)?;
                Ok(WireMessage {
                    id: frame.id,
                    code: FrameCode::Error,
                    payload: Some(payload),
                })
            }
        }
    }

    /// The reconstructed JSON string currently held as the baseline for
    /// `id`, if any. Exposed for tests and diagnostics.
    pub fn baseline(&self, id: u64) -> Option<&str> {
        self.baselines.get(&id).map(String::as_str)
    }

    /// Drop the baseline for `id` (e.g. on unsubscribe), without waiting for
    /// a `C` frame.
    pub fn forget(&mut self, id: u64) {
        self.baselines.remove(&id);
    }
}

fn parse_json(id: u64, s: &str) -> Result<serde_json::Value, WireError> {
    serde_json::from_str(s).map_err(|e| WireError::Json {
        id,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_answer_scenario() {
        let mut codec = Codec::new();
        let msg = codec
            .decode(r#"7 A {"bid":{"price":64},"ask":{"price":65}}"#)
            .unwrap();
        assert_eq!(msg.id, 7);
        assert_eq!(msg.code, FrameCode::Answer);
        assert_eq!(
            msg.payload.unwrap(),
            serde_json::json!({"bid":{"price":64},"ask":{"price":65}})
        );
    }

    #[test]
    fn delta_update_scenario() {
        let mut codec = Codec::new();
        codec.decode(r#"3 A {"x":1,"y":2}"#).unwrap();
        let msg = codec.decode("3 D =5\t+3\t-1\t=7").unwrap();
        assert_eq!(codec.baseline(3), Some(r#"{"x":3,"y":2}"#));
        assert_eq!(msg.payload.unwrap(), serde_json::json!({"x":3,"y":2}));
    }

    #[test]
    fn delta_without_baseline_is_a_wire_error() {
        let mut codec = Codec::new();
        let err = codec.decode("9 D =5\t+3").unwrap_err();
        assert_eq!(err, WireError::NoBaseline { id: 9 });
    }

    #[test]
    fn complete_then_delta_is_a_wire_error() {
        let mut codec = Codec::new();
        codec.decode(r#"3 A {"x":1}"#).unwrap();
        codec.decode("3 C").unwrap();
        assert!(codec.baseline(3).is_none());
        let err = codec.decode("3 D =1").unwrap_err();
        assert_eq!(err, WireError::NoBaseline { id: 3 });
    }

    #[test]
    fn other_subscriptions_untouched_by_a_failed_delta() {
        let mut codec = Codec::new();
        codec.decode(r#"1 A {"a":1}"#).unwrap();
        let _ = codec.decode("2 D =1");
        assert_eq!(codec.baseline(1), Some(r#"{"a":1}"#));
    }

    #[test]
    fn json_parse_failure_does_not_disturb_baseline() {
        let mut codec = Codec::new();
        codec.decode(r#"1 A {"a":1}"#).unwrap();
        let err = codec.decode("1 D =100").unwrap_err();
        assert!(matches!(err, WireError::MalformedFrame(_)));
        assert_eq!(codec.baseline(1), Some(r#"{"a":1}"#));
    }

    #[test]
    fn error_frame_parses_payload_but_does_not_touch_baseline() {
        let mut codec = Codec::new();
        let msg = codec
            .decode(r#"4 E {"errorCode":"UNKNOWN_ISIN"}"#)
            .unwrap();
        assert_eq!(msg.code, FrameCode::Error);
        assert!(codec.baseline(4).is_none());
    }
}
