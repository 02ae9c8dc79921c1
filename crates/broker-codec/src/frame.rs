use broker_protocol::{FrameCode, WireError};

/// A parsed but not-yet-reconstructed inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    pub id: u64,
    pub code: FrameCode,
    pub payload: &'a str,
}

/// Parse `<digits> WS (A|D|C|E) WS <payload>`. The payload, if present, may
/// contain arbitrary whitespace including newlines and is returned
/// unmodified (trailing newline from the transport framing is stripped).
pub fn parse_frame(raw: &str) -> Result<RawFrame<'_>, WireError> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    let mut rest = raw;

    let digit_len = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digit_len == 0 {
        return Err(WireError::MalformedFrame(format!(
            "missing subscription id: {raw:?}"
        )));
    }
    let id: u64 = rest[..digit_len]
        .parse()
        .map_err(|_| WireError::MalformedFrame(format!("invalid subscription id: {raw:?}")))?;
    rest = &rest[digit_len..];

    let ws_len = rest.find(|c: char| !c.is_whitespace()).unwrap_or(0);
    if ws_len == 0 {
        return Err(WireError::MalformedFrame(format!(
            "expected whitespace after id: {raw:?}"
        )));
    }
    rest = &rest[ws_len..];

    let mut code_chars = rest.chars();
    let code_char = code_chars
        .next()
        .ok_or_else(|| WireError::MalformedFrame(format!("missing frame code: {raw:?}")))?;
    let code = FrameCode::from_char(code_char)
        .ok_or_else(|| WireError::MalformedFrame(format!("unknown frame code '{code_char}' in: {raw:?}")))?;
    rest = code_chars.as_str();

    if rest.is_empty() {
        return Ok(RawFrame { id, code, payload: "" });
    }

    let ws_len = rest.find(|c: char| !c.is_whitespace());
    let payload = match ws_len {
        Some(n) => &rest[n..],
        None => "",
    };
    Ok(RawFrame { id, code, payload })
}
