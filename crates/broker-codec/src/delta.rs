use broker_protocol::WireError;

/// Apply a tab-separated delta edit script to `baseline`, returning the
/// reconstructed string.
///
/// Cursor arithmetic (`-<n>` skip, `=<n>` copy) operates over UTF-16 code
/// units, matching the wire protocol's apparent origin; ASCII-only JSON
/// payloads make this equivalent to byte arithmetic in the common case, but
/// only the UTF-16 interpretation is correct in general.
pub fn apply_delta(baseline: &str, delta: &str, id: u64) -> Result<String, WireError> {
    let baseline_units: Vec<u16> = baseline.encode_utf16().collect();
    let mut cursor = 0usize;
    let mut output: Vec<u16> = Vec::with_capacity(baseline_units.len());

    for instruction in delta.split('\t') {
        if instruction.is_empty() {
            continue;
        }
        let mut chars = instruction.chars();
        let marker = chars.next().expect("non-empty instruction has a first char");
        let rest = chars.as_str();

        match marker {
            '+' => {
                let replaced: String = rest.chars().map(|c| if c == '+' { ' ' } else { c }).collect();
                let decoded = urlencoding::decode(&replaced)
                    .map_err(|e| WireError::MalformedFrame(format!("delta append not URL-decodable: {e}")))?;
                output.extend(decoded.trim().encode_utf16());
            }
            '-' => {
                let n = parse_count(rest, id)?;
                advance_cursor(&baseline_units, &mut cursor, n, id)?;
            }
            '=' => {
                let n = parse_count(rest, id)?;
                let end = cursor
                    .checked_add(n)
                    .filter(|&end| end <= baseline_units.len())
                    .ok_or_else(|| {
                        WireError::MalformedFrame(format!(
                            "delta copy of {n} code units exceeds baseline length for subscription {id}"
                        ))
                    })?;
                output.extend_from_slice(&baseline_units[cursor..end]);
                cursor = end;
            }
            _ => {
                #[cfg(feature = "strict-delta-instructions")]
                {
                    return Err(WireError::UnknownDeltaInstruction {
                        id,
                        instruction: instruction.to_owned(),
                    });
                }
                #[cfg(not(feature = "strict-delta-instructions"))]
                {
                    tracing::debug!(id, instruction, "ignoring unknown delta instruction");
                }
            }
        }
    }

    String::from_utf16(&output).map_err(|_| WireError::InvalidUtf16 { id })
}

fn parse_count(s: &str, id: u64) -> Result<usize, WireError> {
    s.parse().map_err(|_| {
        WireError::MalformedFrame(format!("invalid delta instruction count '{s}' for subscription {id}"))
    })
}

fn advance_cursor(baseline_units: &[u16], cursor: &mut usize, n: usize, id: u64) -> Result<(), WireError> {
    let next = cursor.checked_add(n).filter(|&next| next <= baseline_units.len());
    match next {
        Some(next) => {
            *cursor = next;
            Ok(())
        }
        None => Err(WireError::MalformedFrame(format!(
            "delta skip of {n} code units exceeds baseline length for subscription {id}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_example_copy_insert_skip_copy() {
        let result = apply_delta(r#"{"x":1,"y":2}"#, "=5\t+3\t-1\t=7", 3).unwrap();
        assert_eq!(result, r#"{"x":3,"y":2}"#);
    }

    #[test]
    fn append_replaces_plus_with_space_and_url_decodes() {
        let result = apply_delta("", "+hello+world%21", 1).unwrap();
        assert_eq!(result, "hello world!");
    }

    #[test]
    fn append_trims_surrounding_whitespace() {
        let result = apply_delta("", "+%20hi%20", 1).unwrap();
        assert_eq!(result, "hi");
    }

    #[test]
    fn unknown_instruction_is_ignored_by_default() {
        let result = apply_delta("abc", "?whatever\t=3", 1).unwrap();
        assert_eq!(result, "abc");
    }

    #[test]
    fn copy_beyond_baseline_length_is_malformed_frame() {
        let err = apply_delta("abc", "=10", 1).unwrap_err();
        assert!(matches!(err, WireError::MalformedFrame(_)));
    }

    #[test]
    fn skip_beyond_baseline_length_is_malformed_frame() {
        let err = apply_delta("abc", "-10\t+x", 1).unwrap_err();
        assert!(matches!(err, WireError::MalformedFrame(_)));
    }

    #[test]
    fn empty_delta_reproduces_empty_string() {
        assert_eq!(apply_delta("", "", 1).unwrap(), "");
    }
}
