//! Frame codec for the `@@MESSAGE@@` line protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, malformed
//! frames reported as [`Decoded::Malformed`] instead of an error so that a
//! noisy stream can never take the reader down.

use serde_json::{Map, Value};

use super::types::Envelope;

/// Sentinel that marks a line as a protocol frame.
pub const PREFIX: &str = "@@MESSAGE@@";

/// Result of decoding one line of worker output.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded<'a> {
    /// A well-formed protocol frame.
    Message(Envelope),
    /// A line without the prefix: plain log output.
    Plain(&'a str),
    /// A prefixed line that could not be decoded.
    Malformed(String),
}

/// Encode a message as a single protocol line (without trailing newline).
///
/// The timestamp is taken at encode time.
pub fn encode(msg_type: &str, payload: Value) -> String {
    encode_envelope(&Envelope {
        msg_type: msg_type.to_string(),
        payload,
        timestamp: Some(now_rfc3339()),
    })
}

/// Encode a prebuilt envelope as a single protocol line.
pub fn encode_envelope(envelope: &Envelope) -> String {
    let mut obj = Map::new();
    obj.insert("type".into(), Value::String(envelope.msg_type.clone()));
    obj.insert("payload".into(), envelope.payload.clone());
    if let Some(ts) = &envelope.timestamp {
        obj.insert("timestamp".into(), Value::String(ts.clone()));
    }
    // serde_json never emits raw newlines for a Value, so the frame stays on one line.
    format!("{PREFIX}{}", Value::Object(obj))
}

/// Decode one line of output.
pub fn decode(line: &str) -> Decoded<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(body) = line.trim_start().strip_prefix(PREFIX) else {
        return Decoded::Plain(line);
    };

    let raw: Value = match serde_json::from_str(body.trim()) {
        Ok(v) => v,
        Err(e) => return Decoded::Malformed(format!("invalid JSON: {e}")),
    };

    let Some(msg_type) = raw.get("type").and_then(Value::as_str) else {
        return Decoded::Malformed("missing 'type' field".into());
    };

    let payload = match raw.get("payload") {
        Some(p @ Value::Object(_)) => p.clone(),
        Some(_) => return Decoded::Malformed("'payload' is not an object".into()),
        None => return Decoded::Malformed("missing 'payload' field".into()),
    };

    let timestamp = raw
        .get("timestamp")
        .and_then(Value::as_str)
        .map(String::from);

    Decoded::Message(Envelope {
        msg_type: msg_type.to_string(),
        payload,
        timestamp,
    })
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip_preserves_type_and_payload() {
        let payload = json!({"feature_id": 7, "step_index": 2, "status": "started", "notes": ""});
        let line = encode("step_update", payload.clone());

        assert!(line.starts_with(PREFIX));
        assert!(!line.contains('\n'));

        let Decoded::Message(env) = decode(&line) else {
            panic!("expected a message");
        };
        assert_eq!(env.msg_type, "step_update");
        assert_eq!(env.payload, payload);
        assert!(env.timestamp.is_some());
    }

    #[test]
    fn multiline_content_stays_on_one_line() {
        let line = encode("agent_chat_message", json!({"content": "a\nb\r\nc"}));
        assert_eq!(line.lines().count(), 1);
        let Decoded::Message(env) = decode(&line) else {
            panic!("expected a message");
        };
        assert_eq!(env.payload["content"], "a\nb\r\nc");
    }

    #[test]
    fn timestamp_is_rfc3339() {
        let line = encode("ping", json!({}));
        let Decoded::Message(env) = decode(&line) else {
            panic!("expected a message");
        };
        let ts = env.timestamp.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
    }

    #[test]
    fn plain_line_passes_through() {
        assert_eq!(decode("Compiling hive v0.1.0\n"), Decoded::Plain("Compiling hive v0.1.0"));
        assert_eq!(decode(""), Decoded::Plain(""));
    }

    #[test]
    fn prefix_with_invalid_json_is_malformed() {
        assert!(matches!(decode("@@MESSAGE@@{not json"), Decoded::Malformed(_)));
        assert!(matches!(decode("@@MESSAGE@@"), Decoded::Malformed(_)));
    }

    #[test]
    fn missing_type_or_payload_is_malformed() {
        assert!(matches!(
            decode(r#"@@MESSAGE@@{"payload":{}}"#),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            decode(r#"@@MESSAGE@@{"type":"ping"}"#),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            decode(r#"@@MESSAGE@@{"type":5,"payload":{}}"#),
            Decoded::Malformed(_)
        ));
        assert!(matches!(
            decode(r#"@@MESSAGE@@{"type":"ping","payload":[1]}"#),
            Decoded::Malformed(_)
        ));
    }

    #[test]
    fn tolerant_reader_ignores_unknown_fields_and_timestamp() {
        let Decoded::Message(env) =
            decode(r#"@@MESSAGE@@{"type":"pong","payload":{},"extra":true}"#)
        else {
            panic!("expected a message");
        };
        assert_eq!(env.msg_type, "pong");
        assert!(env.timestamp.is_none());
    }

    #[test]
    fn crlf_terminated_frame_decodes() {
        assert!(matches!(
            decode("@@MESSAGE@@{\"type\":\"ping\",\"payload\":{}}\r\n"),
            Decoded::Message(_)
        ));
    }
}
