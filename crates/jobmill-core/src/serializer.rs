//! Invocation encoding.
//!
//! Stored payloads are a versioned JSON envelope:
//! `{"v":1,"capability":"mail","operation":"send","args":{...}}`.
//! Unknown fields are ignored so newer writers stay readable.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use jobmill_protocols::{Invocation, JobError, Payload};

/// Current envelope version.
pub const ENVELOPE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u32,
    capability: String,
    operation: String,
    #[serde(default)]
    args: Value,
}

/// Encode a call to `capability.operation`.
pub fn encode(capability: &str, operation: &str, args: &Value) -> Result<Payload, JobError> {
    let envelope = Envelope {
        v: ENVELOPE_VERSION,
        capability: capability.to_string(),
        operation: operation.to_string(),
        args: args.clone(),
    };
    serde_json::to_vec(&envelope)
        .map(Payload::from_bytes)
        .map_err(|e| JobError::Deserialization(format!("cannot encode invocation: {}", e)))
}

pub fn encode_invocation(invocation: &Invocation) -> Result<Payload, JobError> {
    encode(&invocation.capability, &invocation.operation, &invocation.args)
}

/// Decode a stored payload.
pub fn decode(payload: &Payload) -> Result<Invocation, JobError> {
    let value: Value = serde_json::from_slice(payload.as_bytes())
        .map_err(|e| JobError::Deserialization(format!("malformed payload: {}", e)))?;

    match value.get("v").and_then(Value::as_u64) {
        Some(v) if v == u64::from(ENVELOPE_VERSION) => {}
        Some(v) => {
            return Err(JobError::Deserialization(format!(
                "unsupported envelope version {}",
                v
            )));
        }
        None => {
            return Err(JobError::Deserialization(
                "payload has no envelope version".to_string(),
            ));
        }
    }

    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|e| JobError::Deserialization(format!("malformed envelope: {}", e)))?;
    Ok(Invocation {
        capability: envelope.capability,
        operation: envelope.operation,
        args: envelope.args,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_envelope_layout() {
        let payload = encode("echo", "echo", &json!({"message": "hello"})).unwrap();
        let value: Value = serde_json::from_slice(payload.as_bytes()).unwrap();
        assert_eq!(value["v"], 1);
        assert_eq!(value["capability"], "echo");
        assert_eq!(value["operation"], "echo");
        assert_eq!(value["args"]["message"], "hello");
    }

    #[test]
    fn test_decode_ignores_unknown_fields() {
        let payload = Payload::from(
            r#"{"v":1,"capability":"mail","operation":"send","args":{"to":"a"},"trace":"x"}"#,
        );
        let inv = decode(&payload).unwrap();
        assert_eq!(inv.display_name(), "mail.send");
        assert_eq!(inv.args, json!({"to": "a"}));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            decode(&Payload::from("not json")),
            Err(JobError::Deserialization(_))
        ));
        assert!(matches!(
            decode(&Payload::from(r#"{"capability":"a","operation":"b"}"#)),
            Err(JobError::Deserialization(_))
        ));
        assert!(matches!(
            decode(&Payload::from(r#"{"v":2,"capability":"a","operation":"b"}"#)),
            Err(JobError::Deserialization(_))
        ));
        assert!(matches!(
            decode(&Payload::from(r#"{"v":1,"operation":"b"}"#)),
            Err(JobError::Deserialization(_))
        ));
    }

    fn arb_json() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            any::<u64>().prop_map(|n| json!(n)),
            ".{0,16}".prop_map(Value::String),
        ];
        leaf.prop_recursive(3, 32, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..6).prop_map(Value::Array),
                prop::collection::hash_map("[a-z_]{1,8}", inner, 0..6)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(
            capability in "[a-z][a-z0-9_.-]{0,15}",
            operation in "[a-z][a-z0-9_]{0,15}",
            args in arb_json(),
        ) {
            let invocation = Invocation::new(capability, operation, args);
            let payload = encode_invocation(&invocation).unwrap();
            prop_assert_eq!(decode(&payload).unwrap(), invocation);
        }
    }
}
