//! JSON codec for envelopes
//!
//! Each transport frame carries exactly one self-contained envelope.
//! Decoding validates the structure before any handler sees the message.

use bytes::Bytes;
use serde_json::{Map, Value};

use crate::{RuntimeMessage, WireError, WireResult, PROTOCOL_VERSION};

/// Top-level fields every envelope must carry
const REQUIRED_FIELDS: &[&str] = &[
    "version",
    "id",
    "source",
    "target",
    "channel",
    "type",
    "timestamp",
    "identity",
    "loopGuard",
];

impl RuntimeMessage {
    /// Serialize to a single frame
    pub fn encode(&self) -> WireResult<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse and validate a frame
    pub fn decode(buf: &[u8]) -> WireResult<Self> {
        let value: Value = serde_json::from_slice(buf)?;
        Self::from_value(value)
    }

    /// Validate an already-parsed JSON value
    pub fn from_value(value: Value) -> WireResult<Self> {
        let object = value.as_object().ok_or(WireError::NotAnObject)?;
        check_version(object)?;
        for field in REQUIRED_FIELDS {
            if !object.contains_key(*field) {
                return Err(WireError::MissingField(field));
            }
        }

        let message: RuntimeMessage =
            serde_json::from_value(value).map_err(|e| WireError::InvalidField {
                field: "envelope",
                reason: e.to_string(),
            })?;
        message.validate()?;
        Ok(message)
    }

    /// Semantic checks beyond field presence
    pub fn validate(&self) -> WireResult<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedVersion(self.version));
        }
        if self.id.is_empty() {
            return Err(WireError::InvalidField {
                field: "id",
                reason: "empty".into(),
            });
        }
        if self.message_type.is_empty() {
            return Err(WireError::InvalidField {
                field: "type",
                reason: "empty".into(),
            });
        }
        if self.target.requires_target_id()
            && self.target_id.as_deref().map_or(true, str::is_empty)
        {
            return Err(WireError::InvalidField {
                field: "targetId",
                reason: format!("required for target {:?}", self.target),
            });
        }
        if self.loop_guard.seen_by.is_empty() {
            return Err(WireError::InvalidField {
                field: "loopGuard.seenBy",
                reason: "must contain the origin".into(),
            });
        }
        Ok(())
    }
}

fn check_version(object: &Map<String, Value>) -> WireResult<()> {
    let version = object
        .get("version")
        .ok_or(WireError::MissingField("version"))?;
    match version.as_u64() {
        Some(PROTOCOL_VERSION) => Ok(()),
        Some(other) => Err(WireError::UnsupportedVersion(other)),
        None => Err(WireError::InvalidField {
            field: "version",
            reason: format!("expected integer, got {}", version),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_message, mark_seen, Channel, MessageParams, MessageTarget};
    use serde_json::json;
    use tabmesh_core::Identity;

    fn sample() -> RuntimeMessage {
        let identity = Identity::new("dev".into(), "tab-a".into(), "ses".into()).with_user("u1");
        let params = MessageParams::new(Channel::State, "state_update")
            .with_payload(json!({"doc": {"title": "x"}}))
            .with_ttl(5_000)
            .with_priority(3);
        create_message(params, &identity, 42)
    }

    #[test]
    fn test_decode_relayed_envelope() {
        let msg = mark_seen(&sample(), "hub");
        let bytes = msg.encode().unwrap();
        let decoded = RuntimeMessage::decode(&bytes).unwrap();

        assert_eq!(decoded.loop_guard.seen_by, vec!["tab-a", "hub"]);
        assert_eq!(decoded.identity.user_id.as_deref(), Some("u1"));
        assert_eq!(decoded.ttl, Some(5_000));
    }

    #[test]
    fn test_rejects_non_json() {
        assert!(matches!(RuntimeMessage::decode(b"not json"), Err(WireError::Json(_))));
        assert!(matches!(RuntimeMessage::decode(b"[1,2]"), Err(WireError::NotAnObject)));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["version"] = json!(2);
        assert!(matches!(
            RuntimeMessage::from_value(value),
            Err(WireError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_rejects_missing_field() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value.as_object_mut().unwrap().remove("loopGuard");
        assert!(matches!(
            RuntimeMessage::from_value(value),
            Err(WireError::MissingField("loopGuard"))
        ));
    }

    #[test]
    fn test_rejects_unknown_channel() {
        let mut value = serde_json::to_value(sample()).unwrap();
        value["channel"] = json!("telepathy");
        assert!(matches!(
            RuntimeMessage::from_value(value),
            Err(WireError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_rejects_specific_without_target_id() {
        let mut msg = sample();
        msg.target = MessageTarget::Specific;
        msg.target_id = None;
        let bytes = serde_json::to_vec(&msg).unwrap();
        assert!(matches!(
            RuntimeMessage::decode(&bytes),
            Err(WireError::InvalidField { field: "targetId", .. })
        ));
    }

    #[test]
    fn test_optional_fields_default() {
        let mut value = serde_json::to_value(sample()).unwrap();
        let object = value.as_object_mut().unwrap();
        object.remove("priority");
        object.remove("requiresAck");
        object.remove("payload");

        let msg = RuntimeMessage::from_value(value).unwrap();
        assert_eq!(msg.priority, 0);
        assert!(!msg.requires_ack);
        assert!(msg.payload.is_null());
    }
}
