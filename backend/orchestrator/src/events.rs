//! Structured receipt events emitted by the circle contracts.
//!
//! Events are consumed by name and field name under an explicit schema
//! version. Nothing here infers meaning from field positions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::CircleId;

/// Schema version of `CircleCreated` this crate understands.
pub const CIRCLE_CREATED_SCHEMA: u16 = 1;

/// One event attached to a confirmed receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptEvent {
    pub name: String,
    pub schema_version: u16,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl ReceiptEvent {
    pub fn new(name: &str, schema_version: u16, fields: Value) -> Self {
        let fields = match fields {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            name: name.to_string(),
            schema_version,
            fields,
        }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_name(&self.name)
    }
}

/// Receipt events the orchestrator recognises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    CircleCreated,
    PhaseAdvanced,
    MemberJoined,
    PaymentMade,
    DefaultHandled,
    PayoutDistributed,
    CycleAdvanced,
    /// An event we don't recognise yet.
    Unknown,
}

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "CircleCreated" => Self::CircleCreated,
            "PhaseAdvanced" => Self::PhaseAdvanced,
            "MemberJoined" => Self::MemberJoined,
            "PaymentMade" => Self::PaymentMade,
            "DefaultHandled" => Self::DefaultHandled,
            "PayoutDistributed" => Self::PayoutDistributed,
            "CycleAdvanced" => Self::CycleAdvanced,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CircleCreated => "CircleCreated",
            Self::PhaseAdvanced => "PhaseAdvanced",
            Self::MemberJoined => "MemberJoined",
            Self::PaymentMade => "PaymentMade",
            Self::DefaultHandled => "DefaultHandled",
            Self::PayoutDistributed => "PayoutDistributed",
            Self::CycleAdvanced => "CycleAdvanced",
            Self::Unknown => "Unknown",
        }
    }
}

/// Id recovered from a registration receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CircleIdOutcome {
    Known { circle_id: CircleId },
    /// The receipt confirmed, but the id could not be read unambiguously.
    Unknown { tx_hash: String, reason: String },
}

impl CircleIdOutcome {
    pub fn circle_id(&self) -> Option<CircleId> {
        match self {
            Self::Known { circle_id } => Some(*circle_id),
            Self::Unknown { .. } => None,
        }
    }
}

/// Recover the new circle's id from the `CircleCreated` event.
pub fn decode_circle_id(tx_hash: &str, events: &[ReceiptEvent]) -> CircleIdOutcome {
    let unknown = |reason: String| CircleIdOutcome::Unknown {
        tx_hash: tx_hash.to_string(),
        reason,
    };

    let created: Vec<&ReceiptEvent> = events
        .iter()
        .filter(|e| e.kind() == EventKind::CircleCreated)
        .collect();

    if created.is_empty() {
        return unknown("receipt carries no CircleCreated event".to_string());
    }

    let mut ids = Vec::with_capacity(created.len());
    for event in created {
        if event.schema_version != CIRCLE_CREATED_SCHEMA {
            return unknown(format!(
                "CircleCreated schema v{} is not supported",
                event.schema_version
            ));
        }
        match event.fields.get("circle_id").and_then(field_as_u64) {
            Some(id) => ids.push(id),
            None => return unknown("CircleCreated.circle_id missing or not an integer".to_string()),
        }
    }

    ids.dedup();
    match ids.as_slice() {
        [id] => CircleIdOutcome::Known { circle_id: *id },
        _ => unknown(format!("conflicting circle ids {ids:?}")),
    }
}

/// Integer fields may arrive as JSON numbers or decimal strings.
fn field_as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn created(version: u16, fields: Value) -> ReceiptEvent {
        ReceiptEvent::new("CircleCreated", version, fields)
    }

    #[test]
    fn event_kind_from_name() {
        assert_eq!(EventKind::from_name("CircleCreated"), EventKind::CircleCreated);
        assert_eq!(EventKind::from_name("PaymentMade"), EventKind::PaymentMade);
        assert_eq!(EventKind::from_name("Transfer"), EventKind::Unknown);
        assert_eq!(EventKind::PayoutDistributed.as_str(), "PayoutDistributed");
    }

    #[test]
    fn decodes_id_by_field_name() {
        let events = vec![
            ReceiptEvent::new("Transfer", 1, json!({ "amount": 5 })),
            created(1, json!({ "creator": "GABC", "circle_id": 42 })),
        ];
        assert_eq!(
            decode_circle_id("tx", &events),
            CircleIdOutcome::Known { circle_id: 42 }
        );
    }

    #[test]
    fn decimal_string_ids_are_accepted() {
        let events = vec![created(1, json!({ "circle_id": "17" }))];
        assert_eq!(decode_circle_id("tx", &events).circle_id(), Some(17));
    }

    #[test]
    fn missing_event_is_unknown_not_zero() {
        let outcome = decode_circle_id("tx-9", &[ReceiptEvent::new("Transfer", 1, json!({}))]);
        assert!(matches!(
            outcome,
            CircleIdOutcome::Unknown { ref tx_hash, .. } if tx_hash == "tx-9"
        ));
        assert_eq!(outcome.circle_id(), None);
    }

    #[test]
    fn unsupported_schema_is_unknown() {
        let events = vec![created(2, json!({ "circle_id": 3 }))];
        assert_eq!(decode_circle_id("tx", &events).circle_id(), None);
    }

    #[test]
    fn non_integer_id_is_unknown() {
        let events = vec![created(1, json!({ "circle_id": "abc" }))];
        assert_eq!(decode_circle_id("tx", &events).circle_id(), None);
        let events = vec![created(1, json!({ "id": 3 }))];
        assert_eq!(decode_circle_id("tx", &events).circle_id(), None);
    }

    #[test]
    fn conflicting_ids_are_unknown() {
        let events = vec![
            created(1, json!({ "circle_id": 3 })),
            created(1, json!({ "circle_id": 4 })),
        ];
        assert_eq!(decode_circle_id("tx", &events).circle_id(), None);

        let repeated = vec![
            created(1, json!({ "circle_id": 3 })),
            created(1, json!({ "circle_id": 3 })),
        ];
        assert_eq!(decode_circle_id("tx", &repeated).circle_id(), Some(3));
    }
}
