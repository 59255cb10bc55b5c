//! # Packet
//!
//! The addressed, correlatable message unit routed between isles and the
//! manager. Field order on the struct is load-bearing: `serde` serializes
//! struct fields in declaration order, which is how the mandated wire key
//! order (`identifier, sender, receiver, data`) is guaranteed without
//! reaching for an order-preserving map type.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::IsleError;

/// An addressed message routed between isles and the manager.
///
/// `receiver` is a hop list with the final destination first and the next
/// hop last; routers other than the manager pop the tail and push their own
/// id onto `sender` as they forward a packet. `sender` is earliest-origin
/// first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub identifier: String,
    pub sender: Vec<String>,
    pub receiver: Vec<String>,
    pub data: Value,
}

impl Packet {
    /// Construct a packet, generating a fresh identifier if none is
    /// supplied.
    pub fn new(sender: Vec<String>, receiver: Vec<String>, data: Value) -> Self {
        Self::with_identifier(sender, receiver, data, None)
    }

    /// Construct a packet with an explicit identifier (used to preserve the
    /// correlation key across a reply).
    pub fn with_identifier(
        sender: Vec<String>,
        receiver: Vec<String>,
        data: Value,
        identifier: Option<String>,
    ) -> Self {
        Self {
            identifier: identifier.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
            sender,
            receiver,
            data,
        }
    }

    /// Derive a reply: sender and receiver swap, identifier is preserved
    /// exactly (it is the sole correlation key), `data` is caller-supplied.
    pub fn reply(&self, data: Value) -> Packet {
        Packet {
            identifier: self.identifier.clone(),
            sender: self.receiver.clone(),
            receiver: self.sender.clone(),
            data,
        }
    }

    /// Produce a mapping representation.
    pub fn to_map(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => unreachable!("Packet always serializes to a JSON object"),
        }
    }

    /// Reconstruct a packet from a mapping representation.
    pub fn from_map(map: Map<String, Value>) -> Result<Self, IsleError> {
        serde_json::from_value(Value::Object(map)).map_err(IsleError::Serialization)
    }

    /// Produce the canonical JSON-text representation: key order
    /// `identifier, sender, receiver, data`, no insignificant whitespace.
    pub fn to_json(&self) -> String {
        // `serde_json::to_string` serializes struct fields in declaration
        // order and never inserts whitespace; this is exact, not best-effort.
        serde_json::to_string(self).expect("Packet fields are always representable as JSON")
    }

    /// Reconstruct a packet from its JSON-text representation.
    pub fn from_json(json: &str) -> Result<Self, IsleError> {
        serde_json::from_str(json).map_err(IsleError::Serialization)
    }

    /// Produce the UTF-8 byte-string representation of the JSON text.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_json().into_bytes()
    }

    /// Reconstruct a packet from its byte-string representation.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IsleError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| IsleError::MalformedPacket(e.to_string()))?;
        Self::from_json(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Packet {
        Packet::new(
            vec!["origin".to_string()],
            vec!["dest".to_string(), "hop".to_string()],
            json!({"args": [1, 2], "kwargs": {"x": 3}}),
        )
    }

    #[test]
    fn round_trips_through_json() {
        let p = sample();
        let back = Packet::from_json(&p.to_json()).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn round_trips_through_bytes() {
        let p = sample();
        let back = Packet::from_bytes(&p.to_bytes()).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn round_trips_through_map() {
        let p = sample();
        let back = Packet::from_map(p.to_map()).unwrap();
        assert_eq!(p, back);
    }

    #[test]
    fn json_uses_mandated_key_order_and_no_whitespace() {
        let p = Packet::with_identifier(
            vec![],
            vec!["a".to_string()],
            json!({"hello": 1}),
            Some("fixed-id".to_string()),
        );
        assert_eq!(
            p.to_json(),
            r#"{"identifier":"fixed-id","sender":[],"receiver":["a"],"data":{"hello":1}}"#
        );
    }

    #[test]
    fn reply_swaps_hops_and_preserves_identifier() {
        let p = sample();
        let reply = p.reply(json!({"return": 9}));
        assert_eq!(reply.sender, p.receiver);
        assert_eq!(reply.receiver, p.sender);
        assert_eq!(reply.identifier, p.identifier);
        assert_eq!(reply.data, json!({"return": 9}));
    }

    #[test]
    fn identifier_is_generated_when_absent() {
        let a = Packet::new(vec![], vec!["x".to_string()], Value::Null);
        let b = Packet::new(vec![], vec!["x".to_string()], Value::Null);
        assert_ne!(a.identifier, b.identifier);
        assert_eq!(a.identifier.len(), 32);
    }
}
