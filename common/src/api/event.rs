// Event envelope wire format
//
// Every propagated event is wrapped in an envelope whose id is a content
// hash: sha256(type || canonical(payload) || source_node). Identical events
// from the same source collapse onto one id, which is what the dedup layer
// keys on.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::Display;

use crate::{
    crypto::sha256_hex,
    error::CommonError,
    serializer::to_canonical_json,
    time::{get_current_time_in_millis, TimestampMillis},
};

// Headers carried on inter-node event POSTs
pub const HEADER_EVENT_PRIORITY: &str = "X-Event-Priority";
pub const HEADER_SOURCE_NODE: &str = "X-Source-Node";
pub const HEADER_EVENT_TYPE: &str = "X-Event-Type";
pub const HEADER_EVENT_ID: &str = "X-Event-ID";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
pub enum EventType {
    #[serde(rename = "block.added")]
    #[strum(serialize = "block.added")]
    BlockAdded,
    #[serde(rename = "block.received")]
    #[strum(serialize = "block.received")]
    BlockReceived,
    #[serde(rename = "transaction.broadcast")]
    #[strum(serialize = "transaction.broadcast")]
    TransactionBroadcast,
    #[serde(rename = "mempool.update")]
    #[strum(serialize = "mempool.update")]
    MempoolUpdate,
    #[serde(rename = "heartbeat")]
    #[strum(serialize = "heartbeat")]
    Heartbeat,
    #[serde(rename = "fork.detected")]
    #[strum(serialize = "fork.detected")]
    ForkDetected,
    #[serde(rename = "sync.gap_detected")]
    #[strum(serialize = "sync.gap_detected")]
    SyncGapDetected,
    #[serde(rename = "chain.reorganize")]
    #[strum(serialize = "chain.reorganize")]
    ChainReorganize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum EventPriority {
    Critical = 1,
    High = 2,
    Normal = 3,
    Low = 4,
}

impl From<EventPriority> for u8 {
    fn from(priority: EventPriority) -> u8 {
        priority as u8
    }
}

impl TryFrom<u8> for EventPriority {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(EventPriority::Critical),
            2 => Ok(EventPriority::High),
            3 => Ok(EventPriority::Normal),
            4 => Ok(EventPriority::Low),
            other => Err(format!("invalid event priority {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub priority: EventPriority,
    pub source_node: String,
    pub timestamp: TimestampMillis,
    #[serde(default)]
    pub retry_count: u32,
    pub status: EventStatus,
}

impl EventEnvelope {
    pub fn new(
        event_type: EventType,
        payload: Value,
        priority: EventPriority,
        source_node: impl Into<String>,
    ) -> Result<Self, CommonError> {
        let source_node = source_node.into();
        let id = Self::compute_id(event_type, &payload, &source_node)?;
        Ok(EventEnvelope {
            id,
            event_type,
            payload,
            priority,
            source_node,
            timestamp: get_current_time_in_millis(),
            retry_count: 0,
            status: EventStatus::Pending,
        })
    }

    pub fn compute_id(
        event_type: EventType,
        payload: &Value,
        source_node: &str,
    ) -> Result<String, CommonError> {
        let mut preimage = String::new();
        preimage.push_str(&event_type.to_string());
        preimage.push_str(&to_canonical_json(payload)?);
        preimage.push_str(source_node);
        Ok(sha256_hex(preimage.as_bytes()))
    }
}

/// Heartbeat payload exchanged between peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub node_id: String,
    pub height: u64,
    pub mempool_size: usize,
    pub uptime: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_id_is_content_addressed() {
        let a = EventEnvelope::new(
            EventType::BlockAdded,
            json!({"height": 1}),
            EventPriority::Critical,
            "node-a",
        )
        .unwrap();
        let b = EventEnvelope::new(
            EventType::BlockAdded,
            json!({"height": 1}),
            EventPriority::Critical,
            "node-a",
        )
        .unwrap();
        assert_eq!(a.id, b.id);

        let other_source = EventEnvelope::new(
            EventType::BlockAdded,
            json!({"height": 1}),
            EventPriority::Critical,
            "node-b",
        )
        .unwrap();
        assert_ne!(a.id, other_source.id);
    }

    #[test]
    fn test_priority_wire_format_is_numeric() {
        let json = serde_json::to_string(&EventPriority::Critical).unwrap();
        assert_eq!(json, "1");
        let parsed: EventPriority = serde_json::from_str("4").unwrap();
        assert_eq!(parsed, EventPriority::Low);
        assert!(serde_json::from_str::<EventPriority>("9").is_err());
    }

    #[test]
    fn test_event_type_names() {
        assert_eq!(EventType::BlockAdded.to_string(), "block.added");
        assert_eq!(EventType::SyncGapDetected.to_string(), "sync.gap_detected");
        let json = serde_json::to_string(&EventType::ForkDetected).unwrap();
        assert_eq!(json, "\"fork.detected\"");
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = EventEnvelope::new(
            EventType::TransactionBroadcast,
            json!({"hash": "abc"}),
            EventPriority::High,
            "node-a",
        )
        .unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        let parsed: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(envelope, parsed);
    }
}
