//! Canonical output events and the messages that carry them to the bus.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use crate::error::AdaptError;
use crate::types::{ActionTrace, Block, Correlation, DecodedDbOp, Step, TransactionTrace};

/// Action details nested in a [`CanonicalEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionInfo {
    pub account: String,
    pub receiver: String,
    pub action: String,
    pub global_seq: u64,
    pub authorizations: Vec<String>,
    pub json_data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub db_ops: Vec<DecodedDbOp>,
}

/// The record published for every distinct key of a matched action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalEvent {
    pub block_num: u32,
    pub block_id: String,
    pub status: String,
    pub block_step: String,
    pub executed: bool,
    pub correlation: Option<Correlation>,
    pub trx_id: String,
    pub act_info: ActionInfo,
}

impl CanonicalEvent {
    pub fn new(
        block: &Block,
        step: Step,
        trx: &TransactionTrace,
        act: &ActionTrace,
        db_ops: Vec<DecodedDbOp>,
        correlation: Option<Correlation>,
    ) -> Result<Self, AdaptError> {
        Ok(Self {
            block_num: block.number,
            block_id: block.id.clone(),
            status: trx.status.to_string(),
            block_step: step.to_string(),
            executed: !trx.has_been_reverted(),
            correlation,
            trx_id: trx.id.clone(),
            act_info: ActionInfo {
                account: act.account.clone(),
                receiver: act.receiver.clone(),
                action: act.name.clone(),
                global_seq: act.global_seq(),
                authorizations: act.authorization_strings(),
                json_data: action_payload(trx, act)?,
                db_ops,
            },
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// The action's JSON payload; malformed data fails the block.
pub(crate) fn action_payload(
    trx: &TransactionTrace,
    act: &ActionTrace,
) -> Result<Option<serde_json::Value>, AdaptError> {
    act.json_payload().map_err(|source| AdaptError::Payload {
        trx_id: trx.id.clone(),
        execution_index: act.execution_index,
        source,
    })
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A message header (key/value attribute).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

impl Header {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// What the pipeline hands to the message sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub key: String,
    pub headers: Vec<Header>,
    pub value: Vec<u8>,
}

impl Message {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|h| h.key == key)
            .map(|h| h.value.as_str())
    }
}

/// Static headers attached to every published message.
pub fn base_headers(event_source: &str) -> Vec<Header> {
    vec![
        Header::new("ce_source", event_source),
        Header::new("ce_specversion", "1.0"),
        Header::new("content-type", "application/json"),
        Header::new("ce_datacontenttype", "application/json"),
    ]
}

/// Deterministic event id: base64(sha256(block ‖ trx ‖ exec index ‖ step ‖ key)).
pub fn event_id(block_id: &str, trx_id: &str, execution_index: u32, step: Step, key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(block_id.as_bytes());
    hasher.update(trx_id.as_bytes());
    hasher.update(execution_index.to_string().as_bytes());
    hasher.update(step.as_wire().as_bytes());
    hasher.update(key.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Everything needed to turn one action's event into keyed messages.
pub struct MessageFactory<'a> {
    pub base_headers: &'a [Header],
    pub block: &'a Block,
    pub trx: &'a TransactionTrace,
    pub act: &'a ActionTrace,
    pub step: Step,
}

impl MessageFactory<'_> {
    /// Build the message for `key`, typed `event_type`.
    pub fn build(
        &self,
        key: &str,
        event_type: &str,
        extensions: &BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Message {
        let id = self.id(key);
        self.assemble(key, id, event_type, extensions, payload)
    }

    /// Build the message for one row mutation of the action.
    ///
    /// Several mutations may share a key, so the mutation's position within
    /// the action goes into `ce_id` as well.
    pub fn build_for_mutation(
        &self,
        key: &str,
        mutation: usize,
        event_type: &str,
        extensions: &BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Message {
        let id = self.id(&format!("{key}#{mutation}"));
        self.assemble(key, id, event_type, extensions, payload)
    }

    fn id(&self, key: &str) -> String {
        event_id(
            &self.block.id,
            &self.trx.id,
            self.act.execution_index,
            self.step,
            key,
        )
    }

    fn assemble(
        &self,
        key: &str,
        id: String,
        event_type: &str,
        extensions: &BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Message {
        let mut headers = self.base_headers.to_vec();
        headers.push(Header::new("ce_id", id));
        headers.push(Header::new("ce_type", event_type));
        headers.push(Header::new("ce_time", event_time(&self.block.timestamp)));
        headers.push(Header::new("ce_blkstep", self.step.to_string()));
        headers.extend(extensions.iter().map(|(k, v)| Header::new(k, v)));
        Message {
            key: key.to_string(),
            headers,
            value: payload,
        }
    }
}

/// `2020-09-13T12:26:40.5Z`: UTC with at most one fractional digit, omitted when zero.
pub fn event_time(ts: &DateTime<Utc>) -> String {
    let tenths = ts.timestamp_subsec_millis() / 100;
    let seconds = ts.format("%Y-%m-%dT%H:%M:%S");
    if tenths == 0 {
        format!("{seconds}Z")
    } else {
        format!("{seconds}.{tenths}Z")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionStatus;
    use chrono::TimeZone;

    fn fixture() -> (Block, TransactionTrace, ActionTrace) {
        let act = ActionTrace {
            receiver: "eosio.token".into(),
            account: "eosio.token".into(),
            name: "transfer".into(),
            json_data: None,
            authorizations: vec![],
            global_sequence: Some(9),
            execution_index: 1,
            filtering_matched: true,
        };
        let trx = TransactionTrace {
            id: "trx".into(),
            status: TransactionStatus::Executed,
            action_traces: vec![act.clone()],
            db_ops: vec![],
        };
        let block = Block {
            id: "blk".into(),
            number: 7,
            timestamp: chrono::Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
            transactions: vec![],
        };
        (block, trx, act)
    }

    #[test]
    fn event_id_is_deterministic_and_key_sensitive() {
        let a = event_id("blk", "trx", 1, Step::New, "k");
        assert_eq!(a, event_id("blk", "trx", 1, Step::New, "k"));
        assert_ne!(a, event_id("blk", "trx", 1, Step::New, "k2"));
        assert_ne!(a, event_id("blk", "trx", 1, Step::Undo, "k"));
        assert_eq!(a.len(), 44);
    }

    #[test]
    fn event_wire_format() {
        let (block, trx, act) = fixture();
        let ev = CanonicalEvent::new(&block, Step::New, &trx, &act, vec![], None).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&ev.to_json().unwrap()).unwrap();
        assert_eq!(v["block_num"], 7);
        assert_eq!(v["block_step"], "NEW");
        assert_eq!(v["status"], "EXECUTED");
        assert_eq!(v["executed"], true);
        assert_eq!(v["correlation"], serde_json::Value::Null);
        assert_eq!(v["act_info"]["global_seq"], 9);
        assert_eq!(v["act_info"]["json_data"], serde_json::Value::Null);
        assert!(v["act_info"].get("db_ops").is_none());
    }

    #[test]
    fn message_headers_in_order() {
        let (block, trx, act) = fixture();
        let base = base_headers("test-source");
        let factory = MessageFactory {
            base_headers: &base,
            block: &block,
            trx: &trx,
            act: &act,
            step: Step::New,
        };
        let mut ext = BTreeMap::new();
        ext.insert("zeta".to_string(), "z".to_string());
        ext.insert("alpha".to_string(), "a".to_string());
        let msg = factory.build("k", "Created", &ext, b"{}".to_vec());

        let keys: Vec<_> = msg.headers.iter().map(|h| h.key.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "ce_source",
                "ce_specversion",
                "content-type",
                "ce_datacontenttype",
                "ce_id",
                "ce_type",
                "ce_time",
                "ce_blkstep",
                "alpha",
                "zeta"
            ]
        );
        assert_eq!(msg.header("ce_type"), Some("Created"));
        assert_eq!(msg.header("ce_time"), Some("2020-09-13T12:26:40Z"));
        assert_eq!(msg.header("ce_blkstep"), Some("NEW"));
        assert_eq!(msg.key, "k");
    }

    #[test]
    fn event_time_keeps_one_fractional_digit() {
        let at = |millis: u32| {
            chrono::Utc
                .timestamp_opt(1_600_000_000, millis * 1_000_000)
                .unwrap()
        };
        assert_eq!(event_time(&at(0)), "2020-09-13T12:26:40Z");
        assert_eq!(event_time(&at(500)), "2020-09-13T12:26:40.5Z");
        assert_eq!(event_time(&at(999)), "2020-09-13T12:26:40.9Z");
        assert_eq!(event_time(&at(50)), "2020-09-13T12:26:40Z");
    }

    #[test]
    fn mutation_messages_share_key_but_not_id() {
        let (block, trx, act) = fixture();
        let factory = MessageFactory {
            base_headers: &[],
            block: &block,
            trx: &trx,
            act: &act,
            step: Step::New,
        };
        let none = BTreeMap::new();
        let first = factory.build_for_mutation("k", 0, "T", &none, vec![]);
        let second = factory.build_for_mutation("k", 1, "T", &none, vec![]);
        assert_eq!(first.key, second.key);
        assert_ne!(first.header("ce_id"), second.header("ce_id"));
        assert_eq!(
            first.header("ce_id"),
            factory.build_for_mutation("k", 0, "T", &none, vec![]).header("ce_id")
        );
    }

    #[test]
    fn malformed_json_data_fails_event() {
        let (block, trx, mut act) = fixture();
        act.json_data = Some("not json".into());
        let err = CanonicalEvent::new(&block, Step::New, &trx, &act, vec![], None).unwrap_err();
        assert!(matches!(err, AdaptError::Payload { .. }));
    }
}
