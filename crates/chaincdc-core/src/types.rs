//! Block data model shared by the adapters and the pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ─── Block ────────────────────────────────────────────────────────────────────

/// A decoded block as delivered by the block source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// Block id (hash).
    pub id: String,
    /// Block height.
    pub number: u32,
    /// Block production time.
    pub timestamp: DateTime<Utc>,
    /// Transaction traces, in execution order.
    #[serde(default)]
    pub transactions: Vec<TransactionTrace>,
}

// ─── Transactions ─────────────────────────────────────────────────────────────

/// Receipt status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Executed,
    SoftFail,
    HardFail,
    Delayed,
    Expired,
    #[default]
    Unknown,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Executed => "EXECUTED",
            Self::SoftFail => "SOFTFAIL",
            Self::HardFail => "HARDFAIL",
            Self::Delayed => "DELAYED",
            Self::Expired => "EXPIRED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// One transaction of a block with its action traces and row mutations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionTrace {
    pub id: String,
    #[serde(default)]
    pub status: TransactionStatus,
    #[serde(default)]
    pub action_traces: Vec<ActionTrace>,
    #[serde(default)]
    pub db_ops: Vec<DbOp>,
}

impl TransactionTrace {
    /// Returns `true` unless the transaction executed successfully.
    pub fn has_been_reverted(&self) -> bool {
        self.status != TransactionStatus::Executed
    }

    /// Row mutations produced by the action with the given execution index.
    pub fn db_ops_for_action(&self, execution_index: u32) -> Vec<DbOp> {
        self.db_ops
            .iter()
            .filter(|op| op.action_index == execution_index)
            .cloned()
            .collect()
    }
}

// ─── Actions ──────────────────────────────────────────────────────────────────

/// An `actor@permission` authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionLevel {
    pub actor: String,
    pub permission: String,
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.actor, self.permission)
    }
}

/// A single action execution inside a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTrace {
    pub receiver: String,
    pub account: String,
    pub name: String,
    /// Decoded action payload as a JSON document, when available.
    #[serde(default)]
    pub json_data: Option<String>,
    #[serde(default)]
    pub authorizations: Vec<PermissionLevel>,
    /// Global sequence from the action receipt (absent without receipt).
    #[serde(default)]
    pub global_sequence: Option<u64>,
    /// Index unique within the transaction.
    pub execution_index: u32,
    /// Whether this action matched the block-source subscription filter.
    #[serde(default)]
    pub filtering_matched: bool,
}

impl ActionTrace {
    /// Authorizations rendered as `actor@permission`.
    pub fn authorization_strings(&self) -> Vec<String> {
        self.authorizations.iter().map(ToString::to_string).collect()
    }

    pub fn global_seq(&self) -> u64 {
        self.global_sequence.unwrap_or(0)
    }

    /// Payload parsed as JSON; `None` when absent or empty.
    pub fn json_payload(&self) -> Result<Option<serde_json::Value>, serde_json::Error> {
        match self.json_data.as_deref() {
            Some(raw) if !raw.is_empty() => serde_json::from_str(raw).map(Some),
            _ => Ok(None),
        }
    }
}

// ─── Row mutations ────────────────────────────────────────────────────────────

/// Kind of row mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbOperation {
    Insert,
    Update,
    Remove,
}

impl fmt::Display for DbOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Insert => "Insert",
            Self::Update => "Update",
            Self::Remove => "Remove",
        };
        f.write_str(s)
    }
}

/// A raw table-row mutation attached to an action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbOp {
    pub operation: DbOperation,
    /// Execution index of the action that performed the mutation.
    pub action_index: u32,
    pub code: String,
    pub scope: String,
    pub table_name: String,
    pub primary_key: String,
    #[serde(default, with = "hex_bytes")]
    pub old_data: Vec<u8>,
    #[serde(default, with = "hex_bytes")]
    pub new_data: Vec<u8>,
}

/// A row mutation enriched with the structured rows produced by the row decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedDbOp {
    pub operation: DbOperation,
    pub action_index: u32,
    pub code: String,
    pub scope: String,
    pub table_name: String,
    pub primary_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_json: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_json: Option<serde_json::Value>,
}

impl DecodedDbOp {
    /// Wrap a raw mutation without decoded rows.
    pub fn undecoded(op: &DbOp) -> Self {
        Self {
            operation: op.operation,
            action_index: op.action_index,
            code: op.code.clone(),
            scope: op.scope.clone(),
            table_name: op.table_name.clone(),
            primary_key: op.primary_key.clone(),
            old_json: None,
            new_json: None,
        }
    }

    /// Returns `true` if the row decoder produced at least one side of the row.
    pub fn is_decoded(&self) -> bool {
        self.old_json.is_some() || self.new_json.is_some()
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
    }
}

// ─── Step ─────────────────────────────────────────────────────────────────────

/// Fork-aware position of a block in the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Step {
    New,
    Undo,
    Redo,
    Irreversible,
}

impl Step {
    /// The wire form used by the block source (e.g. `STEP_NEW`).
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::New => "STEP_NEW",
            Self::Undo => "STEP_UNDO",
            Self::Redo => "STEP_REDO",
            Self::Irreversible => "STEP_IRREVERSIBLE",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Undo => "UNDO",
            Self::Redo => "REDO",
            Self::Irreversible => "IRREVERSIBLE",
        };
        f.write_str(s)
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let short = s.trim().trim_start_matches("STEP_");
        match short.to_ascii_lowercase().as_str() {
            "new" => Ok(Self::New),
            "undo" => Ok(Self::Undo),
            "redo" => Ok(Self::Redo),
            "irreversible" => Ok(Self::Irreversible),
            _ => Err(format!("unknown step '{s}'")),
        }
    }
}

// ─── Correlation ──────────────────────────────────────────────────────────────

/// Application-defined grouping id carried by a `correlate` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub payer: String,
    pub id: String,
}

/// Name of the action whose payload carries the transaction correlation.
pub const CORRELATION_ACTION: &str = "correlate";

impl Correlation {
    /// Extract the correlation of a transaction from its action traces.
    ///
    /// Several `correlate` actions are accepted only if they agree.
    pub fn from_actions(actions: &[ActionTrace]) -> Result<Option<Self>, String> {
        let mut found: Option<Self> = None;
        for act in actions.iter().filter(|a| a.name == CORRELATION_ACTION) {
            let raw = act
                .json_data
                .as_deref()
                .ok_or_else(|| "correlate action without payload".to_string())?;
            let corr: Self = serde_json::from_str(raw).map_err(|e| e.to_string())?;
            match &found {
                Some(prev) if *prev != corr => {
                    return Err(format!(
                        "conflicting correlations '{}' and '{}'",
                        prev.id, corr.id
                    ));
                }
                _ => found = Some(corr),
            }
        }
        Ok(found)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str, json: Option<&str>) -> ActionTrace {
        ActionTrace {
            receiver: "eosio.token".into(),
            account: "eosio.token".into(),
            name: name.into(),
            json_data: json.map(Into::into),
            authorizations: vec![],
            global_sequence: None,
            execution_index: 0,
            filtering_matched: true,
        }
    }

    #[test]
    fn step_parses_wire_and_short_forms() {
        assert_eq!("STEP_NEW".parse::<Step>().unwrap(), Step::New);
        assert_eq!("irreversible".parse::<Step>().unwrap(), Step::Irreversible);
        assert!("STEP_SIDEWAYS".parse::<Step>().is_err());
        assert_eq!(Step::Undo.to_string(), "UNDO");
        assert_eq!(Step::Undo.as_wire(), "STEP_UNDO");
    }

    #[test]
    fn reverted_unless_executed() {
        let mut trx = TransactionTrace {
            id: "t".into(),
            status: TransactionStatus::Executed,
            action_traces: vec![],
            db_ops: vec![],
        };
        assert!(!trx.has_been_reverted());
        trx.status = TransactionStatus::HardFail;
        assert!(trx.has_been_reverted());
    }

    #[test]
    fn wire_names_are_upper_case() {
        assert_eq!(TransactionStatus::Executed.to_string(), "EXECUTED");
        assert_eq!(TransactionStatus::SoftFail.to_string(), "SOFTFAIL");
        assert_eq!(Step::New.to_string(), "NEW");
        assert_eq!(Step::Irreversible.to_string(), "IRREVERSIBLE");
        // the display form parses back
        assert_eq!("IRREVERSIBLE".parse::<Step>().unwrap(), Step::Irreversible);
    }

    #[test]
    fn json_payload_rejects_malformed_data() {
        assert_eq!(action("transfer", None).json_payload().unwrap(), None);
        assert_eq!(action("transfer", Some("")).json_payload().unwrap(), None);
        assert_eq!(
            action("transfer", Some(r#"{"to":"bob"}"#)).json_payload().unwrap(),
            Some(serde_json::json!({"to": "bob"}))
        );
        assert!(action("transfer", Some("{\"to\":")).json_payload().is_err());
    }

    #[test]
    fn db_op_hex_roundtrip_through_json() {
        let op = DbOp {
            operation: DbOperation::Insert,
            action_index: 2,
            code: "eosio.token".into(),
            scope: "alice".into(),
            table_name: "accounts".into(),
            primary_key: "EOS".into(),
            old_data: vec![],
            new_data: vec![0xde, 0xad],
        };
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["new_data"], "dead");
        let back: DbOp = serde_json::from_value(v).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn correlation_absent_single_and_conflicting() {
        assert_eq!(Correlation::from_actions(&[action("transfer", None)]).unwrap(), None);

        let c = action("correlate", Some(r#"{"payer":"alice","id":"42"}"#));
        let got = Correlation::from_actions(&[c.clone(), c.clone()]).unwrap().unwrap();
        assert_eq!(got.id, "42");

        let other = action("correlate", Some(r#"{"payer":"bob","id":"43"}"#));
        assert!(Correlation::from_actions(&[c, other]).is_err());
    }

    #[test]
    fn authorization_rendering() {
        let mut a = action("transfer", None);
        a.authorizations.push(PermissionLevel {
            actor: "alice".into(),
            permission: "active".into(),
        });
        assert_eq!(a.authorization_strings(), vec!["alice@active".to_string()]);
        assert_eq!(a.global_seq(), 0);
    }
}
