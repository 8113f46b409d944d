//! Activation: the read-only variables an expression sees for one action.

use serde_json::Value;
use std::collections::HashMap;

use crate::error::AdaptError;
use crate::event::action_payload;
use crate::types::{ActionTrace, Block, Correlation, DecodedDbOp, Step, TransactionTrace};

/// Variables exposed to the expression engine for one matched action.
///
/// Built once per action and never mutated afterwards; the CDC table
/// generator derives a mutation-scoped copy with [`Activation::with_db_op`].
#[derive(Debug, Clone, Default)]
pub struct Activation {
    vars: HashMap<&'static str, Value>,
}

impl Activation {
    /// Fails when the action carries a payload that is not valid JSON.
    pub fn new(
        block: &Block,
        step: Step,
        trx: &TransactionTrace,
        act: &ActionTrace,
        db_ops: &[DecodedDbOp],
        correlation: Option<&Correlation>,
    ) -> Result<Self, AdaptError> {
        let data = action_payload(trx, act)?;
        let auth = act.authorization_strings();
        let first_auth_actor = act
            .authorizations
            .first()
            .map(|a| Value::String(a.actor.clone()))
            .unwrap_or(Value::Null);

        let mut vars = HashMap::new();
        vars.insert("block_num", Value::from(block.number));
        vars.insert("block_id", Value::String(block.id.clone()));
        vars.insert(
            "block_time",
            Value::String(block.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        );
        vars.insert("step", Value::String(step.to_string()));
        vars.insert("transaction_id", Value::String(trx.id.clone()));
        vars.insert("status", Value::String(trx.status.to_string()));
        vars.insert("executed", Value::Bool(!trx.has_been_reverted()));
        vars.insert(
            "correlation",
            correlation
                .and_then(|c| serde_json::to_value(c).ok())
                .unwrap_or(Value::Null),
        );
        vars.insert("receiver", Value::String(act.receiver.clone()));
        vars.insert("account", Value::String(act.account.clone()));
        vars.insert("action", Value::String(act.name.clone()));
        vars.insert("data", data.unwrap_or(Value::Null));
        vars.insert(
            "auth",
            Value::Array(auth.into_iter().map(Value::String).collect()),
        );
        vars.insert("first_auth_actor", first_auth_actor);
        vars.insert("global_seq", Value::from(act.global_seq()));
        vars.insert("execution_index", Value::from(act.execution_index));
        vars.insert(
            "db_ops",
            Value::Array(db_ops.iter().map(db_op_value).collect()),
        );
        Ok(Self { vars })
    }

    /// Derive an activation scoped to a single row mutation (`db_op`).
    pub fn with_db_op(&self, op: &DecodedDbOp) -> Self {
        let mut vars = self.vars.clone();
        vars.insert("db_op", db_op_value(op));
        Self { vars }
    }

    /// Look up a root variable.
    pub fn resolve(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    /// Build an activation from raw name/value pairs.
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, Value)>,
    {
        Self {
            vars: pairs.into_iter().collect(),
        }
    }
}

/// JSON view of a decoded mutation; undecoded rows appear as `null`.
fn db_op_value(op: &DecodedDbOp) -> Value {
    serde_json::json!({
        "operation": op.operation.to_string(),
        "action_index": op.action_index,
        "code": op.code,
        "scope": op.scope,
        "table_name": op.table_name,
        "primary_key": op.primary_key,
        "old_json": op.old_json,
        "new_json": op.new_json,
    })
}
