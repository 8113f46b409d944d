//! CDC generator for table-row mutations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use super::{camel_case, ActionScope, CdcGenerator, Generated};
use crate::activation::Activation;
use crate::decoder::{decode_with_policy, DecodePolicy, RowDecoder};
use crate::error::AdaptError;
use crate::expr::Program;
use crate::types::DecodedDbOp;

/// How the event key is extracted from a mutation.
#[derive(Debug, Clone, Default)]
pub enum KeyRule {
    /// `"{table}:{scope}:{primary_key}"`.
    #[default]
    PrimaryKey,
    /// A string expression evaluated with `db_op` in scope.
    Expression(Program),
}

/// Emits one event per decoded mutation whose table is in the allow-set.
///
/// Mutations are never merged: two changes of the same row in one action
/// produce two events under the same key.
pub struct TableGenerator {
    decoder: Arc<dyn RowDecoder>,
    policy: DecodePolicy,
    tables: HashMap<String, KeyRule>,
}

impl TableGenerator {
    pub fn new(
        decoder: Arc<dyn RowDecoder>,
        policy: DecodePolicy,
        tables: HashMap<String, KeyRule>,
    ) -> Self {
        Self {
            decoder,
            policy,
            tables,
        }
    }

    /// Allow-set with the default key rule for every table.
    pub fn with_tables<I, S>(decoder: Arc<dyn RowDecoder>, policy: DecodePolicy, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tables = names
            .into_iter()
            .map(|n| (n.into(), KeyRule::PrimaryKey))
            .collect();
        Self::new(decoder, policy, tables)
    }

    fn key(
        &self,
        rule: &KeyRule,
        op: &DecodedDbOp,
        activation: &Activation,
    ) -> Result<String, AdaptError> {
        match rule {
            KeyRule::PrimaryKey => Ok(format!(
                "{}:{}:{}",
                op.table_name, op.scope, op.primary_key
            )),
            KeyRule::Expression(program) => program
                .eval_string(&activation.with_db_op(op))
                .map_err(|e| AdaptError::eval(format!("table key '{}'", op.table_name), e)),
        }
    }
}

#[async_trait]
impl CdcGenerator for TableGenerator {
    async fn generate(&self, scope: &ActionScope<'_>) -> Result<Vec<Generated>, AdaptError> {
        let raw = scope.trx.db_ops_for_action(scope.act.execution_index);
        if !raw.iter().any(|op| self.tables.contains_key(&op.table_name)) {
            return Ok(Vec::new());
        }
        let decoded =
            decode_with_policy(self.decoder.as_ref(), &raw, scope.block.number, self.policy)
                .await?;
        let activation = Activation::new(
            scope.block,
            scope.step,
            scope.trx,
            scope.act,
            &decoded,
            scope.correlation,
        )?;

        let mut out = Vec::new();
        for (index, op) in decoded.iter().enumerate() {
            let Some(rule) = self.tables.get(&op.table_name) else {
                continue;
            };
            out.push(Generated {
                key: self.key(rule, op, &activation)?,
                event_type: format!("{}Table{}", camel_case(&op.table_name), op.operation),
                db_ops: vec![op.clone()],
                mutation: Some(index),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::{action, block, db_op};
    use super::super::{Adapter, CdcAdapter};
    use super::*;
    use crate::decoder::NoopRowDecoder;
    use crate::error::DecodeError;
    use crate::event::base_headers;
    use crate::expr::Declarations;
    use crate::types::{DbOp, DbOperation, Step};

    struct Broken;

    #[async_trait]
    impl RowDecoder for Broken {
        async fn decode_db_ops(&self, _: &[DbOp], block_num: u32) -> Result<Vec<DecodedDbOp>, DecodeError> {
            Err(DecodeError::Row {
                table: "accounts".into(),
                block_num,
                reason: "abi not found".into(),
            })
        }
    }

    fn adapter(tables: &[&str]) -> CdcAdapter<TableGenerator> {
        CdcAdapter::new(
            TableGenerator::with_tables(Arc::new(NoopRowDecoder), DecodePolicy::Lenient, tables.iter().copied()),
            base_headers("test"),
        )
    }

    #[tokio::test]
    async fn table_outside_allow_set_emits_nothing() {
        let blk = block(
            vec![action("transfer", 0, true, "{}")],
            vec![db_op(0, "other.b", "alice", DbOperation::Insert)],
        );
        let msgs = adapter(&["token.a"]).adapt(&blk, Step::New).await.unwrap();
        assert!(msgs.is_empty());
    }

    #[tokio::test]
    async fn typed_by_table_and_operation() {
        let blk = block(
            vec![action("transfer", 0, true, "{}")],
            vec![
                db_op(0, "token.a", "alice", DbOperation::Update),
                db_op(0, "other.b", "alice", DbOperation::Insert),
                db_op(0, "token.a", "bob", DbOperation::Insert),
                db_op(0, "token.a", "bob", DbOperation::Remove),
            ],
        );
        let msgs = adapter(&["token.a"]).adapt(&blk, Step::New).await.unwrap();
        let got: Vec<_> = msgs
            .iter()
            .map(|m| (m.key.as_str(), m.header("ce_type").unwrap()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("token.a:alice:EOS", "TokenATableUpdate"),
                ("token.a:bob:EOS", "TokenATableInsert"),
                ("token.a:bob:EOS", "TokenATableRemove"),
            ]
        );
        // same row, same key, distinct event ids
        assert_ne!(msgs[1].header("ce_id"), msgs[2].header("ce_id"));
        let payload: serde_json::Value = serde_json::from_slice(&msgs[2].value).unwrap();
        let ops = payload["act_info"]["db_ops"].as_array().unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0]["operation"], "remove");
    }

    #[tokio::test]
    async fn same_row_in_two_tables_emits_both() {
        let blk = block(
            vec![action("transfer", 0, true, "{}")],
            vec![
                db_op(0, "accounts", "alice", DbOperation::Update),
                db_op(0, "stat", "alice", DbOperation::Update),
            ],
        );
        let msgs = adapter(&["accounts", "stat"]).adapt(&blk, Step::New).await.unwrap();
        let got: Vec<_> = msgs
            .iter()
            .map(|m| (m.key.as_str(), m.header("ce_type").unwrap()))
            .collect();
        assert_eq!(
            got,
            vec![
                ("accounts:alice:EOS", "AccountsTableUpdate"),
                ("stat:alice:EOS", "StatTableUpdate"),
            ]
        );
    }

    #[tokio::test]
    async fn expression_keys_may_collide_without_dropping_events() {
        let rule = || {
            KeyRule::Expression(Program::compile("db_op.scope", &Declarations::table()).unwrap())
        };
        let generator = TableGenerator::new(
            Arc::new(NoopRowDecoder),
            DecodePolicy::Lenient,
            HashMap::from([("accounts".to_string(), rule()), ("stat".to_string(), rule())]),
        );
        let blk = block(
            vec![action("transfer", 0, true, "{}")],
            vec![
                db_op(0, "accounts", "alice", DbOperation::Update),
                db_op(0, "stat", "alice", DbOperation::Update),
            ],
        );
        let msgs = CdcAdapter::new(generator, vec![]).adapt(&blk, Step::New).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.key == "alice"));
    }

    #[tokio::test]
    async fn lenient_decoding_emits_undecoded_rows() {
        let generator = TableGenerator::with_tables(Arc::new(Broken), DecodePolicy::Lenient, ["accounts"]);
        let blk = block(
            vec![action("transfer", 0, true, "{}")],
            vec![db_op(0, "accounts", "alice", DbOperation::Update)],
        );
        let msgs = CdcAdapter::new(generator, vec![]).adapt(&blk, Step::New).await.unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].key, "accounts:alice:EOS");
        let payload: serde_json::Value = serde_json::from_slice(&msgs[0].value).unwrap();
        let op = &payload["act_info"]["db_ops"][0];
        assert_eq!(op["table_name"], "accounts");
        assert_eq!(op["new_json"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn malformed_action_data_fails_block() {
        let blk = block(
            vec![action("transfer", 0, true, "{\"to\":")],
            vec![db_op(0, "accounts", "alice", DbOperation::Update)],
        );
        let err = adapter(&["accounts"]).adapt(&blk, Step::New).await.unwrap_err();
        assert!(matches!(err, AdaptError::Payload { .. }));
    }

    #[tokio::test]
    async fn expression_key_rule() {
        let rule = KeyRule::Expression(
            Program::compile("db_op.scope + '/' + action", &Declarations::table()).unwrap(),
        );
        let generator = TableGenerator::new(
            Arc::new(NoopRowDecoder),
            DecodePolicy::Lenient,
            HashMap::from([("accounts".to_string(), rule)]),
        );
        let blk = block(
            vec![action("transfer", 0, true, "{}")],
            vec![db_op(0, "accounts", "alice", DbOperation::Update)],
        );
        let msgs = CdcAdapter::new(generator, vec![]).adapt(&blk, Step::New).await.unwrap();
        assert_eq!(msgs[0].key, "alice/transfer");
    }

    #[tokio::test]
    async fn strict_decoding_fails_block() {
        let generator = TableGenerator::with_tables(Arc::new(Broken), DecodePolicy::Strict, ["accounts"]);
        let blk = block(
            vec![action("transfer", 0, true, "{}")],
            vec![db_op(0, "accounts", "alice", DbOperation::Update)],
        );
        let err = CdcAdapter::new(generator, vec![]).adapt(&blk, Step::New).await.unwrap_err();
        assert!(matches!(err, AdaptError::Decode(_)));
    }
}
