//! Fully expression-driven adapter.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{correlated_transactions, dedup_keys, Adapter};
use crate::activation::Activation;
use crate::decoder::{decode_with_policy, DecodePolicy, RowDecoder};
use crate::error::AdaptError;
use crate::event::{CanonicalEvent, Header, Message, MessageFactory};
use crate::expr::Program;
use crate::types::{Block, Step};

/// A named expression whose string result is attached as a message header.
#[derive(Debug, Clone)]
pub struct Extension {
    pub name: String,
    pub program: Program,
}

/// Derives event type, keys and extensions from compiled expressions.
pub struct GenericAdapter {
    decoder: Arc<dyn RowDecoder>,
    policy: DecodePolicy,
    event_type: Program,
    event_keys: Program,
    extensions: Vec<Extension>,
    headers: Vec<Header>,
}

impl GenericAdapter {
    pub fn new(
        decoder: Arc<dyn RowDecoder>,
        policy: DecodePolicy,
        event_type: Program,
        event_keys: Program,
        extensions: Vec<Extension>,
        headers: Vec<Header>,
    ) -> Self {
        Self {
            decoder,
            policy,
            event_type,
            event_keys,
            extensions,
            headers,
        }
    }
}

#[async_trait]
impl Adapter for GenericAdapter {
    async fn adapt(&self, block: &Block, step: Step) -> Result<Vec<Message>, AdaptError> {
        let mut messages = Vec::new();

        for (trx, correlation) in correlated_transactions(block)? {
            for act in trx.action_traces.iter().filter(|a| a.filtering_matched) {
                let db_ops = decode_with_policy(
                    self.decoder.as_ref(),
                    &trx.db_ops_for_action(act.execution_index),
                    block.number,
                    self.policy,
                )
                .await?;

                let activation =
                    Activation::new(block, step, trx, act, &db_ops, correlation.as_ref())?;

                let event_type = self
                    .event_type
                    .eval_string(&activation)
                    .map_err(|e| AdaptError::eval("event type", e))?;

                let mut extensions = BTreeMap::new();
                for ext in &self.extensions {
                    let value = ext
                        .program
                        .eval_string(&activation)
                        .map_err(|e| AdaptError::eval(format!("extension '{}'", ext.name), e))?;
                    extensions.insert(ext.name.clone(), value);
                }

                let keys = self
                    .event_keys
                    .eval_string_array(&activation)
                    .map_err(|e| AdaptError::eval("event keys", e))?;

                let payload =
                    CanonicalEvent::new(block, step, trx, act, db_ops, correlation.clone())?
                        .to_json()?;
                let factory = MessageFactory {
                    base_headers: &self.headers,
                    block,
                    trx,
                    act,
                    step,
                };
                for key in dedup_keys(keys) {
                    messages.push(factory.build(&key, &event_type, &extensions, payload.clone()));
                }
            }
        }
        Ok(messages)
    }
}
