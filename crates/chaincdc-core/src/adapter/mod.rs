//! Adapters: turn one decoded block into the ordered messages to publish.
//!
//! Three strategies implement [`Adapter`]:
//!
//! ```text
//! GenericAdapter            type / keys / extensions from expressions
//! CdcAdapter<TableGenerator>   one event per allowed table mutation
//! CdcAdapter<ActionGenerator>  one event per configured action name
//! ```
//!
//! All of them only look at actions whose `filtering_matched` flag is set.
//! Repeated keys within one action are suppressed (first occurrence wins),
//! except for table events: every allowed mutation is its own event.

mod action;
mod generic;
mod table;

pub use action::ActionGenerator;
pub use generic::{Extension, GenericAdapter};
pub use table::{KeyRule, TableGenerator};

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use tracing::error;

use crate::error::AdaptError;
use crate::event::{CanonicalEvent, Header, Message, MessageFactory};
use crate::types::{ActionTrace, Block, Correlation, DecodedDbOp, Step, TransactionTrace};

/// Converts a block into messages.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Messages in transaction order, then action order, then key order.
    async fn adapt(&self, block: &Block, step: Step) -> Result<Vec<Message>, AdaptError>;
}

// ─── Block hooks ──────────────────────────────────────────────────────────────

/// Side effect invoked once per received block, before adaptation.
///
/// Hooks are for capture and debugging; failures are logged, never fatal.
#[async_trait]
pub trait BlockHook: Send + Sync {
    async fn on_block(&self, block: &Block);
}

/// Hook that does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopBlockHook;

#[async_trait]
impl BlockHook for NoopBlockHook {
    async fn on_block(&self, _block: &Block) {}
}

/// Writes every incoming block to `<dir>/block-<number>.json`.
#[derive(Debug, Clone)]
pub struct JsonCaptureHook {
    dir: PathBuf,
}

impl JsonCaptureHook {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl BlockHook for JsonCaptureHook {
    async fn on_block(&self, block: &Block) {
        let bytes = match serde_json::to_vec(block) {
            Ok(b) => b,
            Err(e) => {
                error!(block_num = block.number, error = %e, "Fail to marshal incoming block");
                return;
            }
        };
        let path = self.dir.join(format!("block-{}.json", block.number));
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            error!(file = %path.display(), error = %e, "Fail to write captured block");
        }
    }
}

// ─── Shared traversal ─────────────────────────────────────────────────────────

/// One matched action with its enclosing block and transaction.
pub struct ActionScope<'a> {
    pub block: &'a Block,
    pub step: Step,
    pub trx: &'a TransactionTrace,
    pub act: &'a ActionTrace,
    pub correlation: Option<&'a Correlation>,
}

/// Transactions of `block` paired with their correlation.
pub(crate) fn correlated_transactions(
    block: &Block,
) -> Result<Vec<(&TransactionTrace, Option<Correlation>)>, AdaptError> {
    block
        .transactions
        .iter()
        .map(|trx| {
            Correlation::from_actions(&trx.action_traces)
                .map(|c| (trx, c))
                .map_err(|reason| AdaptError::Correlation {
                    trx_id: trx.id.clone(),
                    reason,
                })
        })
        .collect()
}

/// Keep the first occurrence of every key, in order.
pub fn dedup_keys<I: IntoIterator<Item = String>>(keys: I) -> Vec<String> {
    let mut seen = HashSet::new();
    keys.into_iter().filter(|k| seen.insert(k.clone())).collect()
}

// ─── CDC shell ────────────────────────────────────────────────────────────────

/// A keyed, typed event candidate produced by a CDC generator.
#[derive(Debug, Clone, PartialEq)]
pub struct Generated {
    pub key: String,
    pub event_type: String,
    /// Row mutations carried in the event payload.
    pub db_ops: Vec<DecodedDbOp>,
    /// Position of the row mutation this event stands for, within its action.
    /// Such events are never deduplicated by key.
    pub mutation: Option<usize>,
}

/// CDC-specific strategy deciding which events one action yields.
#[async_trait]
pub trait CdcGenerator: Send + Sync {
    async fn generate(&self, scope: &ActionScope<'_>) -> Result<Vec<Generated>, AdaptError>;
}

/// Adapter shell shared by the table and action CDC generators.
pub struct CdcAdapter<G> {
    generator: G,
    headers: Vec<Header>,
}

impl<G: CdcGenerator> CdcAdapter<G> {
    pub fn new(generator: G, headers: Vec<Header>) -> Self {
        Self { generator, headers }
    }
}

#[async_trait]
impl<G: CdcGenerator> Adapter for CdcAdapter<G> {
    async fn adapt(&self, block: &Block, step: Step) -> Result<Vec<Message>, AdaptError> {
        let mut messages = Vec::new();
        let no_extensions = BTreeMap::new();

        for (trx, correlation) in correlated_transactions(block)? {
            for act in trx.action_traces.iter().filter(|a| a.filtering_matched) {
                let scope = ActionScope {
                    block,
                    step,
                    trx,
                    act,
                    correlation: correlation.as_ref(),
                };
                let factory = MessageFactory {
                    base_headers: &self.headers,
                    block,
                    trx,
                    act,
                    step,
                };
                let mut seen = HashSet::new();
                for generated in self.generator.generate(&scope).await? {
                    if generated.mutation.is_none() && !seen.insert(generated.key.clone()) {
                        continue;
                    }
                    let payload = CanonicalEvent::new(
                        block,
                        step,
                        trx,
                        act,
                        generated.db_ops,
                        correlation.clone(),
                    )?
                    .to_json()?;
                    messages.push(match generated.mutation {
                        Some(index) => factory.build_for_mutation(
                            &generated.key,
                            index,
                            &generated.event_type,
                            &no_extensions,
                            payload,
                        ),
                        None => factory.build(
                            &generated.key,
                            &generated.event_type,
                            &no_extensions,
                            payload,
                        ),
                    });
                }
            }
        }
        Ok(messages)
    }
}

/// `token.a` → `TokenA`, `user_accounts` → `UserAccounts`.
pub(crate) fn camel_case(name: &str) -> String {
    name.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}
