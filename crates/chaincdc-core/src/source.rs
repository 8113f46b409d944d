//! Block source seam.

use async_trait::async_trait;
use std::collections::VecDeque;
use tracing::debug;

use crate::activation::Activation;
use crate::cursor::Cursor;
use crate::error::SourceError;
use crate::expr::{Declarations, Program};
use crate::types::{Block, Step};

/// One item of the block stream.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBlock {
    pub block: Block,
    pub step: Step,
    /// Resumption token positioned right after this block.
    pub cursor: Cursor,
}

/// Where and how the block stream should start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockRequest {
    pub start_block: i64,
    /// Inclusive; `0` means stream forever.
    pub stop_block: u64,
    /// Takes precedence over `start_block` when set.
    pub start_cursor: Option<Cursor>,
    /// Boolean expression over action fields; only matching actions are
    /// flagged. Empty keeps the flags the feed already carries.
    pub include_filter: String,
    pub irreversible_only: bool,
}

/// Streaming pull interface over the block feed.
#[async_trait]
pub trait BlockSource: Send {
    async fn open(&mut self, request: &BlockRequest) -> Result<(), SourceError>;

    /// Next block, or `None` at the end of the stream.
    async fn recv(&mut self) -> Result<Option<StreamBlock>, SourceError>;
}

/// Filter selecting the actions of `account` for CDC modes.
pub fn cdc_filter(account: &str, executed_only: bool) -> String {
    let filter = format!("account == \"{account}\" && receiver == \"{account}\"");
    if executed_only {
        format!("executed && {filter}")
    } else {
        filter
    }
}

/// In-memory block feed honouring start/stop bounds and a start cursor.
#[derive(Debug, Default)]
pub struct VecBlockSource {
    all: Vec<StreamBlock>,
    pending: VecDeque<StreamBlock>,
    request: Option<BlockRequest>,
}

impl VecBlockSource {
    pub fn new(blocks: Vec<StreamBlock>) -> Self {
        Self {
            all: blocks,
            ..Default::default()
        }
    }

    /// The request received by the last `open`.
    pub fn request(&self) -> Option<&BlockRequest> {
        self.request.as_ref()
    }
}

/// Blocks of `all` selected by `request`, with action flags set by its filter.
pub fn select_blocks(all: &[StreamBlock], request: &BlockRequest) -> Result<Vec<StreamBlock>, SourceError> {
    let filter = compile_filter(&request.include_filter)?;
    let from = match &request.start_cursor {
        Some(cursor) => all
            .iter()
            .position(|b| &b.cursor == cursor)
            .map(|i| i + 1)
            .ok_or_else(|| SourceError::Other(format!("unknown cursor '{cursor}'")))?,
        None => all
            .iter()
            .position(|b| i64::from(b.block.number) >= request.start_block)
            .unwrap_or(all.len()),
    };
    all[from..]
        .iter()
        .filter(|b| !request.irreversible_only || b.step == Step::Irreversible)
        .take_while(|b| request.stop_block == 0 || u64::from(b.block.number) <= request.stop_block)
        .cloned()
        .map(|mut item| {
            if let Some(program) = &filter {
                flag_matching_actions(&mut item, program)?;
            }
            Ok(item)
        })
        .collect()
}

fn compile_filter(source: &str) -> Result<Option<Program>, SourceError> {
    if source.trim().is_empty() {
        return Ok(None);
    }
    Program::compile(source, &Declarations::action())
        .map(Some)
        .map_err(|e| SourceError::Other(format!("invalid include filter '{source}': {e}")))
}

/// Set `filtering_matched` on every action of `item` from `filter`.
///
/// An action the filter cannot be evaluated on does not match.
fn flag_matching_actions(item: &mut StreamBlock, filter: &Program) -> Result<(), SourceError> {
    let mut flags = Vec::new();
    for trx in &item.block.transactions {
        for act in &trx.action_traces {
            let activation = Activation::new(&item.block, item.step, trx, act, &[], None)
                .map_err(|e| SourceError::Decode(e.to_string()))?;
            let matched = filter.eval_bool(&activation).unwrap_or_else(|e| {
                debug!(block_num = item.block.number, action = %act.name, error = %e, "filter not applicable");
                false
            });
            flags.push(matched);
        }
    }
    let actions = item
        .block
        .transactions
        .iter_mut()
        .flat_map(|trx| trx.action_traces.iter_mut());
    for (act, matched) in actions.zip(flags) {
        act.filtering_matched = matched;
    }
    Ok(())
}

#[async_trait]
impl BlockSource for VecBlockSource {
    async fn open(&mut self, request: &BlockRequest) -> Result<(), SourceError> {
        self.pending = select_blocks(&self.all, request)?.into();
        self.request = Some(request.clone());
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<StreamBlock>, SourceError> {
        Ok(self.pending.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ActionTrace, TransactionStatus, TransactionTrace};
    use chrono::TimeZone;

    fn item(number: u32) -> StreamBlock {
        StreamBlock {
            block: Block {
                id: format!("{number:08x}"),
                number,
                timestamp: chrono::Utc.timestamp_opt(1_600_000_000, 0).unwrap(),
                transactions: vec![],
            },
            step: Step::New,
            cursor: Cursor::new(format!("c{number}")),
        }
    }

    fn numbers(blocks: &[StreamBlock]) -> Vec<u32> {
        blocks.iter().map(|b| b.block.number).collect()
    }

    #[test]
    fn filter_strings() {
        assert_eq!(
            cdc_filter("eosio.token", false),
            r#"account == "eosio.token" && receiver == "eosio.token""#
        );
        assert!(cdc_filter("a", true).starts_with("executed && "));
    }

    #[test]
    fn bounds_and_cursor() {
        let all: Vec<_> = (1..=5).map(item).collect();
        let req = BlockRequest {
            start_block: 2,
            stop_block: 4,
            ..Default::default()
        };
        assert_eq!(numbers(&select_blocks(&all, &req).unwrap()), vec![2, 3, 4]);

        let req = BlockRequest {
            start_block: 1,
            start_cursor: Some(Cursor::new("c3")),
            ..Default::default()
        };
        assert_eq!(numbers(&select_blocks(&all, &req).unwrap()), vec![4, 5]);

        let req = BlockRequest {
            start_cursor: Some(Cursor::new("nope")),
            ..Default::default()
        };
        assert!(select_blocks(&all, &req).is_err());
    }

    fn with_actions(number: u32, actions: &[(&str, &str)]) -> StreamBlock {
        let mut block = item(number);
        block.block.transactions.push(TransactionTrace {
            id: format!("t{number}"),
            status: TransactionStatus::Executed,
            action_traces: actions
                .iter()
                .enumerate()
                .map(|(i, (account, name))| ActionTrace {
                    receiver: account.to_string(),
                    account: account.to_string(),
                    name: name.to_string(),
                    json_data: Some(r#"{"to":"bob"}"#.into()),
                    authorizations: vec![],
                    global_sequence: None,
                    execution_index: i as u32,
                    filtering_matched: false,
                })
                .collect(),
            db_ops: vec![],
        });
        block
    }

    fn flags(item: &StreamBlock) -> Vec<bool> {
        item.block.transactions[0]
            .action_traces
            .iter()
            .map(|a| a.filtering_matched)
            .collect()
    }

    #[test]
    fn include_filter_flags_actions() {
        let all = vec![with_actions(
            1,
            &[("eosio.token", "transfer"), ("eosio", "newaccount"), ("eosio.token", "issue")],
        )];
        let req = BlockRequest {
            include_filter: cdc_filter("eosio.token", true),
            ..Default::default()
        };
        assert_eq!(flags(&select_blocks(&all, &req).unwrap()[0]), vec![true, false, true]);

        let req = BlockRequest {
            include_filter: "action == 'issue' && data.to == 'bob'".into(),
            ..Default::default()
        };
        assert_eq!(flags(&select_blocks(&all, &req).unwrap()[0]), vec![false, false, true]);

        // without a filter the feed's flags are kept
        assert_eq!(
            flags(&select_blocks(&all, &BlockRequest::default()).unwrap()[0]),
            vec![false, false, false]
        );
    }

    #[test]
    fn include_filter_must_compile_and_errors_do_not_match() {
        let all = vec![with_actions(1, &[("eosio.token", "transfer")])];
        let req = BlockRequest {
            include_filter: "size(db_ops) > 0".into(),
            ..Default::default()
        };
        assert!(matches!(select_blocks(&all, &req), Err(SourceError::Other(_))));

        let req = BlockRequest {
            include_filter: "data.memo == 'x'".into(),
            ..Default::default()
        };
        assert_eq!(flags(&select_blocks(&all, &req).unwrap()[0]), vec![false]);
    }

    #[tokio::test]
    async fn vec_source_streams_then_ends() {
        let mut source = VecBlockSource::new(vec![item(1), item(2)]);
        source.open(&BlockRequest::default()).await.unwrap();
        assert_eq!(source.recv().await.unwrap().unwrap().block.number, 1);
        assert_eq!(source.recv().await.unwrap().unwrap().block.number, 2);
        assert!(source.recv().await.unwrap().is_none());
    }
}
