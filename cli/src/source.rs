//! Replay of captured blocks from a JSON-lines file.
//!
//! Each non-empty line is one stream item:
//!
//! ```json
//! {"block": {"id": "…", "number": 42, "timestamp": "…", "transactions": []}, "step": "STEP_NEW", "cursor": "…"}
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::info;

use chaincdc_core::source::select_blocks;
use chaincdc_core::{Block, BlockRequest, BlockSource, Cursor, SourceError, Step, StreamBlock};

#[derive(Deserialize)]
struct Line {
    block: Block,
    #[serde(default = "default_step")]
    step: String,
    cursor: String,
}

fn default_step() -> String {
    Step::New.as_wire().to_string()
}

fn parse_lines(text: &str) -> Result<Vec<StreamBlock>, SourceError> {
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(i, line)| {
            let parsed: Line = serde_json::from_str(line)
                .map_err(|e| SourceError::Decode(format!("line {}: {e}", i + 1)))?;
            let step = parsed
                .step
                .parse::<Step>()
                .map_err(|e| SourceError::Decode(format!("line {}: {e}", i + 1)))?;
            Ok(StreamBlock {
                block: parsed.block,
                step,
                cursor: Cursor::new(parsed.cursor),
            })
        })
        .collect()
}

/// Block source reading a JSON-lines capture at `open`.
pub struct JsonLinesBlockSource {
    path: PathBuf,
    pending: VecDeque<StreamBlock>,
}

impl JsonLinesBlockSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            pending: VecDeque::new(),
        }
    }
}

#[async_trait]
impl BlockSource for JsonLinesBlockSource {
    async fn open(&mut self, request: &BlockRequest) -> Result<(), SourceError> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        let all = parse_lines(&text)?;
        self.pending = select_blocks(&all, request)?.into();
        info!(
            path = %self.path.display(),
            available = all.len(),
            selected = self.pending.len(),
            filter = %request.include_filter,
            "replaying blocks"
        );
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<StreamBlock>, SourceError> {
        Ok(self.pending.pop_front())
    }
}
