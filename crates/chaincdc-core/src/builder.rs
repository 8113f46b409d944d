//! Fluent builder wiring a [`Pipeline`] from a [`PipelineConfig`].
//!
//! # Example
//!
//! ```rust,no_run
//! use chaincdc_core::{PipelineBuilder, VecBlockSource};
//!
//! let pipeline = PipelineBuilder::new()
//!     .event_source("eos-mainnet")
//!     .generic("action == 'transfer' ? 'Transfer' : 'Other'", "[data.from, data.to]")
//!     .extension("ce_account", "account")
//!     .dry_run(true)
//!     .batch_mode(true)
//!     .build(Box::new(VecBlockSource::new(vec![])))
//!     .unwrap();
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::adapter::{
    ActionGenerator, Adapter, BlockHook, CdcAdapter, Extension, GenericAdapter, JsonCaptureHook,
    KeyRule, NoopBlockHook, TableGenerator,
};
use crate::checkpoint::{CheckpointStore, FileCheckpointStore, NoopCheckpointStore};
use crate::config::{CdcMode, PipelineConfig};
use crate::decoder::{DecodePolicy, NoopRowDecoder, RowDecoder};
use crate::error::ConfigError;
use crate::event::base_headers;
use crate::expr::{Declarations, Program};
use crate::metrics::PipelineMetrics;
use crate::pipeline::Pipeline;
use crate::sink::{CheckpointedSender, DryRunSender, MessageSink, Sender};
use crate::source::{cdc_filter, BlockRequest, BlockSource};

/// Fluent builder for [`Pipeline`].
pub struct PipelineBuilder {
    config: PipelineConfig,
    decoder: Arc<dyn RowDecoder>,
    sink: Option<Arc<dyn MessageSink>>,
    checkpoint: Option<Arc<dyn CheckpointStore>>,
    hook: Option<Arc<dyn BlockHook>>,
    metrics: Arc<PipelineMetrics>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::from_config(PipelineConfig::default())
    }

    pub fn from_config(config: PipelineConfig) -> Self {
        Self {
            config,
            decoder: Arc::new(NoopRowDecoder),
            sink: None,
            checkpoint: None,
            hook: None,
            metrics: Arc::new(PipelineMetrics::new()),
        }
    }

    pub fn event_source(mut self, source: impl Into<String>) -> Self {
        self.config.event_source = source.into();
        self
    }

    pub fn start_block(mut self, block: i64) -> Self {
        self.config.start_block = block;
        self
    }

    pub fn stop_block(mut self, block: u64) -> Self {
        self.config.stop_block = block;
        self
    }

    pub fn batch_mode(mut self, on: bool) -> Self {
        self.config.batch_mode = on;
        self
    }

    pub fn dry_run(mut self, on: bool) -> Self {
        self.config.dry_run = on;
        self
    }

    pub fn strict_decoding(mut self, on: bool) -> Self {
        self.config.strict_decoding = on;
        self
    }

    pub fn irreversible_only(mut self, on: bool) -> Self {
        self.config.irreversible_only = on;
        self
    }

    pub fn commit_min_delay(mut self, delay: Duration) -> Self {
        self.config.commit_min_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn capture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.capture_dir = Some(dir.into());
        self
    }

    pub fn state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.state_file = Some(path.into());
        self
    }

    /// Generic mode with the event-type and event-keys expressions.
    pub fn generic(mut self, event_type: impl Into<String>, event_keys: impl Into<String>) -> Self {
        self.config.cdc_mode = CdcMode::Generic;
        self.config.event_type_expr = event_type.into();
        self.config.event_keys_expr = event_keys.into();
        self
    }

    pub fn include_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.include_filter = filter.into();
        self
    }

    /// Add a header computed by `expr` (generic mode).
    pub fn extension(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.config.extensions.insert(name.into(), expr.into());
        self
    }

    /// Table CDC mode over `account`.
    pub fn tables<I, S>(mut self, account: impl Into<String>, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.cdc_mode = CdcMode::Tables;
        self.config.account = account.into();
        self.config.table_names = tables.into_iter().map(Into::into).collect();
        self
    }

    /// Key expression for one table, replacing `table:scope:primary_key`.
    pub fn table_key(mut self, table: impl Into<String>, expr: impl Into<String>) -> Self {
        self.config.table_keys.insert(table.into(), expr.into());
        self
    }

    /// Action CDC mode over `account`; `actions_json` maps action → key expression.
    pub fn actions(mut self, account: impl Into<String>, actions_json: impl Into<String>) -> Self {
        self.config.cdc_mode = CdcMode::Actions;
        self.config.account = account.into();
        self.config.actions_expr = actions_json.into();
        self
    }

    pub fn executed_only(mut self, on: bool) -> Self {
        self.config.executed_only = on;
        self
    }

    pub fn decoder(mut self, decoder: Arc<dyn RowDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint = Some(store);
        self
    }

    pub fn hook(mut self, hook: Arc<dyn BlockHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn metrics(mut self, metrics: Arc<PipelineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn build_config(self) -> PipelineConfig {
        self.config
    }

    /// Validate, compile every expression and assemble the pipeline.
    pub fn build(self, source: Box<dyn BlockSource>) -> Result<Pipeline, ConfigError> {
        let config = self.config;
        config.validate(self.decoder.is_available())?;

        let adapter = build_adapter(&config, Arc::clone(&self.decoder))?;
        let request = block_request(&config);
        if !request.include_filter.trim().is_empty() {
            compile("include-filter", &request.include_filter, &Declarations::action())?;
        }

        let hook: Arc<dyn BlockHook> = match (self.hook, &config.capture_dir) {
            (Some(hook), _) => hook,
            (None, Some(dir)) => Arc::new(JsonCaptureHook::new(dir)),
            (None, None) => Arc::new(NoopBlockHook),
        };

        let checkpoint: Arc<dyn CheckpointStore> = if config.batch_mode {
            Arc::new(NoopCheckpointStore)
        } else {
            match (self.checkpoint, &config.state_file) {
                (Some(store), _) => store,
                (None, Some(path)) => Arc::new(FileCheckpointStore::new(path)),
                (None, None) => return Err(ConfigError::Missing("checkpoint store".into())),
            }
        };

        let sender: Box<dyn Sender> = if config.dry_run {
            Box::new(DryRunSender::new())
        } else {
            let sink = self
                .sink
                .ok_or_else(|| ConfigError::Missing("message sink".into()))?;
            Box::new(CheckpointedSender::new(sink, Arc::clone(&checkpoint)))
        };

        Ok(Pipeline {
            request,
            batch_mode: config.batch_mode,
            commit_min_delay: config.commit_min_delay(),
            source,
            hook,
            adapter,
            sender,
            checkpoint,
            metrics: self.metrics,
        })
    }
}

fn compile(role: impl Into<String>, source: &str, decls: &Declarations) -> Result<Program, ConfigError> {
    Program::compile(source, decls).map_err(|source| ConfigError::Expression {
        role: role.into(),
        source,
    })
}

/// The adapter selected by `config.cdc_mode`, with every expression compiled.
pub fn build_adapter(
    config: &PipelineConfig,
    decoder: Arc<dyn RowDecoder>,
) -> Result<Arc<dyn Adapter>, ConfigError> {
    let policy = DecodePolicy::from_strict(config.strict_decoding);
    let headers = base_headers(&config.event_source);

    Ok(match config.cdc_mode {
        CdcMode::Generic => {
            let decls = Declarations::generic();
            let extensions = config
                .extensions
                .iter()
                .map(|(name, expr)| {
                    Ok(Extension {
                        name: name.clone(),
                        program: compile(format!("extension '{name}'"), expr, &decls)?,
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;
            Arc::new(GenericAdapter::new(
                decoder,
                policy,
                compile("event-type", &config.event_type_expr, &decls)?,
                compile("event-keys", &config.event_keys_expr, &decls)?,
                extensions,
                headers,
            ))
        }
        CdcMode::Tables => {
            let decls = Declarations::table();
            let mut tables = HashMap::new();
            for name in &config.table_names {
                let rule = match config.table_keys.get(name) {
                    Some(expr) => KeyRule::Expression(compile(format!("key for table '{name}'"), expr, &decls)?),
                    None => KeyRule::PrimaryKey,
                };
                tables.insert(name.clone(), rule);
            }
            Arc::new(CdcAdapter::new(
                TableGenerator::new(decoder, policy, tables),
                headers,
            ))
        }
        CdcMode::Actions => Arc::new(CdcAdapter::new(
            ActionGenerator::from_json(&config.actions_expr)?,
            headers,
        )),
    })
}

/// The initial block request; the cursor is filled in on resume.
pub fn block_request(config: &PipelineConfig) -> BlockRequest {
    let include_filter = match config.cdc_mode {
        CdcMode::Generic => config.include_filter.clone(),
        CdcMode::Tables | CdcMode::Actions => cdc_filter(&config.account, config.executed_only),
    };
    BlockRequest {
        start_block: config.start_block,
        stop_block: config.stop_block,
        start_cursor: None,
        include_filter,
        irreversible_only: config.irreversible_only,
    }
}
