//! ChainCDC CLI: replay a block stream through the event adapters and
//! publish the result with checkpointed delivery.
//!
//! ```text
//! chaincdc --blocks-file blocks.jsonl --event-type "'Transfer'" --event-keys "[data.to]" \
//!          --kafka-endpoints k1:9092 --kafka-topic transfers
//! chaincdc --blocks-file blocks.jsonl --cdc-type tables --account eosio.token \
//!          --table-names accounts,stat --dry-run --batch-mode
//! ```
//!
//! Every flag falls back to a `CHAINCDC_*` environment variable.

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use chaincdc_core::{
    CdcMode, CompressionType, KafkaConfig, NoopCheckpointStore, PipelineBuilder, PipelineConfig,
};

mod logging;
mod source;

use logging::LogConfig;
use source::JsonLinesBlockSource;

#[derive(Parser, Debug)]
#[command(
    name = "chaincdc",
    about = "Derive events from a block stream and publish them to a message bus",
    version
)]
struct Cli {
    /// JSON-lines capture to replay (one `{block, step, cursor}` per line)
    #[arg(long, env = "CHAINCDC_BLOCKS_FILE")]
    blocks_file: PathBuf,

    #[command(flatten)]
    pipeline: PipelineArgs,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[command(flatten)]
    log: LogArgs,
}

#[derive(clap::Args, Debug)]
struct PipelineArgs {
    /// Value of the `ce_source` header
    #[arg(long, env = "CHAINCDC_EVENT_SOURCE", default_value = "chaincdc")]
    event_source: String,

    /// First block when no cursor is stored; negative is relative to head
    #[arg(long, env = "CHAINCDC_START_BLOCK", default_value_t = 0, allow_hyphen_values = true)]
    start_block: i64,

    /// Last block (inclusive), 0 streams forever
    #[arg(long, env = "CHAINCDC_STOP_BLOCK", default_value_t = 0)]
    stop_block: u64,

    /// Ignore cursors: nothing is loaded or saved
    #[arg(long, env = "CHAINCDC_BATCH_MODE")]
    batch_mode: bool,

    /// Log and discard events instead of publishing
    #[arg(long, env = "CHAINCDC_DRY_RUN")]
    dry_run: bool,

    /// Write every received block as `block-<n>.json` into this directory
    #[arg(long, env = "CHAINCDC_CAPTURE_DIR")]
    capture_dir: Option<PathBuf>,

    /// Fail on row mutations that cannot be decoded
    #[arg(long, env = "CHAINCDC_STRICT_DECODING")]
    strict_decoding: bool,

    #[arg(long, env = "CHAINCDC_IRREVERSIBLE_ONLY")]
    irreversible_only: bool,

    /// Minimum delay between two checkpoint commits
    #[arg(long, env = "CHAINCDC_COMMIT_MIN_DELAY_MS", default_value_t = 5_000)]
    commit_min_delay_ms: u64,

    /// Store the cursor in this file instead of the cursor topic
    #[arg(long, env = "CHAINCDC_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// generic | tables | actions
    #[arg(long, env = "CHAINCDC_CDC_TYPE", default_value = "generic")]
    cdc_type: CdcMode,

    /// Generic mode: block-source include filter
    #[arg(long, env = "CHAINCDC_INCLUDE_FILTER", default_value = "")]
    include_filter: String,

    /// Generic mode: expression yielding the event type
    #[arg(long, env = "CHAINCDC_EVENT_TYPE", default_value = "")]
    event_type: String,

    /// Generic mode: expression yielding the list of event keys
    #[arg(long, env = "CHAINCDC_EVENT_KEYS", default_value = "")]
    event_keys: String,

    /// Generic mode: extra header as `name:expression` (repeatable)
    #[arg(long = "event-extension", env = "CHAINCDC_EVENT_EXTENSION")]
    event_extensions: Vec<String>,

    /// CDC modes: contract account to follow
    #[arg(long, env = "CHAINCDC_ACCOUNT", default_value = "")]
    account: String,

    /// CDC modes: skip failed transactions
    #[arg(long, env = "CHAINCDC_EXECUTED_ONLY")]
    executed_only: bool,

    /// Tables mode: comma-separated allow-set
    #[arg(long, env = "CHAINCDC_TABLE_NAMES", value_delimiter = ',')]
    table_names: Vec<String>,

    /// Tables mode: key override as `table:expression` (repeatable)
    #[arg(long = "table-key", env = "CHAINCDC_TABLE_KEY")]
    table_keys: Vec<String>,

    /// Actions mode: JSON object of action name to key expression
    #[arg(long, env = "CHAINCDC_ACTIONS_EXPR", default_value = "")]
    actions_expr: String,
}

#[derive(clap::Args, Debug)]
struct KafkaArgs {
    #[arg(long, env = "CHAINCDC_KAFKA_ENDPOINTS", default_value = "127.0.0.1:9092")]
    kafka_endpoints: String,

    #[arg(long, env = "CHAINCDC_KAFKA_SSL_ENABLE")]
    kafka_ssl_enable: bool,

    #[arg(long, env = "CHAINCDC_KAFKA_SSL_CA_FILE")]
    kafka_ssl_ca_file: Option<PathBuf>,

    #[arg(long, env = "CHAINCDC_KAFKA_SSL_AUTH")]
    kafka_ssl_auth: bool,

    #[arg(long, env = "CHAINCDC_KAFKA_SSL_CLIENT_CERT_FILE")]
    kafka_ssl_client_cert_file: Option<PathBuf>,

    #[arg(long, env = "CHAINCDC_KAFKA_SSL_CLIENT_KEY_FILE")]
    kafka_ssl_client_key_file: Option<PathBuf>,

    /// none | gzip | snappy | lz4 | zstd
    #[arg(long, env = "CHAINCDC_KAFKA_COMPRESSION_TYPE", default_value = "none")]
    kafka_compression_type: CompressionType,

    /// Clamped into the codec's range; -1 selects the codec default
    #[arg(long, env = "CHAINCDC_KAFKA_COMPRESSION_LEVEL", default_value_t = -1, allow_hyphen_values = true)]
    kafka_compression_level: i32,

    #[arg(long, env = "CHAINCDC_KAFKA_MESSAGE_MAX_BYTES", default_value_t = 1_000_000)]
    kafka_message_max_bytes: usize,

    /// Publish and checkpoint inside Kafka transactions
    #[arg(long, env = "CHAINCDC_KAFKA_TRANSACTIONAL_ID")]
    kafka_transactional_id: Option<String>,

    #[arg(long, env = "CHAINCDC_KAFKA_TOPIC", default_value = "chaincdc")]
    kafka_topic: String,

    #[arg(long, env = "CHAINCDC_KAFKA_CURSOR_TOPIC", default_value = "_chaincdc_cursor")]
    kafka_cursor_topic: String,

    #[arg(long, env = "CHAINCDC_KAFKA_CURSOR_PARTITION", default_value_t = 0)]
    kafka_cursor_partition: i32,

    #[arg(long, env = "CHAINCDC_KAFKA_CURSOR_CONSUMER_GROUP_ID")]
    kafka_cursor_consumer_group_id: Option<String>,
}

#[derive(clap::Args, Debug)]
struct LogArgs {
    #[arg(long, env = "CHAINCDC_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Per-crate level as `crate=level` (repeatable)
    #[arg(long = "log-component", env = "CHAINCDC_LOG_COMPONENT")]
    log_components: Vec<String>,

    /// Emit JSON logs
    #[arg(long, env = "CHAINCDC_LOG_JSON")]
    log_json: bool,
}

/// Split `name<sep>value` at the first separator.
fn split_pair(raw: &str, sep: char, what: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(sep)
        .ok_or_else(|| anyhow!("{what} '{raw}' must look like name{sep}value"))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("{what} '{raw}' has an empty name");
    }
    Ok((name.to_string(), value.trim().to_string()))
}

fn pairs(raw: &[String], sep: char, what: &str) -> Result<BTreeMap<String, String>> {
    raw.iter().map(|r| split_pair(r, sep, what)).collect()
}

impl Cli {
    fn log_config(&self) -> Result<LogConfig> {
        Ok(LogConfig {
            level: self.log.log_level.clone(),
            components: pairs(&self.log.log_components, '=', "log component")?,
            json: self.log.log_json,
        })
    }

    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let p = &self.pipeline;
        let k = &self.kafka;
        Ok(PipelineConfig {
            event_source: p.event_source.clone(),
            start_block: p.start_block,
            stop_block: p.stop_block,
            batch_mode: p.batch_mode,
            dry_run: p.dry_run,
            capture_dir: p.capture_dir.clone(),
            strict_decoding: p.strict_decoding,
            irreversible_only: p.irreversible_only,
            commit_min_delay_ms: p.commit_min_delay_ms,
            state_file: p.state_file.clone(),
            cdc_mode: p.cdc_type,
            include_filter: p.include_filter.clone(),
            event_type_expr: p.event_type.clone(),
            event_keys_expr: p.event_keys.clone(),
            extensions: pairs(&p.event_extensions, ':', "event extension")?,
            account: p.account.clone(),
            executed_only: p.executed_only,
            table_names: p
                .table_names
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            table_keys: pairs(&p.table_keys, ':', "table key")?,
            actions_expr: p.actions_expr.clone(),
            kafka: KafkaConfig {
                endpoints: k.kafka_endpoints.clone(),
                ssl_enable: k.kafka_ssl_enable,
                ssl_ca_file: k.kafka_ssl_ca_file.clone(),
                ssl_auth: k.kafka_ssl_auth,
                ssl_client_cert_file: k.kafka_ssl_client_cert_file.clone(),
                ssl_client_key_file: k.kafka_ssl_client_key_file.clone(),
                compression_type: k.kafka_compression_type,
                compression_level: k.kafka_compression_level,
                message_max_bytes: k.kafka_message_max_bytes,
                transactional_id: k.kafka_transactional_id.clone(),
                topic: k.kafka_topic.clone(),
                cursor_topic: k.kafka_cursor_topic.clone(),
                cursor_partition: k.kafka_cursor_partition,
                cursor_consumer_group_id: k.kafka_cursor_consumer_group_id.clone(),
            },
        })
    }
}

/// A streaming dry run with no state file has nowhere to read a cursor from.
fn dry_run_store(builder: PipelineBuilder, config: &PipelineConfig) -> PipelineBuilder {
    if !config.batch_mode && config.state_file.is_none() {
        info!("dry run without state file, starting from the configured start block");
        builder.checkpoint_store(Arc::new(NoopCheckpointStore))
    } else {
        builder
    }
}

#[cfg(feature = "kafka")]
async fn attach_bus(builder: PipelineBuilder, config: &PipelineConfig) -> Result<PipelineBuilder> {
    use chaincdc_bus::KafkaBus;
    use chaincdc_core::BusCheckpointStore;

    if config.dry_run {
        return Ok(dry_run_store(builder, config));
    }

    let bus = Arc::new(
        KafkaBus::connect(&config.kafka)
            .await
            .with_context(|| format!("connecting to kafka at {}", config.kafka.endpoints))?,
    );
    info!(
        endpoints = %config.kafka.endpoints,
        topic = %config.kafka.topic,
        transactional = config.kafka.is_transactional(),
        "kafka producer ready"
    );

    let mut builder = builder.sink(bus.clone());
    if !config.batch_mode && config.state_file.is_none() {
        builder = builder.checkpoint_store(Arc::new(BusCheckpointStore::new(
            bus,
            config.kafka.cursor_topic.clone(),
            config.kafka.cursor_partition,
        )));
    }
    Ok(builder)
}

#[cfg(not(feature = "kafka"))]
async fn attach_bus(builder: PipelineBuilder, config: &PipelineConfig) -> Result<PipelineBuilder> {
    if config.dry_run {
        return Ok(dry_run_store(builder, config));
    }
    bail!("chaincdc was built without the `kafka` feature; only --dry-run is available")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_tracing(&cli.log_config()?);

    let config = cli.pipeline_config()?;
    config.validate(false).context("invalid configuration")?;

    let builder = attach_bus(PipelineBuilder::from_config(config.clone()), &config).await?;
    let mut pipeline = builder
        .build(Box::new(JsonLinesBlockSource::new(&cli.blocks_file)))
        .context("assembling pipeline")?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, committing last block and shutting down");
            token.cancel();
        }
    });

    info!(
        mode = ?config.cdc_mode,
        start_block = config.start_block,
        stop_block = config.stop_block,
        batch = config.batch_mode,
        dry_run = config.dry_run,
        "starting pipeline"
    );
    pipeline.run(cancel).await.context("pipeline failed")?;

    let stats = pipeline.metrics().snapshot();
    info!(
        blocks = stats.blocks_received,
        transactions = stats.transaction_traces_received,
        actions = stats.action_traces_received,
        messages = stats.messages_sent,
        commits = stats.commits,
        "pipeline finished"
    );
    Ok(())
}
