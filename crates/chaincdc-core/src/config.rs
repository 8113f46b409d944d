//! Pipeline configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::error::ConfigError;

/// Which adapter derives the events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CdcMode {
    /// Type, keys and extensions from expressions.
    #[default]
    Generic,
    /// One event per mutation of an allowed table.
    Tables,
    /// One event per configured action.
    Actions,
}

impl FromStr for CdcMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "generic" => Ok(Self::Generic),
            "tables" => Ok(Self::Tables),
            "actions" => Ok(Self::Actions),
            other => Err(ConfigError::Invalid {
                name: "cdc-type".into(),
                reason: format!("unknown mode '{other}', expected 'tables' or 'actions'"),
            }),
        }
    }
}

// ─── Kafka ────────────────────────────────────────────────────────────────────

/// Producer compression codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    #[default]
    None,
    Gzip,
    Snappy,
    Lz4,
    Zstd,
}

impl CompressionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Snappy => "snappy",
            Self::Lz4 => "lz4",
            Self::Zstd => "zstd",
        }
    }

    /// Accepted `(min, max)` compression level.
    pub fn level_range(&self) -> (i32, i32) {
        match self {
            Self::None | Self::Snappy => (0, 0),
            Self::Gzip => (0, 9),
            Self::Lz4 => (0, 12),
            Self::Zstd => (-1, -1),
        }
    }

    /// Clamp `level` into the codec range. `-1` (codec default) passes through.
    pub fn normalize_level(&self, level: i32) -> i32 {
        if level == -1 {
            return level;
        }
        let (min, max) = self.level_range();
        if level > max {
            warn!(codec = self.as_str(), current = level, max, "compression level too high");
            max
        } else if level < min {
            warn!(codec = self.as_str(), current = level, min, "compression level too low");
            min
        } else {
            level
        }
    }
}

impl fmt::Display for CompressionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CompressionType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Ok(Self::None),
            "gzip" => Ok(Self::Gzip),
            "snappy" => Ok(Self::Snappy),
            "lz4" => Ok(Self::Lz4),
            "zstd" => Ok(Self::Zstd),
            other => Err(ConfigError::Invalid {
                name: "kafka-compression-type".into(),
                reason: format!("unsupported codec '{other}'"),
            }),
        }
    }
}

/// Message bus connection and topic settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    /// Comma-separated bootstrap servers.
    pub endpoints: String,
    pub ssl_enable: bool,
    pub ssl_ca_file: Option<PathBuf>,
    /// Mutual TLS with a client certificate.
    pub ssl_auth: bool,
    pub ssl_client_cert_file: Option<PathBuf>,
    pub ssl_client_key_file: Option<PathBuf>,
    pub compression_type: CompressionType,
    /// `-1` selects the codec default.
    pub compression_level: i32,
    pub message_max_bytes: usize,
    /// Enables transactional publishing when set.
    pub transactional_id: Option<String>,
    /// Topic receiving the events.
    pub topic: String,
    pub cursor_topic: String,
    pub cursor_partition: i32,
    pub cursor_consumer_group_id: Option<String>,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            endpoints: "127.0.0.1:9092".into(),
            ssl_enable: false,
            ssl_ca_file: None,
            ssl_auth: false,
            ssl_client_cert_file: None,
            ssl_client_key_file: None,
            compression_type: CompressionType::None,
            compression_level: -1,
            message_max_bytes: 1_000_000,
            transactional_id: None,
            topic: "chaincdc".into(),
            cursor_topic: "_chaincdc_cursor".into(),
            cursor_partition: 0,
            cursor_consumer_group_id: None,
        }
    }
}

fn path_str(p: &Option<PathBuf>) -> String {
    p.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_default()
}

impl KafkaConfig {
    /// Client properties shared by producers, consumers and admin clients.
    pub fn client_properties(&self) -> BTreeMap<String, String> {
        let mut props = BTreeMap::new();
        props.insert("bootstrap.servers".into(), self.endpoints.clone());
        if self.ssl_enable {
            props.insert("security.protocol".into(), "ssl".into());
            props.insert("ssl.ca.location".into(), path_str(&self.ssl_ca_file));
        }
        if self.ssl_auth {
            props.insert(
                "ssl.certificate.location".into(),
                path_str(&self.ssl_client_cert_file),
            );
            props.insert("ssl.key.location".into(), path_str(&self.ssl_client_key_file));
        }
        props
    }

    /// Producer properties: client properties plus compression and limits.
    pub fn producer_properties(&self) -> BTreeMap<String, String> {
        let mut props = self.client_properties();
        props.insert(
            "compression.type".into(),
            self.compression_type.as_str().into(),
        );
        props.insert(
            "compression.level".into(),
            self.compression_type
                .normalize_level(self.compression_level)
                .to_string(),
        );
        props.insert(
            "message.max.bytes".into(),
            self.message_max_bytes.to_string(),
        );
        if let Some(id) = &self.transactional_id {
            props.insert("transactional.id".into(), id.clone());
        }
        props
    }

    /// Consumer group used to read back the cursor topic.
    pub fn cursor_group_id(&self) -> String {
        self.cursor_consumer_group_id.clone().unwrap_or_else(|| {
            format!("{}-{}", self.cursor_topic, self.cursor_partition).replace('_', "")
        })
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

// ─── Pipeline ─────────────────────────────────────────────────────────────────

/// Configuration for a pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Value of the `ce_source` header.
    pub event_source: String,
    /// First block to stream when no cursor is found. Negative is relative to head.
    pub start_block: i64,
    /// Last block (inclusive). `0` = stream forever.
    pub stop_block: u64,
    /// Ignore cursors entirely; nothing is loaded or saved.
    pub batch_mode: bool,
    /// Discard messages instead of publishing them.
    pub dry_run: bool,
    /// Directory receiving `block-<n>.json` captures.
    pub capture_dir: Option<PathBuf>,
    /// Fail the block when a row mutation cannot be decoded.
    pub strict_decoding: bool,
    /// Only stream irreversible blocks.
    pub irreversible_only: bool,
    /// Minimum delay between two checkpoint writes (milliseconds).
    pub commit_min_delay_ms: u64,
    /// Cursor file; the bus-backed store is used when `None`.
    pub state_file: Option<PathBuf>,

    pub cdc_mode: CdcMode,
    /// Generic mode: block-source include filter.
    pub include_filter: String,
    pub event_type_expr: String,
    pub event_keys_expr: String,
    /// Header name → expression.
    pub extensions: BTreeMap<String, String>,

    /// CDC modes: contract account to follow.
    pub account: String,
    /// CDC modes: only executed transactions.
    pub executed_only: bool,
    /// Tables mode: allow-set.
    pub table_names: Vec<String>,
    /// Tables mode: table → key expression overriding `table:scope:primary_key`.
    pub table_keys: BTreeMap<String, String>,
    /// Actions mode: JSON object of action name → key expression.
    pub actions_expr: String,

    pub kafka: KafkaConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            event_source: "chaincdc".into(),
            start_block: 0,
            stop_block: 0,
            batch_mode: false,
            dry_run: false,
            capture_dir: None,
            strict_decoding: false,
            irreversible_only: false,
            commit_min_delay_ms: 5_000,
            state_file: None,
            cdc_mode: CdcMode::Generic,
            include_filter: String::new(),
            event_type_expr: String::new(),
            event_keys_expr: String::new(),
            extensions: BTreeMap::new(),
            account: String::new(),
            executed_only: false,
            table_names: Vec::new(),
            table_keys: BTreeMap::new(),
            actions_expr: String::new(),
            kafka: KafkaConfig::default(),
        }
    }
}

fn missing(name: &str) -> ConfigError {
    ConfigError::Missing(name.to_string())
}

impl PipelineConfig {
    pub fn commit_min_delay(&self) -> Duration {
        Duration::from_millis(self.commit_min_delay_ms)
    }

    /// Reject inconsistent settings.
    ///
    /// `decoder_available` tells whether a real row decoder is configured.
    pub fn validate(&self, decoder_available: bool) -> Result<(), ConfigError> {
        if self.event_source.trim().is_empty() {
            return Err(missing("event-source"));
        }
        if self.strict_decoding && !decoder_available {
            return Err(ConfigError::Invalid {
                name: "strict-decoding".into(),
                reason: "no row decoder is configured".into(),
            });
        }
        if self.stop_block != 0
            && self.start_block >= 0
            && self.stop_block < self.start_block as u64
        {
            return Err(ConfigError::Invalid {
                name: "stop-block".into(),
                reason: format!(
                    "{} is before start block {}",
                    self.stop_block, self.start_block
                ),
            });
        }
        match self.cdc_mode {
            CdcMode::Generic => {
                if self.event_type_expr.trim().is_empty() {
                    return Err(missing("event-type"));
                }
                if self.event_keys_expr.trim().is_empty() {
                    return Err(missing("event-keys"));
                }
            }
            CdcMode::Tables => {
                if self.account.trim().is_empty() {
                    return Err(missing("account"));
                }
                if self.table_names.is_empty() {
                    return Err(missing("table-names"));
                }
                if let Some(table) = self
                    .table_keys
                    .keys()
                    .find(|t| !self.table_names.contains(t))
                {
                    return Err(ConfigError::Invalid {
                        name: "table-key".into(),
                        reason: format!("key expression for table '{table}' outside the allow-set"),
                    });
                }
            }
            CdcMode::Actions => {
                if self.account.trim().is_empty() {
                    return Err(missing("account"));
                }
                if self.actions_expr.trim().is_empty() {
                    return Err(missing("actions-expr"));
                }
            }
        }
        if !self.dry_run {
            if self.kafka.endpoints.trim().is_empty() {
                return Err(missing("kafka-endpoints"));
            }
            if self.kafka.topic.trim().is_empty() {
                return Err(missing("kafka-topic"));
            }
        }
        if !self.batch_mode && self.state_file.is_none() && self.kafka.cursor_topic.trim().is_empty() {
            return Err(missing("kafka-cursor-topic"));
        }
        Ok(())
    }
}
