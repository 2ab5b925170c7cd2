// SPDX-License-Identifier: Apache-2.0

use clap::{Args, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::crawler::config::{CrawlerConfig, PartialLinePolicy, PatternGroup};

/// What to do with an unterminated line when a file stops being tailed
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum PartialLinePolicyArg {
    /// Emit it, marked as partial
    Emit,
    /// Drop it; it is read again on resume
    #[default]
    Discard,
}

impl From<PartialLinePolicyArg> for PartialLinePolicy {
    fn from(p: PartialLinePolicyArg) -> Self {
        match p {
            PartialLinePolicyArg::Emit => PartialLinePolicy::Emit,
            PartialLinePolicyArg::Discard => PartialLinePolicy::Discard,
        }
    }
}

/// Byte that ends a line
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LineTerminatorArg {
    /// '\n', with a preceding '\r' stripped
    #[default]
    Newline,
    /// NUL byte
    Nul,
}

impl LineTerminatorArg {
    fn byte(self) -> u8 {
        match self {
            LineTerminatorArg::Newline => b'\n',
            LineTerminatorArg::Nul => 0,
        }
    }
}

#[derive(Debug, Args, Clone)]
pub struct CrawlArgs {
    /// Comma-separated glob patterns forming one pattern group; repeat the flag for more groups
    #[arg(long, env = "LOGCRAWL_PATHS", action = clap::ArgAction::Append, required = true)]
    pub paths: Vec<String>,

    /// Comma-separated glob patterns excluded from every group
    #[arg(long, env = "LOGCRAWL_EXCLUDE", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Interval in milliseconds between scans of each group's patterns
    #[arg(long, env = "LOGCRAWL_SCAN_INTERVAL_MS", default_value = "10000")]
    pub scan_interval_ms: u64,

    /// Time in milliseconds a tailed file may be missing before its tailer is stopped
    #[arg(long, env = "LOGCRAWL_STALENESS_THRESHOLD_MS", default_value = "60000")]
    pub staleness_threshold_ms: u64,

    /// Skip newly seen files not modified within this many milliseconds
    #[arg(long, env = "LOGCRAWL_IGNORE_OLDER_MS")]
    pub ignore_older_ms: Option<u64>,

    #[arg(
        value_enum,
        long,
        env = "LOGCRAWL_PARTIAL_LINE_POLICY",
        default_value = "discard"
    )]
    pub partial_line_policy: PartialLinePolicyArg,

    #[arg(
        value_enum,
        long,
        env = "LOGCRAWL_LINE_TERMINATOR",
        default_value = "newline"
    )]
    pub line_terminator: LineTerminatorArg,

    /// Maximum line size in bytes (longer lines are truncated)
    #[arg(long, env = "LOGCRAWL_MAX_LINE_SIZE", default_value = "65536")]
    pub max_line_size: usize,

    /// Bytes requested per read
    #[arg(long, env = "LOGCRAWL_READ_CHUNK_SIZE", default_value = "65536")]
    pub read_chunk_size: usize,

    /// Sleep in milliseconds after a read found no new data
    #[arg(long, env = "LOGCRAWL_READ_BACKOFF_MS", default_value = "250")]
    pub read_backoff_ms: u64,

    /// Upper bound in milliseconds for the backoff between failed reads
    #[arg(long, env = "LOGCRAWL_MAX_READ_BACKOFF_MS", default_value = "5000")]
    pub max_read_backoff_ms: u64,

    /// Consecutive read failures tolerated before a tailer gives up
    #[arg(long, env = "LOGCRAWL_MAX_READ_RETRIES", default_value = "5")]
    pub max_read_retries: u32,

    /// Leading bytes of a file compared to recognize a reused identity
    #[arg(long, env = "LOGCRAWL_FINGERPRINT_SIZE", default_value = "1000")]
    pub fingerprint_size: usize,

    /// Path of the persisted offsets registry
    #[arg(
        long,
        env = "LOGCRAWL_REGISTRY_PATH",
        default_value = "/var/lib/logcrawl/registry.json"
    )]
    pub registry_path: PathBuf,

    /// Interval in milliseconds between registry snapshots
    #[arg(long, env = "LOGCRAWL_PERSIST_INTERVAL_MS", default_value = "1000")]
    pub persist_interval_ms: u64,

    /// Maximum time in milliseconds to wait for tailers during shutdown
    #[arg(long, env = "LOGCRAWL_SHUTDOWN_TIMEOUT_MS", default_value = "5000")]
    pub shutdown_timeout_ms: u64,

    /// Maximum duration in milliseconds of consecutive persist failures before they are reported
    #[arg(
        long,
        env = "LOGCRAWL_MAX_PERSIST_FAILURE_DURATION_MS",
        default_value = "60000"
    )]
    pub max_persist_failure_duration_ms: u64,

    /// Capacity of the queue between tailers and the output
    #[arg(long, env = "LOGCRAWL_EVENT_QUEUE_SIZE", default_value = "1000")]
    pub event_queue_size: usize,

    #[arg(long, env = "LOGCRAWL_ACK_CHANNEL_SIZE", default_value = "1024")]
    pub ack_channel_size: usize,

    #[arg(long, env = "LOGCRAWL_FAILURE_CHANNEL_SIZE", default_value = "128")]
    pub failure_channel_size: usize,
}

impl CrawlArgs {
    /// One pattern group per `--paths` occurrence
    pub fn build_groups(&self) -> Vec<PatternGroup> {
        self.paths
            .iter()
            .map(|group| {
                let patterns = group
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from);

                PatternGroup {
                    exclude: self.exclude.clone(),
                    scan_interval: Duration::from_millis(self.scan_interval_ms),
                    staleness_threshold: Duration::from_millis(self.staleness_threshold_ms),
                    ignore_older: self.ignore_older_ms.map(Duration::from_millis),
                    partial_line_policy: self.partial_line_policy.into(),
                    line_terminator: self.line_terminator.byte(),
                    max_line_size: self.max_line_size,
                    read_chunk_size: self.read_chunk_size,
                    read_backoff: Duration::from_millis(self.read_backoff_ms),
                    max_read_backoff: Duration::from_millis(self.max_read_backoff_ms),
                    max_read_retries: self.max_read_retries,
                    fingerprint_size: self.fingerprint_size,
                    ..PatternGroup::new(patterns)
                }
            })
            .collect()
    }

    pub fn build_config(&self) -> CrawlerConfig {
        CrawlerConfig {
            registry_path: self.registry_path.clone(),
            persist_interval: Duration::from_millis(self.persist_interval_ms),
            shutdown_timeout: Duration::from_millis(self.shutdown_timeout_ms),
            max_persist_failure_duration: Duration::from_millis(
                self.max_persist_failure_duration_ms,
            ),
            failure_channel_size: self.failure_channel_size,
            ack_channel_size: self.ack_channel_size,
        }
    }
}
