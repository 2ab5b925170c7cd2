// SPDX-License-Identifier: Apache-2.0

//! Configuration for the crawler.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::crawler::error::{Error, Result};
use crate::crawler::input::DEFAULT_FINGERPRINT_SIZE;

/// What a Tailer does with an unterminated trailing line when it is stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialLinePolicy {
    /// Emit the buffered bytes as a partial event
    Emit,
    /// Drop the buffered bytes; they are read again on resume
    #[default]
    Discard,
}

/// A set of glob patterns harvested by one Discoverer
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PatternGroup {
    /// Glob patterns for files to include
    pub paths: Vec<String>,
    /// Glob patterns for files to exclude
    pub exclude: Vec<String>,
    /// How often the globs are resolved again
    pub scan_interval: Duration,
    /// How long a tailed path may be missing before its Tailer is stopped
    pub staleness_threshold: Duration,
    /// Skip newly seen files not modified within this window
    pub ignore_older: Option<Duration>,
    pub partial_line_policy: PartialLinePolicy,
    pub line_terminator: u8,
    /// Maximum line size in bytes (longer lines are truncated)
    pub max_line_size: usize,
    /// Bytes requested per read call
    pub read_chunk_size: usize,
    /// Sleep between reads that found no new data
    pub read_backoff: Duration,
    /// Upper bound for the backoff between failed reads
    pub max_read_backoff: Duration,
    /// Consecutive read failures tolerated before a Tailer errors out
    pub max_read_retries: u32,
    /// Leading bytes compared to recognize a reused identity
    pub fingerprint_size: usize,
}

impl Default for PatternGroup {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            exclude: Vec::new(),
            scan_interval: Duration::from_secs(10),
            staleness_threshold: Duration::from_secs(60),
            ignore_older: None,
            partial_line_policy: PartialLinePolicy::Discard,
            line_terminator: b'\n',
            max_line_size: 65536,
            read_chunk_size: 65536,
            read_backoff: Duration::from_millis(250),
            max_read_backoff: Duration::from_secs(5),
            max_read_retries: 5,
            fingerprint_size: DEFAULT_FINGERPRINT_SIZE,
        }
    }
}

impl PatternGroup {
    /// Group with default settings for the given patterns
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    /// Validate the group, including every glob pattern
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(Error::Config(
                "At least one path pattern must be specified".to_string(),
            ));
        }

        for pattern in self.paths.iter().chain(self.exclude.iter()) {
            glob::Pattern::new(pattern)
                .map_err(|e| Error::InvalidGlob(format!("{}: {}", pattern, e)))?;
        }

        if self.scan_interval.is_zero() {
            return Err(Error::Config("scan_interval must be positive".to_string()));
        }

        if self.read_backoff.is_zero() {
            return Err(Error::Config("read_backoff must be positive".to_string()));
        }

        if self.max_line_size == 0 || self.read_chunk_size == 0 || self.fingerprint_size == 0 {
            return Err(Error::Config(
                "max_line_size, read_chunk_size and fingerprint_size must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

/// Settings shared by every Discoverer of a Supervisor
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Path of the persisted registry snapshot
    pub registry_path: PathBuf,
    /// Interval between registry snapshots
    pub persist_interval: Duration,
    /// Bound on how long Stop waits for workers before forcing them
    pub shutdown_timeout: Duration,
    /// How long persist failures may continue before they are reported
    pub max_persist_failure_duration: Duration,
    pub failure_channel_size: usize,
    pub ack_channel_size: usize,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            registry_path: PathBuf::from("/var/lib/logcrawl/registry.json"),
            persist_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            max_persist_failure_duration: Duration::from_secs(60),
            failure_channel_size: 128,
            ack_channel_size: 1024,
        }
    }
}

impl CrawlerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.persist_interval.is_zero() {
            return Err(Error::Config(
                "persist_interval must be positive".to_string(),
            ));
        }

        if self.failure_channel_size == 0 || self.ack_channel_size == 0 {
            return Err(Error::Config("channel sizes must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_group_defaults() {
        let group = PatternGroup::new(["/var/log/*.log"]);
        assert_eq!(group.paths, vec!["/var/log/*.log".to_string()]);
        assert_eq!(group.partial_line_policy, PartialLinePolicy::Discard);
        assert_eq!(group.line_terminator, b'\n');
        assert!(group.validate().is_ok());
    }

    #[test]
    fn test_pattern_group_validation() {
        let mut group = PatternGroup::default();
        assert!(matches!(group.validate(), Err(Error::Config(_))));

        group.paths = vec!["/var/log/[.log".to_string()];
        assert!(matches!(group.validate(), Err(Error::InvalidGlob(_))));

        group.paths = vec!["/var/log/*.log".to_string()];
        group.exclude = vec!["/var/log/[".to_string()];
        assert!(matches!(group.validate(), Err(Error::InvalidGlob(_))));

        group.exclude.clear();
        group.scan_interval = Duration::ZERO;
        assert!(matches!(group.validate(), Err(Error::Config(_))));

        group.scan_interval = Duration::from_secs(1);
        group.fingerprint_size = 0;
        assert!(matches!(group.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_partial_line_policy_deserialize() {
        let policy: PartialLinePolicy = serde_json::from_str("\"emit\"").unwrap();
        assert_eq!(policy, PartialLinePolicy::Emit);

        let group: PatternGroup =
            serde_json::from_str(r#"{"paths": ["/tmp/*.log"], "partial_line_policy": "discard"}"#)
                .unwrap();
        assert_eq!(group.partial_line_policy, PartialLinePolicy::Discard);
        assert_eq!(group.scan_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_crawler_config_validation() {
        let mut config = CrawlerConfig::default();
        assert!(config.validate().is_ok());

        config.ack_channel_size = 0;
        assert!(config.validate().is_err());
    }
}
