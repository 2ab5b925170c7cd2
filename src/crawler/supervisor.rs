// SPDX-License-Identifier: Apache-2.0

//! Top-level entry point of the crawler.
//!
//! The Supervisor owns the Registry, the acknowledgement and failure
//! channels, and one Discoverer per pattern group. `start` is fail-closed:
//! every group is validated before any worker is spawned. `stop` cancels
//! everything, joins with a bounded wait, and writes a final registry
//! snapshot.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, timeout, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bounded_channel::{self, BoundedReceiver, BoundedSender};
use crate::crawler::config::{CrawlerConfig, PatternGroup};
use crate::crawler::discoverer::{Discoverer, DiscovererReport, IdentityClaims, SessionPositions};
use crate::crawler::error::{Error, GroupError, Result};
use crate::crawler::event::{Acknowledgement, Event, FailureReport};
use crate::crawler::input::FileId;
use crate::crawler::offset_committer::{FileOffsetCommitter, OffsetCommitterConfig};
use crate::crawler::registry::Registry;

/// Extra time Discoverers get on top of `shutdown_timeout` to report back
/// after aborting their own stragglers
const DISCOVERER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

struct Pipeline {
    cancel: CancellationToken,
    discoverers: JoinSet<DiscovererReport>,
    committer_cancel: CancellationToken,
    committer: JoinHandle<()>,
}

pub struct Supervisor {
    config: CrawlerConfig,
    registry: Arc<Registry>,
    claims: IdentityClaims,
    state: Mutex<LifecycleState>,
    pipeline: Mutex<Option<Pipeline>>,
    ack_tx: BoundedSender<Acknowledgement>,
    ack_rx: BoundedReceiver<Acknowledgement>,
    failures_tx: BoundedSender<FailureReport>,
    failures_rx: BoundedReceiver<FailureReport>,
}

impl Supervisor {
    /// Validate `config` and open the registry snapshot it points at.
    pub fn new(config: CrawlerConfig) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(Registry::open(&config.registry_path)?);
        Ok(Self::with_registry(config, registry))
    }

    /// Build a Supervisor around an existing registry
    pub fn with_registry(config: CrawlerConfig, registry: Arc<Registry>) -> Self {
        let (ack_tx, ack_rx) = bounded_channel::bounded(config.ack_channel_size);
        let (failures_tx, failures_rx) = bounded_channel::bounded(config.failure_channel_size);

        Self {
            config,
            registry,
            claims: IdentityClaims::new(),
            state: Mutex::new(LifecycleState::Idle),
            pipeline: Mutex::new(None),
            ack_tx,
            ack_rx,
            failures_tx,
            failures_rx,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.lock_state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Sender the event consumer uses to acknowledge delivered events
    pub fn acknowledger(&self) -> BoundedSender<Acknowledgement> {
        self.ack_tx.clone()
    }

    /// Runtime failures of Discoverers, Tailers and the committer
    pub fn failures(&self) -> BoundedReceiver<FailureReport> {
        self.failures_rx.clone()
    }

    /// Start one Discoverer per group, all feeding `sink`.
    ///
    /// Returns once every worker is spawned. Fails without spawning anything
    /// if `groups` is empty or any group is invalid. Must be called within a
    /// Tokio runtime.
    pub fn start(&self, groups: Vec<PatternGroup>, sink: BoundedSender<Event>) -> Result<()> {
        let mut state = self.lock_state();
        match *state {
            LifecycleState::Idle | LifecycleState::Stopped => {}
            current => {
                return Err(Error::Lifecycle {
                    state: current,
                    action: "start",
                });
            }
        }

        if groups.is_empty() {
            return Err(Error::Config(
                "At least one pattern group must be specified".to_string(),
            ));
        }

        let group_count = groups.len();
        let positions = SessionPositions::new(position_retention(&groups));
        let mut discoverers = Vec::with_capacity(group_count);
        let mut errors = Vec::new();
        for (index, group) in groups.into_iter().enumerate() {
            match Discoverer::new(
                index,
                group,
                self.registry.clone(),
                self.claims.clone(),
                positions.clone(),
                sink.clone(),
                self.failures_tx.clone(),
            ) {
                Ok(discoverer) => discoverers.push(discoverer),
                Err(e) => errors.push(GroupError {
                    group: index,
                    error: Box::new(e),
                }),
            }
        }

        if !errors.is_empty() {
            let err = Error::DiscovererInit(errors);
            error!("Supervisor not started: {}", err);
            return Err(err);
        }

        let committer_cancel = CancellationToken::new();
        let mut committer = FileOffsetCommitter::new(
            self.ack_rx.clone(),
            self.registry.clone(),
            OffsetCommitterConfig {
                persist_interval: self.config.persist_interval,
                drain_timeout: self.config.shutdown_timeout.min(Duration::from_secs(1)),
                max_persist_failure_duration: self.config.max_persist_failure_duration,
            },
            self.failures_tx.clone(),
        );
        let committer = tokio::spawn({
            let cancel = committer_cancel.clone();
            async move { committer.run(cancel).await }
        });

        let cancel = CancellationToken::new();
        let mut set = JoinSet::new();
        for discoverer in discoverers {
            set.spawn(discoverer.run(cancel.child_token(), self.config.shutdown_timeout));
        }

        *self.lock_pipeline() = Some(Pipeline {
            cancel,
            discoverers: set,
            committer_cancel,
            committer,
        });
        *state = LifecycleState::Running;

        info!(
            groups = group_count,
            known_files = self.registry.len(),
            registry = ?self.registry.path(),
            "Supervisor started"
        );
        Ok(())
    }

    /// Stop every worker and write a final registry snapshot.
    ///
    /// Waits at most about `shutdown_timeout` for Tailers; stragglers are
    /// aborted and their identities returned. Stopping a Supervisor that is
    /// not running is a no-op.
    pub async fn stop(&self) -> Result<Vec<FileId>> {
        let pipeline = {
            let mut state = self.lock_state();
            match *state {
                LifecycleState::Running => {
                    *state = LifecycleState::Stopping;
                    self.lock_pipeline().take()
                }
                LifecycleState::Idle | LifecycleState::Stopped => return Ok(Vec::new()),
                LifecycleState::Stopping => {
                    return Err(Error::Lifecycle {
                        state: LifecycleState::Stopping,
                        action: "stop",
                    });
                }
            }
        };

        let mut force_stopped = Vec::new();
        if let Some(pipeline) = pipeline {
            info!("Stopping supervisor");
            force_stopped = self.shutdown(pipeline).await;
        }

        *self.lock_state() = LifecycleState::Stopped;
        info!(force_stopped = force_stopped.len(), "Supervisor stopped");
        Ok(force_stopped)
    }

    async fn shutdown(&self, mut pipeline: Pipeline) -> Vec<FileId> {
        pipeline.cancel.cancel();

        let mut force_stopped = Vec::new();
        let deadline = Instant::now() + self.config.shutdown_timeout + DISCOVERER_GRACE;
        loop {
            match timeout_at(deadline, pipeline.discoverers.join_next()).await {
                Ok(Some(Ok(report))) => force_stopped.extend(report.force_stopped),
                Ok(Some(Err(e))) => error!("Failed to join with discoverer: {:?}", e),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = pipeline.discoverers.len(),
                        "Discoverers did not stop in time, aborting them"
                    );
                    pipeline.discoverers.abort_all();
                    while pipeline.discoverers.join_next().await.is_some() {}
                    break;
                }
            }
        }

        // Last: the committer applies what was acknowledged meanwhile and
        // writes the final snapshot
        pipeline.committer_cancel.cancel();
        match timeout(self.config.shutdown_timeout, &mut pipeline.committer).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Offset committer failed: {:?}", e);
                self.persist_final();
            }
            Err(_) => {
                warn!("Offset committer did not finish in time, aborting it");
                pipeline.committer.abort();
                self.persist_final();
            }
        }

        force_stopped
    }

    /// Apply acknowledgements queued after the committer exited and persist.
    ///
    /// Used by consumers that keep acknowledging events drained from the
    /// queue after `stop` returned.
    pub fn commit_pending(&self) -> Result<usize> {
        if self.is_running() {
            return Err(Error::Lifecycle {
                state: LifecycleState::Running,
                action: "commit pending acknowledgements",
            });
        }

        let acks = self.ack_rx.drain();
        let applied = acks
            .iter()
            .filter(|ack| self.registry.acknowledge(ack))
            .count();
        self.registry.persist()?;
        Ok(applied)
    }

    fn persist_final(&self) {
        if let Err(e) = self.registry.persist() {
            warn!("Failed to write final registry snapshot: {}", e);
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LifecycleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pipeline(&self) -> MutexGuard<'_, Option<Pipeline>> {
        self.pipeline.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// How long a stopped Tailer's position is kept unmatched: long enough for
/// every group to scan once after the slowest staleness stop.
fn position_retention(groups: &[PatternGroup]) -> Duration {
    let staleness = groups.iter().map(|g| g.staleness_threshold).max();
    let scan = groups.iter().map(|g| g.scan_interval).max();
    staleness.unwrap_or_default() + scan.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> CrawlerConfig {
        CrawlerConfig {
            registry_path: dir.path().join("state").join("registry.json"),
            persist_interval: Duration::from_millis(50),
            shutdown_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    fn group(dir: &TempDir) -> PatternGroup {
        PatternGroup {
            scan_interval: Duration::from_millis(20),
            read_backoff: Duration::from_millis(10),
            ..PatternGroup::new([format!("{}/*.log", dir.path().display())])
        }
    }

    #[test]
    fn test_position_retention_covers_slowest_group() {
        let fast = PatternGroup {
            scan_interval: Duration::from_secs(1),
            staleness_threshold: Duration::from_secs(5),
            ..PatternGroup::new(["/var/log/*.log"])
        };
        let slow = PatternGroup {
            scan_interval: Duration::from_secs(30),
            staleness_threshold: Duration::from_secs(2),
            ..PatternGroup::new(["/srv/*.log"])
        };
        assert_eq!(position_retention(&[fast, slow]), Duration::from_secs(35));
    }

    #[tokio::test]
    async fn test_start_with_no_groups_is_config_error() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(config(&dir)).unwrap();
        let (sink, _events) = bounded_channel::bounded(8);

        let err = supervisor.start(vec![], sink).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(!supervisor.is_running());
        assert_eq!(supervisor.state(), LifecycleState::Idle);
    }

    #[tokio::test]
    async fn test_start_is_fail_closed() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("app.log"), "line\n").unwrap();
        let supervisor = Supervisor::new(config(&dir)).unwrap();
        let (sink, events) = bounded_channel::bounded(8);

        let groups = vec![group(&dir), PatternGroup::new(["/var/log/[".to_string()])];
        let err = supervisor.start(groups, sink).unwrap_err();

        match &err {
            Error::DiscovererInit(groups) => {
                assert_eq!(groups.len(), 1);
                assert_eq!(groups[0].group, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.is_config());
        assert_eq!(supervisor.state(), LifecycleState::Idle);

        // The valid group never ran
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let dir = TempDir::new().unwrap();
        let supervisor = Supervisor::new(config(&dir)).unwrap();
        let (sink, _events) = bounded_channel::bounded(8);

        supervisor.start(vec![group(&dir)], sink.clone()).unwrap();
        assert_eq!(supervisor.state(), LifecycleState::Running);

        let err = supervisor.start(vec![group(&dir)], sink.clone()).unwrap_err();
        assert!(matches!(
            err,
            Error::Lifecycle {
                state: LifecycleState::Running,
                ..
            }
        ));

        assert!(supervisor.stop().await.unwrap().is_empty());
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
        // Stopping again is harmless
        supervisor.stop().await.unwrap();

        // A stopped supervisor can be started again
        supervisor.start(vec![group(&dir)], sink).unwrap();
        assert!(supervisor.is_running());
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_persists_acknowledged_offsets() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "one\ntwo\n").unwrap();

        let cfg = config(&dir);
        let registry_path = cfg.registry_path.clone();
        let supervisor = Supervisor::new(cfg).unwrap();
        let (sink, mut events) = bounded_channel::bounded(8);
        supervisor.start(vec![group(&dir)], sink).unwrap();

        let acks = supervisor.acknowledger();
        for _ in 0..2 {
            let event = timeout(Duration::from_secs(5), events.next())
                .await
                .unwrap()
                .unwrap();
            acks.send(event.ack()).await.unwrap();
        }

        supervisor.stop().await.unwrap();
        assert!(events.is_empty());

        let reopened = Registry::open(&registry_path).unwrap();
        let file_id = FileId::from_path(&log).unwrap();
        assert_eq!(reopened.get_state(file_id).unwrap().offset, 8);
    }

    #[tokio::test]
    async fn test_stop_with_blocked_tailers_is_bounded() {
        let dir = TempDir::new().unwrap();
        let lines: String = (0..100).map(|i| format!("line {i}\n")).collect();
        std::fs::write(dir.path().join("a.log"), &lines).unwrap();
        std::fs::write(dir.path().join("b.log"), &lines).unwrap();

        let supervisor = Supervisor::new(config(&dir)).unwrap();
        // Nobody consumes: every Tailer ends up blocked on the full queue
        let (sink, _events) = bounded_channel::bounded(1);
        supervisor.start(vec![group(&dir)], sink).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let started = std::time::Instant::now();
        timeout(Duration::from_secs(5), supervisor.stop())
            .await
            .unwrap()
            .unwrap();
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(supervisor.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn test_commit_pending_after_stop() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "late\n").unwrap();

        let supervisor = Supervisor::new(config(&dir)).unwrap();
        let (sink, mut events) = bounded_channel::bounded(8);
        supervisor.start(vec![group(&dir)], sink).unwrap();
        let event = timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();

        assert!(supervisor.commit_pending().is_err());
        supervisor.stop().await.unwrap();

        supervisor.acknowledger().send(event.ack()).await.unwrap();
        assert_eq!(supervisor.commit_pending().unwrap(), 1);
        let file_id = FileId::from_path(&log).unwrap();
        assert_eq!(supervisor.registry().get_state(file_id).unwrap().offset, 5);
    }
}
