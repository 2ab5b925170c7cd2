// SPDX-License-Identifier: Apache-2.0

//! Acknowledgement stage of the crawler.
//!
//! The consumer of the event queue sends an [`Acknowledgement`] once events
//! are durably delivered. The committer applies them to the [`Registry`] and
//! persists the registry periodically. Tailers never write offsets
//! themselves: a crash between reading and acknowledging leads to re-reading,
//! never to loss.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::crawler::event::{Acknowledgement, FailureKind, FailureReport};
use crate::crawler::registry::Registry;

/// Configuration for the offset committer
#[derive(Debug, Clone)]
pub struct OffsetCommitterConfig {
    /// Interval between registry snapshots
    pub persist_interval: Duration,
    /// Maximum time to keep accepting acknowledgements during shutdown
    pub drain_timeout: Duration,
    /// How long persist failures may continue before they are reported
    pub max_persist_failure_duration: Duration,
}

impl Default for OffsetCommitterConfig {
    fn default() -> Self {
        Self {
            persist_interval: Duration::from_secs(1),
            drain_timeout: Duration::from_secs(1),
            max_persist_failure_duration: Duration::from_secs(60),
        }
    }
}

/// Applies acknowledgements to the registry and persists it.
pub struct FileOffsetCommitter {
    ack_receiver: BoundedReceiver<Acknowledgement>,
    registry: Arc<Registry>,
    config: OffsetCommitterConfig,
    failures: BoundedSender<FailureReport>,
    /// When the current run of persist failures started
    persist_first_failure: Option<Instant>,
    /// Whether the current run of failures was already reported
    failure_reported: bool,
}

impl FileOffsetCommitter {
    pub fn new(
        ack_receiver: BoundedReceiver<Acknowledgement>,
        registry: Arc<Registry>,
        config: OffsetCommitterConfig,
        failures: BoundedSender<FailureReport>,
    ) -> Self {
        Self {
            ack_receiver,
            registry,
            config,
            failures,
            persist_first_failure: None,
            failure_reported: false,
        }
    }

    /// Run until cancelled, then drain pending acknowledgements and persist
    /// a final snapshot.
    pub async fn run(&mut self, cancel: CancellationToken) {
        info!("Offset committer started");

        let mut persist_interval = tokio::time::interval(self.config.persist_interval);
        persist_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Offset committer cancelled, draining pending acknowledgements");
                    break;
                }

                _ = persist_interval.tick() => {
                    self.maybe_persist();
                }

                ack = self.ack_receiver.next() => {
                    match ack {
                        Some(ack) => self.process_ack(ack),
                        None => {
                            debug!("Ack channel closed, exiting offset committer run loop");
                            break;
                        }
                    }
                }
            }
        }

        self.drain().await;
    }

    fn process_ack(&self, ack: Acknowledgement) {
        if self.registry.acknowledge(&ack) {
            debug!(
                file_id = %ack.file_id,
                offset = ack.offset,
                "Offset acknowledged"
            );
        }
    }

    /// Take whatever is queued, keep accepting acks while they keep coming
    /// (bounded by the drain timeout), then write the final snapshot.
    async fn drain(&mut self) {
        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        let mut ack_count = 0usize;

        for ack in self.ack_receiver.drain() {
            self.process_ack(ack);
            ack_count += 1;
        }

        loop {
            let window = tokio::time::Instant::now() + Duration::from_millis(100);
            match tokio::time::timeout_at(window.min(deadline), self.ack_receiver.next()).await {
                Ok(Some(ack)) => {
                    self.process_ack(ack);
                    ack_count += 1;
                }
                // Channel closed or quiet
                Ok(None) | Err(_) => break,
            }
        }

        if ack_count > 0 {
            info!("Drained {} pending acknowledgements", ack_count);
        }

        match self.registry.persist() {
            Ok(()) => info!("Final registry snapshot written"),
            Err(e) => warn!("Failed to write final registry snapshot: {}", e),
        }
    }

    /// Persist and track failures; failures lasting longer than the
    /// configured threshold are reported once per failure run.
    fn maybe_persist(&mut self) {
        match self.registry.persist() {
            Ok(()) => {
                if self.persist_first_failure.take().is_some() {
                    info!("Registry persist succeeded after previous failures");
                }
                self.failure_reported = false;
            }
            Err(e) => {
                let first_failure = *self.persist_first_failure.get_or_insert_with(Instant::now);
                let failure_duration = first_failure.elapsed();

                warn!(
                    "Registry persist failed (failures started {:?} ago): {}",
                    failure_duration, e
                );

                if failure_duration >= self.config.max_persist_failure_duration
                    && !self.failure_reported
                {
                    error!(
                        "Registry persist failures persisted for {:?}",
                        failure_duration
                    );
                    let report = FailureReport {
                        group: None,
                        file_id: None,
                        path: self.registry.path().map(|p| p.to_path_buf()),
                        kind: FailureKind::PersistFailed,
                        message: e.to_string(),
                    };
                    if self.failures.try_send(report).is_err() {
                        warn!("Failure channel full or closed, dropping persist failure report");
                    }
                    self.failure_reported = true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel;
    use crate::crawler::input::FileId;
    use std::path::Path;
    use tempfile::TempDir;

    fn ack(offset: u64) -> Acknowledgement {
        Acknowledgement {
            file_id: FileId::new(1, 1),
            generation: 0,
            offset,
        }
    }

    #[tokio::test]
    async fn test_acks_are_applied_and_persisted_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Arc::new(Registry::open(&path).unwrap());
        registry.get_or_create(FileId::new(1, 1), Path::new("/a"), None);

        let (ack_tx, ack_rx) = bounded_channel::bounded(16);
        let (failures_tx, _failures_rx) = bounded_channel::bounded(4);
        let config = OffsetCommitterConfig {
            persist_interval: Duration::from_secs(3600),
            ..Default::default()
        };
        let mut committer = FileOffsetCommitter::new(ack_rx, registry.clone(), config, failures_tx);

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { committer.run(cancel).await }
        });

        ack_tx.send(ack(10)).await.unwrap();
        ack_tx.send(ack(25)).await.unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(registry.get_state(FileId::new(1, 1)).unwrap().offset, 25);

        let reopened = Registry::open(&path).unwrap();
        assert_eq!(reopened.get_state(FileId::new(1, 1)).unwrap().offset, 25);
    }

    #[tokio::test]
    async fn test_persist_failure_is_reported_after_threshold() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Arc::new(Registry::open(&path).unwrap());
        registry.get_or_create(FileId::new(1, 1), Path::new("/a"), None);

        // Occupy the snapshot path with a non-empty directory so renames fail
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupied"), "x").unwrap();

        let (_ack_tx, ack_rx) = bounded_channel::bounded(16);
        let (failures_tx, failures_rx) = bounded_channel::bounded(4);
        let config = OffsetCommitterConfig {
            max_persist_failure_duration: Duration::ZERO,
            ..Default::default()
        };
        let mut committer = FileOffsetCommitter::new(ack_rx, registry.clone(), config, failures_tx);

        committer.maybe_persist();
        committer.maybe_persist();

        // Reported once for the whole failure run
        let reports = failures_rx.drain();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].kind, FailureKind::PersistFailed);

        // Recovery resets the tracking
        std::fs::remove_dir_all(&path).unwrap();
        committer.maybe_persist();
        assert!(committer.persist_first_failure.is_none());
        assert!(path.is_file());
    }
}
