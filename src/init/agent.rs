// SPDX-License-Identifier: Apache-2.0

use std::io::Write;
use std::time::Duration;

use tokio::select;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedReceiver, BoundedSender, bounded};
use crate::crawler::{self, Acknowledgement, Event, FailureKind, Supervisor};
use crate::init::BoxError;
use crate::init::args::CrawlArgs;
use crate::init::wait;

/// Time the output gets to write out the remaining queue after the
/// supervisor stopped
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval for committing acknowledgements that arrive after stop
const LATE_COMMIT_INTERVAL: Duration = Duration::from_millis(100);

pub struct Agent {
    args: Box<CrawlArgs>,
}

impl Agent {
    pub fn new(args: Box<CrawlArgs>) -> Self {
        Self { args }
    }

    /// Run the crawler, writing events to stdout, until cancelled.
    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        self.run_with_output(agent_cancel, std::io::stdout()).await
    }

    async fn run_with_output<W>(
        self,
        agent_cancel: CancellationToken,
        output: W,
    ) -> Result<(), BoxError>
    where
        W: Write + Send + 'static,
    {
        let args = self.args;
        info!("Starting logcrawl.");

        let supervisor = Supervisor::new(args.build_config())?;
        let (events_tx, events_rx) = bounded(args.event_queue_size);
        supervisor.start(args.build_groups(), events_tx)?;

        let mut output_task_set = JoinSet::new();
        {
            let acks = supervisor.acknowledger();
            output_task_set.spawn(async move { write_events(events_rx, acks, output).await });
        }

        let mut failures = supervisor.failures();
        let mut result = Ok(());
        loop {
            select! {
                _ = agent_cancel.cancelled() => {
                    debug!("Agent cancellation signaled.");
                    break;
                },
                Some(report) = failures.next() => {
                    match report.kind {
                        FailureKind::ScanFailed => warn!(
                            group = ?report.group,
                            "Scan failure: {}",
                            report.message
                        ),
                        _ => error!(
                            group = ?report.group,
                            file_id = ?report.file_id,
                            path = ?report.path,
                            kind = ?report.kind,
                            "Crawler failure: {}",
                            report.message
                        ),
                    }
                },
                e = wait::wait_for_any_task(&mut output_task_set) => {
                    match e {
                        Ok(()) => warn!("Unexpected early exit of output."),
                        Err(e) => result = Err(e),
                    }
                    break;
                },
            }
        }

        let force_stopped = supervisor.stop().await?;
        if !force_stopped.is_empty() {
            warn!(count = force_stopped.len(), "Tailers were force-stopped during shutdown");
        }

        // Every Tailer is gone, so the queue closes once the output drained it
        let drain_deadline = Instant::now() + OUTPUT_DRAIN_TIMEOUT;
        let mut commit_interval = tokio::time::interval(LATE_COMMIT_INTERVAL);
        while !output_task_set.is_empty() {
            select! {
                e = wait::wait_for_any_task(&mut output_task_set) => {
                    if let Err(e) = e {
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                },
                _ = commit_interval.tick() => {
                    if let Err(e) = supervisor.commit_pending() {
                        warn!("Failed to commit late acknowledgements: {}", e);
                    }
                },
                _ = tokio::time::sleep_until(drain_deadline) => {
                    warn!("Output did not drain in time, remaining events will be read again on restart");
                    output_task_set.abort_all();
                    break;
                },
            }
        }

        let applied = supervisor.commit_pending()?;
        debug!(applied, "Committed final acknowledgements");
        info!("Logcrawl stopped.");

        result
    }
}

/// Write each event as one JSON line and acknowledge it once written.
pub async fn write_events<W: Write>(
    mut events: BoundedReceiver<Event>,
    acks: BoundedSender<Acknowledgement>,
    mut out: W,
) -> Result<(), BoxError> {
    while let Some(event) = events.next().await {
        serde_json::to_writer(&mut out, &event)?;
        out.write_all(b"\n")?;
        out.flush()?;

        if acks.send(event.ack()).await.is_err() {
            return Err(crawler::Error::ChannelSend.into());
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::FileId;
    use crate::init::args::LineTerminatorArg;
    use chrono::Utc;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn event(offset: u64, line: &str) -> Event {
        Event {
            file_id: FileId::new(1, 2),
            path: PathBuf::from("/var/log/app.log"),
            offset,
            generation: 0,
            line: line.to_string(),
            partial: false,
            truncated: false,
            read_at: Utc::now(),
        }
    }

    fn args(paths: &str, registry: PathBuf) -> Box<CrawlArgs> {
        Box::new(CrawlArgs {
            paths: vec![paths.to_string()],
            exclude: vec![],
            scan_interval_ms: 20,
            staleness_threshold_ms: 60_000,
            ignore_older_ms: None,
            partial_line_policy: Default::default(),
            line_terminator: LineTerminatorArg::Newline,
            max_line_size: 65536,
            read_chunk_size: 65536,
            read_backoff_ms: 10,
            max_read_backoff_ms: 100,
            max_read_retries: 5,
            fingerprint_size: 1000,
            registry_path: registry,
            persist_interval_ms: 50,
            shutdown_timeout_ms: 1000,
            max_persist_failure_duration_ms: 60_000,
            event_queue_size: 16,
            ack_channel_size: 16,
            failure_channel_size: 16,
        })
    }

    #[tokio::test]
    async fn test_write_events_writes_json_lines_and_acks() {
        let (events_tx, events_rx) = bounded(4);
        let (acks_tx, acks_rx) = bounded(4);

        events_tx.send(event(6, "hello")).await.unwrap();
        events_tx.send(event(12, "world")).await.unwrap();
        drop(events_tx);

        let mut out = Vec::new();
        write_events(events_rx, acks_tx, &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["line"], "hello");
        assert_eq!(lines[1]["offset"], 12);

        let acks = acks_rx.drain();
        assert_eq!(acks.iter().map(|a| a.offset).collect::<Vec<_>>(), vec![6, 12]);
    }

    #[tokio::test]
    async fn test_run_fails_on_invalid_patterns() {
        let dir = TempDir::new().unwrap();
        let agent = Agent::new(args("/var/log/[", dir.path().join("registry.json")));

        let res = agent
            .run_with_output(CancellationToken::new(), std::io::sink())
            .await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_run_commits_written_events_on_cancel() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("app.log");
        std::fs::write(&log, "one\ntwo\n").unwrap();
        let registry_path = dir.path().join("registry.json");

        let agent = Agent::new(args(
            &format!("{}/*.log", dir.path().display()),
            registry_path.clone(),
        ));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { agent.run_with_output(cancel, std::io::sink()).await }
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let registry = crate::crawler::Registry::open(&registry_path).unwrap();
        let file_id = FileId::from_path(&log).unwrap();
        assert_eq!(registry.get_state(file_id).unwrap().offset, 8);
    }
}
