// SPDX-License-Identifier: Apache-2.0

//! Per-file tailing worker.
//!
//! A Tailer owns one open file handle and the bytes of the line currently
//! being assembled. It reads appended bytes, splits them on the configured
//! terminator and pushes one [`Event`] per complete line onto the shared
//! queue, waiting when the queue is full.
//!
//! State machine: `Starting -> Reading -> {Stopped | Errored}`. The Tailer
//! never restarts itself; truncation, deletion and rotation are detected by
//! the owning Discoverer, which stops or drains the Tailer through its
//! [`TailerControl`].

use std::fmt;
use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use portable_atomic::{AtomicU64, Ordering};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::select;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::{BoundedSender, SendError};
use crate::crawler::config::{PartialLinePolicy, PatternGroup};
use crate::crawler::event::Event;
use crate::crawler::input::{FileId, get_path_from_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailerState {
    Starting,
    Reading,
    Stopped,
    Errored,
}

impl fmt::Display for TailerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TailerState::Starting => "starting",
            TailerState::Reading => "reading",
            TailerState::Stopped => "stopped",
            TailerState::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Read settings taken from the pattern group
#[derive(Debug, Clone)]
pub struct TailerSettings {
    pub line_terminator: u8,
    pub partial_line_policy: PartialLinePolicy,
    pub max_line_size: usize,
    pub read_chunk_size: usize,
    pub read_backoff: Duration,
    pub max_read_backoff: Duration,
    pub max_read_retries: u32,
}

impl From<&PatternGroup> for TailerSettings {
    fn from(group: &PatternGroup) -> Self {
        Self {
            line_terminator: group.line_terminator,
            partial_line_policy: group.partial_line_policy,
            max_line_size: group.max_line_size,
            read_chunk_size: group.read_chunk_size,
            read_backoff: group.read_backoff,
            max_read_backoff: group.max_read_backoff,
            max_read_retries: group.max_read_retries,
        }
    }
}

impl Default for TailerSettings {
    fn default() -> Self {
        Self::from(&PatternGroup::default())
    }
}

/// The Discoverer's side of a running Tailer.
#[derive(Debug)]
pub struct TailerControl {
    stop: CancellationToken,
    drain: CancellationToken,
    path_tx: watch::Sender<PathBuf>,
    read_position: Arc<AtomicU64>,
}

impl TailerControl {
    /// Stop as soon as possible
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Stop once the file has been read to its end
    pub fn drain(&self) {
        self.drain.cancel();
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    /// Tell the Tailer the file now lives at `path`
    pub fn set_path(&self, path: PathBuf) {
        self.path_tx.send_if_modified(|current| {
            if *current != path {
                *current = path;
                true
            } else {
                false
            }
        });
    }

    pub fn path(&self) -> PathBuf {
        self.path_tx.borrow().clone()
    }

    /// Byte position the Tailer has read up to, including bytes of a
    /// line that is not complete yet
    pub fn read_position(&self) -> u64 {
        self.read_position.load(Ordering::Acquire)
    }
}

/// Final outcome of a Tailer
#[derive(Debug, Clone)]
pub struct TailerReport {
    pub file_id: FileId,
    pub path: PathBuf,
    /// Either `Stopped` or `Errored`
    pub state: TailerState,
    /// Position after the last line put on the queue
    pub offset: u64,
    pub generation: u64,
    pub error: Option<String>,
}

pub struct Tailer {
    file_id: FileId,
    path: PathBuf,
    path_rx: watch::Receiver<PathBuf>,
    generation: u64,
    /// Position after the last emitted line
    offset: u64,
    /// Bytes of the line being assembled
    line_buf: Vec<u8>,
    /// Bytes of the current line dropped because of `max_line_size`
    overflow: u64,
    settings: TailerSettings,
    sink: BoundedSender<Event>,
    stop: CancellationToken,
    drain: CancellationToken,
    read_position: Arc<AtomicU64>,
    state: TailerState,
}

impl Tailer {
    /// Build a Tailer starting at `offset` and the control handle for it.
    ///
    /// `parent` is the Discoverer's cancellation token; cancelling it stops
    /// the Tailer like [`TailerControl::stop`].
    pub fn new(
        file_id: FileId,
        path: PathBuf,
        offset: u64,
        generation: u64,
        settings: TailerSettings,
        sink: BoundedSender<Event>,
        parent: &CancellationToken,
    ) -> (Self, TailerControl) {
        let stop = parent.child_token();
        let drain = CancellationToken::new();
        let (path_tx, path_rx) = watch::channel(path.clone());
        let read_position = Arc::new(AtomicU64::new(offset));

        let control = TailerControl {
            stop: stop.clone(),
            drain: drain.clone(),
            path_tx,
            read_position: read_position.clone(),
        };

        let tailer = Self {
            file_id,
            path,
            path_rx,
            generation,
            offset,
            line_buf: Vec::new(),
            overflow: 0,
            settings,
            sink,
            stop,
            drain,
            read_position,
            state: TailerState::Starting,
        };

        (tailer, control)
    }

    pub fn state(&self) -> TailerState {
        self.state
    }

    /// Run until stopped, drained or errored.
    pub async fn run(mut self) -> TailerReport {
        let mut file = match self.open().await {
            Ok(file) => file,
            Err(e) => {
                error!(file_id = %self.file_id, path = ?self.path, "Failed to open file: {}", e);
                return self.report(TailerState::Errored, Some(e.to_string()));
            }
        };

        self.state = TailerState::Reading;
        info!(
            file_id = %self.file_id,
            path = ?self.path,
            offset = self.offset,
            "Tailer started"
        );

        let mut chunk = vec![0u8; self.settings.read_chunk_size];
        let mut failures = 0u32;

        loop {
            if self.stop.is_cancelled() {
                break;
            }

            if self.path_rx.has_changed().unwrap_or(false) {
                self.path = self.path_rx.borrow_and_update().clone();
            }

            match file.read(&mut chunk).await {
                Ok(0) => {
                    failures = 0;
                    if self.drain.is_cancelled() {
                        self.refresh_path(&file);
                        debug!(file_id = %self.file_id, path = ?self.path, "Drained file to EOF");
                        break;
                    }

                    select! {
                        biased;

                        _ = self.stop.cancelled() => {}
                        _ = self.drain.cancelled() => {}
                        _ = tokio::time::sleep(self.settings.read_backoff) => {}
                    }
                }
                Ok(n) => {
                    failures = 0;
                    match self.consume(&chunk[..n]).await {
                        Ok(()) => {}
                        Err(SendError::Disconnected) => {
                            warn!(file_id = %self.file_id, "Event queue closed, stopping tailer");
                            return self.stopped().await;
                        }
                        Err(_) => break,
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.settings.max_read_retries {
                        error!(
                            file_id = %self.file_id,
                            path = ?self.path,
                            attempts = failures,
                            "Giving up reading file: {}",
                            e
                        );
                        return self.report(TailerState::Errored, Some(e.to_string()));
                    }

                    let backoff = self
                        .settings
                        .read_backoff
                        .saturating_mul(failures)
                        .min(self.settings.max_read_backoff);
                    warn!(
                        file_id = %self.file_id,
                        path = ?self.path,
                        attempt = failures,
                        backoff = ?backoff,
                        "Read failed, retrying: {}",
                        e
                    );

                    select! {
                        biased;

                        _ = self.stop.cancelled() => {}
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }

        self.stopped().await
    }

    async fn open(&mut self) -> io::Result<File> {
        let file = File::open(&self.path).await?;
        let mut file = self.verify_identity(file).await?;
        if self.offset > 0 {
            file.seek(SeekFrom::Start(self.offset)).await?;
        }
        Ok(file)
    }

    /// The path may have been rotated since the Discoverer resolved it; the
    /// handle must be the identity this Tailer was started for.
    async fn verify_identity(&self, file: File) -> io::Result<File> {
        let file = file.into_std().await;
        match FileId::from_file(&file) {
            Ok(found) if found != self.file_id => {
                return Err(io::Error::other(format!(
                    "{:?} now holds file {}, expected {}",
                    self.path, found, self.file_id
                )));
            }
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::Unsupported => {}
            Err(e) => return Err(e),
        }
        Ok(File::from_std(file))
    }

    /// Split freshly read bytes into lines and emit every complete one.
    async fn consume(&mut self, bytes: &[u8]) -> Result<(), SendError> {
        let terminator = self.settings.line_terminator;
        let mut start = 0;

        while let Some(pos) = bytes[start..].iter().position(|&b| b == terminator) {
            let end = start + pos;
            self.append(&bytes[start..end]);

            let line_len = self.line_buf.len() as u64 + self.overflow + 1;
            let new_offset = self.offset + line_len;
            let (line, truncated) = self.take_line(true);

            self.emit(line, new_offset, false, truncated).await?;
            self.offset = new_offset;
            start = end + 1;
        }

        self.append(&bytes[start..]);
        let position = self.offset + self.line_buf.len() as u64 + self.overflow;
        self.read_position.store(position, Ordering::Release);
        Ok(())
    }

    fn append(&mut self, bytes: &[u8]) {
        let room = self.settings.max_line_size.saturating_sub(self.line_buf.len());
        let keep = room.min(bytes.len());
        self.line_buf.extend_from_slice(&bytes[..keep]);
        self.overflow += (bytes.len() - keep) as u64;
    }

    /// Take the assembled line and whether it was cut at `max_line_size`
    fn take_line(&mut self, terminated: bool) -> (String, bool) {
        let mut bytes = std::mem::take(&mut self.line_buf);
        let truncated = self.overflow > 0;

        // CRLF endings: the carriage return belongs to the terminator
        if terminated
            && !truncated
            && self.settings.line_terminator == b'\n'
            && bytes.last() == Some(&b'\r')
        {
            bytes.pop();
        }

        if truncated {
            warn!(
                file_id = %self.file_id,
                path = ?self.path,
                max_line_size = self.settings.max_line_size,
                dropped_bytes = self.overflow,
                "Line exceeded max_line_size, emitting it truncated"
            );
        }
        self.overflow = 0;

        let line = match String::from_utf8(bytes) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        (line, truncated)
    }

    async fn emit(
        &self,
        line: String,
        offset: u64,
        partial: bool,
        truncated: bool,
    ) -> Result<(), SendError> {
        let event = Event {
            file_id: self.file_id,
            path: self.path.clone(),
            offset,
            generation: self.generation,
            line,
            partial,
            truncated,
            read_at: Utc::now(),
        };

        self.sink.send_or_cancel(event, &self.stop).await
    }

    /// Apply the partial-line policy and finish in the Stopped state.
    async fn stopped(mut self) -> TailerReport {
        let pending = self.line_buf.len() as u64 + self.overflow;
        if pending > 0 {
            match self.settings.partial_line_policy {
                PartialLinePolicy::Emit => {
                    let offset = self.offset + pending;
                    let (line, truncated) = self.take_line(false);
                    let event = Event {
                        file_id: self.file_id,
                        path: self.path.clone(),
                        offset,
                        generation: self.generation,
                        line,
                        partial: true,
                        truncated,
                        read_at: Utc::now(),
                    };
                    // Stop is already signalled, so only a free slot is used
                    match self.sink.try_send(event) {
                        Ok(()) => self.offset = offset,
                        Err(e) => {
                            warn!(
                                file_id = %self.file_id,
                                "Could not flush partial line ({}), it will be read again on resume",
                                e
                            );
                        }
                    }
                }
                PartialLinePolicy::Discard => {
                    debug!(
                        file_id = %self.file_id,
                        bytes = pending,
                        "Discarding partial line on stop"
                    );
                    self.line_buf.clear();
                    self.overflow = 0;
                }
            }
        }

        info!(file_id = %self.file_id, path = ?self.path, offset = self.offset, "Tailer stopped");
        self.report(TailerState::Stopped, None)
    }

    fn refresh_path(&mut self, file: &File) {
        match get_path_from_file(file) {
            Ok(path) if path != self.path => {
                debug!(file_id = %self.file_id, from = ?self.path, to = ?path, "File moved");
                self.path = path;
            }
            Ok(_) => {}
            Err(e) => debug!(file_id = %self.file_id, "Current path unknown: {}", e),
        }
    }

    fn report(&mut self, state: TailerState, error: Option<String>) -> TailerReport {
        self.state = state;
        TailerReport {
            file_id: self.file_id,
            path: self.path.clone(),
            state,
            offset: self.offset,
            generation: self.generation,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_channel::{self, BoundedReceiver};
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn settings(policy: PartialLinePolicy) -> TailerSettings {
        TailerSettings {
            partial_line_policy: policy,
            read_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn append(path: &std::path::Path, data: &str) {
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    async fn next_event(rx: &mut BoundedReceiver<Event>) -> Event {
        timeout(WAIT, rx.next()).await.unwrap().unwrap()
    }

    fn spawn_tailer(
        path: &std::path::Path,
        offset: u64,
        settings: TailerSettings,
        queue: usize,
    ) -> (
        tokio::task::JoinHandle<TailerReport>,
        TailerControl,
        BoundedReceiver<Event>,
    ) {
        let (tx, rx) = bounded_channel::bounded(queue);
        let file_id = FileId::from_path(path).unwrap();
        let parent = CancellationToken::new();
        let (tailer, control) =
            Tailer::new(file_id, path.to_path_buf(), offset, 0, settings, tx, &parent);
        assert_eq!(tailer.state(), TailerState::Starting);
        (tokio::spawn(tailer.run()), control, rx)
    }

    #[tokio::test]
    async fn test_emits_complete_lines_and_withholds_partial() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "a\nbb\npart").unwrap();

        let (handle, control, mut rx) =
            spawn_tailer(&path, 0, settings(PartialLinePolicy::Discard), 16);

        let first = next_event(&mut rx).await;
        assert_eq!((first.line.as_str(), first.offset), ("a", 2));
        let second = next_event(&mut rx).await;
        assert_eq!((second.line.as_str(), second.offset), ("bb", 5));
        assert!(!second.partial);

        // The unterminated tail is not emitted until its terminator shows up
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.is_empty());
        assert_eq!(control.read_position(), 9);

        append(&path, "ial\n");
        let third = next_event(&mut rx).await;
        assert_eq!((third.line.as_str(), third.offset), ("partial", 13));

        control.stop();
        let report = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(report.state, TailerState::Stopped);
        assert_eq!(report.offset, 13);
    }

    #[tokio::test]
    async fn test_resumes_from_offset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let (handle, control, mut rx) =
            spawn_tailer(&path, 6, settings(PartialLinePolicy::Discard), 16);

        let event = next_event(&mut rx).await;
        assert_eq!(event.line, "second");
        assert_eq!(event.offset, 13);

        control.stop();
        timeout(WAIT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_partial_line_discarded_on_stop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "a\nrest").unwrap();

        let (handle, control, mut rx) =
            spawn_tailer(&path, 0, settings(PartialLinePolicy::Discard), 16);
        assert_eq!(next_event(&mut rx).await.line, "a");

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.stop();
        let report = timeout(WAIT, handle).await.unwrap().unwrap();

        assert_eq!(report.offset, 2);
        assert!(rx.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_partial_line_emitted_on_stop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "a\nrest").unwrap();

        let (handle, control, mut rx) =
            spawn_tailer(&path, 0, settings(PartialLinePolicy::Emit), 16);
        assert_eq!(next_event(&mut rx).await.line, "a");

        tokio::time::sleep(Duration::from_millis(50)).await;
        control.stop();
        let report = timeout(WAIT, handle).await.unwrap().unwrap();

        let partial = rx.try_recv().unwrap();
        assert_eq!(partial.line, "rest");
        assert!(partial.partial);
        assert!(!partial.truncated);
        assert_eq!(partial.offset, 6);
        assert_eq!(report.offset, 6);
    }

    #[tokio::test]
    async fn test_open_failure_is_errored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("gone.log");
        std::fs::write(&path, "x\n").unwrap();
        let file_id = FileId::from_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let (tx, _rx) = bounded_channel::bounded(4);
        let parent = CancellationToken::new();
        let (tailer, _control) =
            Tailer::new(file_id, path, 0, 0, TailerSettings::default(), tx, &parent);

        let report = timeout(WAIT, tailer.run()).await.unwrap();
        assert_eq!(report.state, TailerState::Errored);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_open_rejects_path_holding_another_identity() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old file\n").unwrap();
        let old_id = FileId::from_path(&path).unwrap();

        // Rotated between the scan and the open
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, "new file\n").unwrap();

        let (tx, rx) = bounded_channel::bounded(4);
        let parent = CancellationToken::new();
        let (tailer, _control) = Tailer::new(
            old_id,
            path.clone(),
            0,
            0,
            settings(PartialLinePolicy::Discard),
            tx,
            &parent,
        );

        let report = timeout(WAIT, tailer.run()).await.unwrap();
        assert_eq!(report.state, TailerState::Errored);
        assert!(report.error.unwrap().contains("expected"));
        assert_eq!(report.offset, 0);
        assert!(rx.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_errors_are_retried_then_errored() {
        // Opening a directory works on unix, reading it fails every time
        let dir = TempDir::new().unwrap();
        let unreadable = dir.path().join("dir.log");
        std::fs::create_dir(&unreadable).unwrap();

        let mut s = settings(PartialLinePolicy::Discard);
        s.max_read_retries = 2;
        s.max_read_backoff = Duration::from_millis(15);
        let (handle, _control, rx) = spawn_tailer(&unreadable, 0, s, 4);

        let report = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(report.state, TailerState::Errored);
        assert!(report.error.is_some());
        assert_eq!(report.offset, 0);
        assert!(rx.is_empty());
    }

    #[tokio::test]
    async fn test_stop_while_blocked_on_full_queue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();

        // Queue of one and no consumer: the second send blocks
        let (handle, control, rx) =
            spawn_tailer(&path, 0, settings(PartialLinePolicy::Discard), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handle.is_finished());

        control.stop();
        let report = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(report.state, TailerState::Stopped);
        // Only the line that made it onto the queue counts
        assert_eq!(report.offset, 4);
        assert_eq!(rx.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_drain_stops_at_eof() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "x\ny\n").unwrap();

        let (handle, control, mut rx) =
            spawn_tailer(&path, 0, settings(PartialLinePolicy::Discard), 16);
        control.drain();
        assert!(control.is_draining());

        let report = timeout(WAIT, handle).await.unwrap().unwrap();
        assert_eq!(report.state, TailerState::Stopped);
        assert_eq!(report.offset, 4);
        assert_eq!(next_event(&mut rx).await.line, "x");
        assert_eq!(next_event(&mut rx).await.line, "y");
    }

    #[tokio::test]
    async fn test_crlf_custom_terminator_and_truncation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "win\r\nabcdefghij\n").unwrap();

        let mut s = settings(PartialLinePolicy::Discard);
        s.max_line_size = 4;
        let (handle, control, mut rx) = spawn_tailer(&path, 0, s, 16);

        let crlf = next_event(&mut rx).await;
        assert_eq!(crlf.line, "win");
        assert_eq!(crlf.offset, 5);
        assert!(!crlf.truncated);

        let long = next_event(&mut rx).await;
        assert_eq!(long.line, "abcd");
        assert!(long.truncated);
        assert!(!long.partial);
        // The offset still covers the whole line
        assert_eq!(long.offset, 16);
        control.stop();
        timeout(WAIT, handle).await.unwrap().unwrap();

        let nul_path = dir.path().join("records.bin");
        std::fs::write(&nul_path, "r1\0r2\0").unwrap();
        let mut s = settings(PartialLinePolicy::Discard);
        s.line_terminator = 0;
        let (handle, control, mut rx) = spawn_tailer(&nul_path, 0, s, 16);
        assert_eq!(next_event(&mut rx).await.line, "r1");
        assert_eq!(next_event(&mut rx).await.offset, 6);
        control.stop();
        timeout(WAIT, handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_path_updates_are_applied_to_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "before\n").unwrap();

        let (handle, control, mut rx) =
            spawn_tailer(&path, 0, settings(PartialLinePolicy::Discard), 16);
        assert_eq!(next_event(&mut rx).await.path, path);

        let moved = dir.path().join("app.log.1");
        std::fs::rename(&path, &moved).unwrap();
        control.set_path(moved.clone());
        assert_eq!(control.path(), moved);

        append(&moved, "after\n");
        let event = next_event(&mut rx).await;
        assert_eq!(event.line, "after");
        assert_eq!(event.path, moved);

        control.stop();
        timeout(WAIT, handle).await.unwrap().unwrap();
    }
}
