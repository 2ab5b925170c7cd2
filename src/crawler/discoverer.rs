// SPDX-License-Identifier: Apache-2.0

//! Per-group file discovery.
//!
//! A Discoverer resolves its group's glob patterns on every scan tick and
//! reconciles the result with the Tailers it owns:
//!
//! - identities seen for the first time get a Tailer, resuming from the
//!   Registry offset when one is known
//! - an identity whose path vanished for longer than the staleness
//!   threshold is stopped
//! - an identity whose size dropped below what its Tailer has read is
//!   restarted from offset 0 under a new generation
//! - an identity whose path now holds a different file is drained to EOF
//!   and stopped, unless the patterns still match it somewhere else
//! - an identity whose leading bytes no longer match its recorded
//!   fingerprint holds new content (inode reuse, rewrite in place) and is
//!   read again from offset 0 under a new generation
//!
//! Blocking filesystem work (glob expansion, stat, fingerprint reads) runs on
//! the blocking pool.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use tokio::select;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::{MissedTickBehavior, timeout_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedSender;
use crate::crawler::config::PatternGroup;
use crate::crawler::error::Result;
use crate::crawler::event::{Event, FailureKind, FailureReport};
use crate::crawler::input::{FileFinder, FileId, Fingerprint, ResolvedFile};
use crate::crawler::registry::Registry;
use crate::crawler::tailer::{Tailer, TailerControl, TailerReport, TailerSettings, TailerState};

/// Identities with a live Tailer, shared by every Discoverer of a
/// Supervisor so overlapping groups never tail the same file twice.
#[derive(Debug, Clone, Default)]
pub struct IdentityClaims {
    inner: Arc<Mutex<HashSet<FileId>>>,
}

impl IdentityClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `file_id`; false when it is already claimed
    pub fn try_claim(&self, file_id: FileId) -> bool {
        self.lock().insert(file_id)
    }

    pub fn release(&self, file_id: FileId) {
        self.lock().remove(&file_id);
    }

    pub fn is_claimed(&self, file_id: FileId) -> bool {
        self.lock().contains(&file_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<FileId>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
struct SessionPosition {
    offset: u64,
    generation: u64,
    last_seen: Instant,
}

/// Where stopped Tailers left off during this session.
///
/// Shared by every Discoverer of a Supervisor: when a drained file shows up
/// under another group's patterns, that group resumes after the lines
/// already queued instead of at the lagging acknowledged offset. Entries no
/// group has matched for `retention` are pruned.
#[derive(Debug, Clone)]
pub struct SessionPositions {
    inner: Arc<Mutex<HashMap<FileId, SessionPosition>>>,
    retention: Duration,
}

impl SessionPositions {
    pub fn new(retention: Duration) -> Self {
        Self {
            inner: Arc::default(),
            retention,
        }
    }

    /// Remember where the Tailer of `file_id` stopped
    pub fn record(&self, file_id: FileId, offset: u64, generation: u64) {
        self.lock().insert(
            file_id,
            SessionPosition {
                offset,
                generation,
                last_seen: Instant::now(),
            },
        );
    }

    /// Take the position of `file_id` as `(offset, generation)`
    pub fn take(&self, file_id: FileId) -> Option<(u64, u64)> {
        self.lock()
            .remove(&file_id)
            .map(|p| (p.offset, p.generation))
    }

    pub fn forget(&self, file_id: FileId) {
        self.lock().remove(&file_id);
    }

    /// Mark identities a scan still matched
    pub fn touch<'a>(&self, file_ids: impl IntoIterator<Item = &'a FileId>) {
        let now = Instant::now();
        let mut positions = self.lock();
        for file_id in file_ids {
            if let Some(position) = positions.get_mut(file_id) {
                position.last_seen = now;
            }
        }
    }

    /// Drop positions not matched for longer than the retention; returns
    /// how many were dropped.
    pub fn prune(&self) -> usize {
        let mut positions = self.lock();
        let before = positions.len();
        positions.retain(|_, p| p.last_seen.elapsed() <= self.retention);
        before - positions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FileId, SessionPosition>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Outcome of a Discoverer run
#[derive(Debug, Clone, Default)]
pub struct DiscovererReport {
    pub group: usize,
    /// Identities whose Tailers did not stop before the shutdown deadline
    pub force_stopped: Vec<FileId>,
}

/// What a stat of an active Tailer's last path found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PathStat {
    Present { len: u64, modified: Option<SystemTime> },
    Replaced { by: FileId },
    Missing,
}

/// Leading bytes of a matched file, read during the scan
#[derive(Debug, Clone)]
enum Content {
    Read(Fingerprint),
    /// The path could not be read or now holds another identity
    Unreadable,
}

struct ScanResult {
    resolved: Vec<ResolvedFile>,
    stats: HashMap<FileId, PathStat>,
    /// Only for files that may get a Tailer and for active files whose
    /// fingerprint is still growing
    contents: HashMap<FileId, Content>,
}

/// What the blocking scan needs to decide which files to fingerprint
struct ScanInput {
    finder: FileFinder,
    to_stat: Vec<(FileId, PathBuf)>,
    /// Active identities with the length of their recorded fingerprint
    active: HashMap<FileId, usize>,
    claims: IdentityClaims,
    ignored: HashSet<FileId>,
    fingerprint_size: usize,
}

struct ActiveTailer {
    control: TailerControl,
    path: PathBuf,
    missing_since: Option<Instant>,
    stop_requested: bool,
    /// Restart from offset 0 once the current Tailer has exited
    restart: bool,
}

pub struct Discoverer {
    index: usize,
    group: PatternGroup,
    finder: FileFinder,
    settings: TailerSettings,
    registry: Arc<Registry>,
    claims: IdentityClaims,
    sink: BoundedSender<Event>,
    failures: BoundedSender<FailureReport>,
    active: HashMap<FileId, ActiveTailer>,
    tailers: JoinSet<TailerReport>,
    task_ids: HashMap<Id, FileId>,
    positions: SessionPositions,
    /// Unknown files skipped by `ignore_older`
    ignored: HashSet<FileId>,
    shutting_down: bool,
}

impl Discoverer {
    /// Validate the group and compile its patterns. No I/O happens here.
    pub fn new(
        index: usize,
        group: PatternGroup,
        registry: Arc<Registry>,
        claims: IdentityClaims,
        positions: SessionPositions,
        sink: BoundedSender<Event>,
        failures: BoundedSender<FailureReport>,
    ) -> Result<Self> {
        group.validate()?;
        let finder = FileFinder::new(group.paths.clone(), group.exclude.clone())?;
        let settings = TailerSettings::from(&group);

        Ok(Self {
            index,
            group,
            finder,
            settings,
            registry,
            claims,
            sink,
            failures,
            active: HashMap::new(),
            tailers: JoinSet::new(),
            task_ids: HashMap::new(),
            positions,
            ignored: HashSet::new(),
            shutting_down: false,
        })
    }

    pub fn group(&self) -> &PatternGroup {
        &self.group
    }

    /// Scan until cancelled, then stop every Tailer, waiting at most
    /// `shutdown_timeout` before aborting the rest.
    pub async fn run(
        mut self,
        cancel: CancellationToken,
        shutdown_timeout: Duration,
    ) -> DiscovererReport {
        info!(
            group = self.index,
            paths = ?self.group.paths,
            exclude = ?self.group.exclude,
            scan_interval = ?self.group.scan_interval,
            "Discoverer started"
        );

        let mut scan_interval = tokio::time::interval(self.group.scan_interval);
        scan_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = self.tailers.join_next_with_id(), if !self.tailers.is_empty() => {
                    self.on_tailer_exit(joined, &cancel);
                }

                _ = scan_interval.tick() => {
                    self.scan(&cancel).await;
                }
            }
        }

        self.shutdown(shutdown_timeout).await
    }

    async fn scan(&mut self, cancel: &CancellationToken) {
        // Read positions are sampled before the stat so growth during the
        // scan is never mistaken for truncation
        let sampled: Vec<(FileId, PathBuf, u64)> = self
            .active
            .iter()
            .map(|(id, a)| (*id, a.path.clone(), a.control.read_position()))
            .collect();

        let input = ScanInput {
            finder: self.finder.clone(),
            to_stat: sampled
                .iter()
                .map(|(id, path, _)| (*id, path.clone()))
                .collect(),
            active: sampled
                .iter()
                .map(|(id, _, _)| {
                    let recorded = self
                        .registry
                        .get_state(*id)
                        .map_or(0, |s| s.fingerprint.len());
                    (*id, recorded)
                })
                .collect(),
            claims: self.claims.clone(),
            ignored: self.ignored.clone(),
            fingerprint_size: self.group.fingerprint_size,
        };
        let task = tokio::task::spawn_blocking(move || scan_blocking(input));

        let result = select! {
            biased;

            _ = cancel.cancelled() => return,
            r = task => r,
        };

        let scan = match result {
            Ok(Ok(scan)) => scan,
            Ok(Err(e)) => {
                self.report_failure(FailureKind::ScanFailed, None, None, e.to_string());
                return;
            }
            Err(e) => {
                self.report_failure(FailureKind::ScanFailed, None, None, e.to_string());
                return;
            }
        };

        let by_id: HashMap<FileId, &ResolvedFile> =
            scan.resolved.iter().map(|f| (f.file_id, f)).collect();

        for (file_id, _, read_position) in sampled {
            if let Some(file) = by_id.get(&file_id) {
                let fingerprint = match scan.contents.get(&file_id) {
                    Some(Content::Read(fingerprint)) => Some(fingerprint),
                    _ => None,
                };
                self.on_present(
                    file_id,
                    Some(&file.path),
                    file.len,
                    file.modified,
                    read_position,
                    fingerprint,
                );
                continue;
            }

            match scan.stats.get(&file_id).copied().unwrap_or(PathStat::Missing) {
                PathStat::Present { len, modified } => {
                    self.on_present(file_id, None, len, modified, read_position, None)
                }
                PathStat::Replaced { by } => self.on_replaced(file_id, by),
                PathStat::Missing => self.on_missing(file_id),
            }
        }

        for file in &scan.resolved {
            if !self.active.contains_key(&file.file_id) {
                self.start_tailer(file, scan.contents.get(&file.file_id), cancel);
            }
        }

        self.ignored.retain(|id| by_id.contains_key(id));
        self.positions.touch(by_id.keys());
        let pruned = self.positions.prune();
        if pruned > 0 {
            debug!(group = self.index, pruned, "Forgot positions of files no longer seen");
        }
    }

    /// The identity is still on disk, at `moved_to` when the patterns
    /// matched it at a new path.
    fn on_present(
        &mut self,
        file_id: FileId,
        moved_to: Option<&PathBuf>,
        len: u64,
        modified: Option<SystemTime>,
        read_position: u64,
        fingerprint: Option<&Fingerprint>,
    ) {
        let Some(active) = self.active.get_mut(&file_id) else {
            return;
        };
        if active.restart || active.stop_requested {
            return;
        }
        active.missing_since = None;

        if let Some(path) = moved_to {
            if *path != active.path {
                info!(
                    group = self.index,
                    file_id = %file_id,
                    from = ?active.path,
                    to = ?path,
                    "File renamed within patterns, tailer follows it"
                );
                active.path = path.clone();
                active.control.set_path(path.clone());
            }
        }
        self.registry.observe(file_id, &active.path, modified);

        if len < read_position {
            info!(
                group = self.index,
                file_id = %file_id,
                path = ?active.path,
                size = len,
                read_position,
                "File truncated, restarting from offset 0"
            );
            active.restart = true;
            active.control.stop();
            return;
        }

        if let Some(current) = fingerprint {
            let recorded = self
                .registry
                .get_state(file_id)
                .map(|s| s.fingerprint)
                .unwrap_or_default();
            if !recorded.matches(current) {
                info!(
                    group = self.index,
                    file_id = %file_id,
                    path = ?active.path,
                    "File content rewritten in place, restarting from offset 0"
                );
                active.restart = true;
                active.control.stop();
                return;
            }
            self.registry.record_fingerprint(file_id, current);
        }
    }

    fn on_replaced(&mut self, file_id: FileId, by: FileId) {
        let Some(active) = self.active.get_mut(&file_id) else {
            return;
        };
        if active.restart || active.stop_requested || active.control.is_draining() {
            return;
        }

        info!(
            group = self.index,
            file_id = %file_id,
            replaced_by = %by,
            path = ?active.path,
            "File rotated, draining previous file"
        );
        active.control.drain();
    }

    fn on_missing(&mut self, file_id: FileId) {
        let staleness = self.group.staleness_threshold;
        let Some(active) = self.active.get_mut(&file_id) else {
            return;
        };
        if active.restart || active.stop_requested {
            return;
        }

        let since = *active.missing_since.get_or_insert_with(Instant::now);
        if since.elapsed() >= staleness {
            info!(
                group = self.index,
                file_id = %file_id,
                path = ?active.path,
                missing_for = ?since.elapsed(),
                "File missing past staleness threshold, stopping tailer"
            );
            active.stop_requested = true;
            active.control.stop();
        }
    }

    fn start_tailer(
        &mut self,
        file: &ResolvedFile,
        content: Option<&Content>,
        cancel: &CancellationToken,
    ) {
        let file_id = file.file_id;
        let known = self.registry.get_state(file_id);

        if known.is_none() && self.is_too_old(file) {
            if self.ignored.insert(file_id) {
                debug!(
                    group = self.index,
                    file_id = %file_id,
                    path = ?file.path,
                    "Ignoring file older than ignore_older"
                );
            }
            return;
        }
        self.ignored.remove(&file_id);

        // Claimed elsewhere or ignored while the scan ran; the next scan
        // reads its fingerprint
        let Some(content) = content else {
            debug!(
                group = self.index,
                file_id = %file_id,
                path = ?file.path,
                "File not fingerprinted yet, deferring"
            );
            return;
        };

        if !self.claims.try_claim(file_id) {
            debug!(
                group = self.index,
                file_id = %file_id,
                path = ?file.path,
                "File already tailed by another discoverer"
            );
            return;
        }

        let state = match known {
            Some(state) => state,
            None => self
                .registry
                .get_or_create(file_id, &file.path, file.modified),
        };
        self.registry.observe(file_id, &file.path, file.modified);

        let mut generation = state.generation;
        let mut offset = state.offset;

        if let Content::Read(current) = content {
            if !state.fingerprint.matches(current) {
                info!(
                    group = self.index,
                    file_id = %file_id,
                    path = ?file.path,
                    offset,
                    "Identity reused by new content, restarting from offset 0"
                );
                generation = self.registry.reset_offset(file_id);
                offset = 0;
                self.positions.forget(file_id);
            }
        }

        if let Some((position, position_generation)) = self.positions.take(file_id) {
            if position_generation == generation {
                offset = offset.max(position);
            }
        }

        if offset > file.len {
            info!(
                group = self.index,
                file_id = %file_id,
                path = ?file.path,
                size = file.len,
                offset,
                "File shrank while not tailed, restarting from offset 0"
            );
            generation = self.registry.reset_offset(file_id);
            offset = 0;
        }

        if let Content::Read(current) = content {
            self.registry.record_fingerprint(file_id, current);
        }

        if offset > 0 {
            info!(group = self.index, file_id = %file_id, path = ?file.path, offset, "Resuming file");
        } else {
            info!(group = self.index, file_id = %file_id, path = ?file.path, "Tailing new file");
        }

        self.spawn_tailer(file_id, file.path.clone(), offset, generation, cancel);
    }

    fn is_too_old(&self, file: &ResolvedFile) -> bool {
        let (Some(max_age), Some(modified)) = (self.group.ignore_older, file.modified) else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age > max_age)
            .unwrap_or(false)
    }

    fn spawn_tailer(
        &mut self,
        file_id: FileId,
        path: PathBuf,
        offset: u64,
        generation: u64,
        cancel: &CancellationToken,
    ) {
        let (tailer, control) = Tailer::new(
            file_id,
            path.clone(),
            offset,
            generation,
            self.settings.clone(),
            self.sink.clone(),
            cancel,
        );

        let handle = self.tailers.spawn(tailer.run());
        self.task_ids.insert(handle.id(), file_id);
        self.active.insert(
            file_id,
            ActiveTailer {
                control,
                path,
                missing_since: None,
                stop_requested: false,
                restart: false,
            },
        );
    }

    fn on_tailer_exit(
        &mut self,
        joined: std::result::Result<(Id, TailerReport), JoinError>,
        cancel: &CancellationToken,
    ) {
        let (file_id, report) = match joined {
            Ok((id, report)) => {
                self.task_ids.remove(&id);
                (report.file_id, Some(report))
            }
            Err(e) => {
                let Some(file_id) = self.task_ids.remove(&e.id()) else {
                    error!(group = self.index, "Unknown tailer task failed: {}", e);
                    return;
                };
                error!(group = self.index, file_id = %file_id, "Tailer task failed: {}", e);
                (file_id, None)
            }
        };

        let Some(active) = self.active.remove(&file_id) else {
            return;
        };

        let errored = match &report {
            Some(r) => r.state == TailerState::Errored,
            None => true,
        };

        if active.restart && !self.shutting_down && !cancel.is_cancelled() {
            let generation = self.registry.reset_offset(file_id);
            debug!(
                group = self.index,
                file_id = %file_id,
                generation,
                "Previous tailer exited, starting over"
            );
            // The claim is kept across the restart
            self.spawn_tailer(file_id, active.path, 0, generation, cancel);
            return;
        }

        self.claims.release(file_id);

        match report {
            Some(report) if !errored => {
                self.registry.observe(file_id, &report.path, None);
                self.positions
                    .record(file_id, report.offset, report.generation);
            }
            Some(report) => {
                let message = report.error.unwrap_or_else(|| "tailer errored".to_string());
                self.report_failure(
                    FailureKind::TailerErrored,
                    Some(file_id),
                    Some(report.path),
                    message,
                );
            }
            None => {
                self.report_failure(
                    FailureKind::TailerErrored,
                    Some(file_id),
                    Some(active.path),
                    "tailer task failed".to_string(),
                );
            }
        }
    }

    async fn shutdown(mut self, timeout: Duration) -> DiscovererReport {
        self.shutting_down = true;
        let deadline = tokio::time::Instant::now() + timeout;

        for active in self.active.values() {
            active.control.stop();
        }

        let never = CancellationToken::new();
        let mut force_stopped = Vec::new();
        loop {
            match timeout_at(deadline, self.tailers.join_next_with_id()).await {
                Ok(Some(joined)) => self.on_tailer_exit(joined, &never),
                Ok(None) => break,
                Err(_) => {
                    force_stopped = self.active.keys().copied().collect();
                    force_stopped.sort();
                    let identities: Vec<String> =
                        force_stopped.iter().map(ToString::to_string).collect();
                    warn!(
                        group = self.index,
                        identities = ?identities,
                        "Tailers did not stop in time, aborting them"
                    );

                    self.tailers.abort_all();
                    while self.tailers.join_next().await.is_some() {}
                    for file_id in self.active.drain().map(|(id, _)| id) {
                        self.claims.release(file_id);
                    }
                    self.task_ids.clear();
                    break;
                }
            }
        }

        info!(group = self.index, "Discoverer stopped");
        DiscovererReport {
            group: self.index,
            force_stopped,
        }
    }

    fn report_failure(
        &self,
        kind: FailureKind,
        file_id: Option<FileId>,
        path: Option<PathBuf>,
        message: String,
    ) {
        match kind {
            FailureKind::ScanFailed => {
                warn!(group = self.index, "Scan failed: {}", message)
            }
            _ => error!(
                group = self.index,
                file_id = ?file_id,
                path = ?path,
                kind = ?kind,
                "{}",
                message
            ),
        }

        let report = FailureReport {
            group: Some(self.index),
            file_id,
            path,
            kind,
            message,
        };
        if self.failures.try_send(report).is_err() {
            warn!(group = self.index, "Failure channel full or closed, dropping report");
        }
    }
}

fn scan_blocking(input: ScanInput) -> Result<ScanResult> {
    let resolved = input.finder.resolve()?;
    let matched: HashSet<FileId> = resolved.iter().map(|f| f.file_id).collect();

    let mut contents = HashMap::new();
    for file in &resolved {
        let wanted = match input.active.get(&file.file_id) {
            Some(&recorded) => {
                recorded < input.fingerprint_size && (recorded as u64) < file.len
            }
            None => {
                !input.claims.is_claimed(file.file_id) && !input.ignored.contains(&file.file_id)
            }
        };
        if !wanted {
            continue;
        }

        let content = match Fingerprint::from_path(&file.path, file.file_id, input.fingerprint_size)
        {
            Ok(Some(fingerprint)) => Content::Read(fingerprint),
            Ok(None) => Content::Unreadable,
            Err(e) => {
                debug!(path = ?file.path, "Could not read fingerprint: {}", e);
                Content::Unreadable
            }
        };
        contents.insert(file.file_id, content);
    }

    let stats = input
        .to_stat
        .into_iter()
        .filter(|(id, _)| !matched.contains(id))
        .map(|(id, path)| {
            let stat = match FileId::from_path_with_metadata(&path) {
                Ok((found, metadata)) if found == id => PathStat::Present {
                    len: metadata.len(),
                    modified: metadata.modified().ok(),
                },
                Ok((found, _)) => PathStat::Replaced { by: found },
                Err(_) => PathStat::Missing,
            };
            (id, stat)
        })
        .collect();

    Ok(ScanResult {
        resolved,
        stats,
        contents,
    })
}
