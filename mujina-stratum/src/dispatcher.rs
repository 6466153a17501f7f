//! The dispatcher: the one place that knows what the current job and target
//! are.
//!
//! It takes [`SourceEvent`]s from the job source and [`HashThreadEvent`]s
//! from the worker tasks, both through channels, and handles them one at a
//! time in a single loop. Job and target therefore never change under a
//! validation in progress, and no locks are needed.
//!
//! # Work distribution
//!
//! Every running worker gets the current job with its own slice of the
//! extranonce2 space. Slices come from splitting the job's full range evenly
//! over the running workers, so they only change when a worker starts or
//! fails. A difficulty change re-sends the same slices with the new target,
//! which workers treat as a retarget and keep their position.
//!
//! # Validation
//!
//! Workers report candidates; the dispatcher rebuilds the header from the job
//! it handed out and checks the hash against the target in force when the
//! candidate is validated. Only candidates that clear the pool target become
//! shares. Shares for dummy jobs are counted and dropped.
//!
//! While the pool session is down, candidates for pool jobs are held back.
//! Once a new session is up they are revalidated, which discards them: the
//! new session has a new extranonce1. If the session stays down for the
//! stale-work timeout, workers are idled until new work arrives.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use bitcoin::pow::Target;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{self, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::hash_thread::{
    spawn_worker, Candidate, HashThread, HashThreadEvent, Status, WorkAssignment, WorkerHandle,
    WorkerId,
};
use crate::job_source::{
    Job, JobOrigin, SessionId, Share, ShareOutcome, SourceEvent, SourceHandle,
};
use crate::tracing::prelude::*;
use crate::types::{Difficulty, Extranonce2, HashRate};

/// How often share statistics are logged.
pub const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Jobs kept for validating late candidates after a non-clean job change.
const RECENT_JOBS: usize = 16;

/// Candidates held back while the pool is unreachable.
const MAX_BUFFERED: usize = 256;

const THREAD_EVENT_BUFFER: usize = 256;

/// Why a candidate did not become a share.
///
/// Expected in normal operation; logged at debug level only.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("unknown or superseded job {0}")]
    UnknownJob(String),

    #[error("job {0} belongs to an earlier pool session")]
    StaleSession(String),

    #[error("hash does not meet the share target")]
    AboveTarget,

    #[error("already submitted")]
    Duplicate,

    #[error("malformed candidate: {0}")]
    Malformed(String),
}

/// What identifies one point in a job's search space.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ShareKey {
    extranonce2: Extranonce2,
    ntime: u32,
    nonce: u32,
    version: i32,
}

impl From<&Candidate> for ShareKey {
    fn from(c: &Candidate) -> Self {
        Self {
            extranonce2: c.extranonce2,
            ntime: c.ntime,
            nonce: c.nonce,
            version: c.version.to_consensus(),
        }
    }
}

/// A job whose candidates are still acceptable.
///
/// Owns the keys of shares already submitted for it, so they go away with
/// the job.
struct RecentJob {
    job: Arc<Job>,
    submitted: HashSet<ShareKey>,
}

impl RecentJob {
    fn new(job: Arc<Job>) -> Self {
        Self {
            job,
            submitted: HashSet::new(),
        }
    }

    fn matches(&self, candidate: &Candidate) -> bool {
        self.job.id == candidate.job_id && self.job.session() == candidate.session
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Running,
    Failed,
}

struct Worker {
    handle: WorkerHandle,
    state: WorkerState,
    status: Status,
}

/// Share counters, logged periodically.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ShareStats {
    pub found: u64,
    pub submitted: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub indeterminate: u64,
    pub not_sent: u64,
    pub stale: u64,
    pub duplicate: u64,
    pub below_target: u64,
    pub invalid: u64,
    pub dummy: u64,
}

impl ShareStats {
    fn log(&self, hash_rate: HashRate) {
        info!(
            %hash_rate,
            found = self.found,
            submitted = self.submitted,
            accepted = self.accepted,
            rejected = self.rejected,
            indeterminate = self.indeterminate,
            stale = self.stale,
            duplicate = self.duplicate,
            dummy = self.dummy,
            "Share statistics"
        );
    }
}

pub struct Dispatcher {
    source: SourceHandle,
    source_rx: mpsc::Receiver<SourceEvent>,
    thread_tx: mpsc::Sender<HashThreadEvent>,
    thread_rx: mpsc::Receiver<HashThreadEvent>,
    shutdown: CancellationToken,
    tracker: TaskTracker,

    workers: Vec<Worker>,

    /// Job workers are on, unless idled
    current: Option<Arc<Job>>,

    /// Jobs whose candidates are still acceptable, newest last
    recent: VecDeque<RecentJob>,

    target: Target,

    session: Option<SessionId>,
    connected: bool,
    disconnected_at: Option<Instant>,
    stale_work: Duration,

    /// Workers were idled because the pool has been gone too long
    paused: bool,

    buffered: VecDeque<(WorkerId, Candidate)>,
    stats: ShareStats,
}

impl Dispatcher {
    pub fn new(
        source: SourceHandle,
        source_rx: mpsc::Receiver<SourceEvent>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
        stale_work: Duration,
    ) -> Self {
        let (thread_tx, thread_rx) = mpsc::channel(THREAD_EVENT_BUFFER);
        Self {
            source,
            source_rx,
            thread_tx,
            thread_rx,
            shutdown,
            tracker,
            workers: Vec::new(),
            current: None,
            recent: VecDeque::new(),
            target: Difficulty::ONE.to_target(),
            session: None,
            connected: false,
            disconnected_at: None,
            stale_work,
            paused: false,
            buffered: VecDeque::new(),
            stats: ShareStats::default(),
        }
    }

    /// Hand a hash thread to its own worker task. Work is assigned once it
    /// reports started.
    pub fn add_thread(&mut self, thread: Box<dyn HashThread>) -> WorkerId {
        let id = self.workers.len();
        let handle = spawn_worker(
            id,
            thread,
            self.thread_tx.clone(),
            self.shutdown.clone(),
            &self.tracker,
        );
        debug!(worker = %handle.name(), id, "Worker added");
        self.workers.push(Worker {
            handle,
            state: WorkerState::Starting,
            status: Status::default(),
        });
        id
    }

    pub fn stats(&self) -> &ShareStats {
        &self.stats
    }

    pub fn target(&self) -> Target {
        self.target
    }

    /// Run until shutdown or until the job source goes away.
    pub async fn run(mut self) -> Result<()> {
        if self.workers.is_empty() {
            warn!("No hash threads configured; running with zero workers");
        }

        let mut stats_tick = time::interval_at(Instant::now() + STATS_INTERVAL, STATS_INTERVAL);

        loop {
            let stale_at = self.stale_deadline();
            let stale = async move {
                match stale_at {
                    Some(at) => time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                event = self.source_rx.recv() => match event {
                    Some(event) => self.handle_source_event(event),
                    None => {
                        warn!(source = %self.source.name(), "Job source ended");
                        break;
                    }
                },

                Some(event) = self.thread_rx.recv() => self.handle_thread_event(event),

                _ = stale => self.pause_stale_work(),

                _ = stats_tick.tick() => self.log_stats(),
            }
        }

        self.log_stats();
        debug!("Dispatcher stopped");
        Ok(())
    }

    pub fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::NewJob { job, clean, target } => {
                if let Some(target) = target {
                    self.target = target;
                }
                debug!(
                    job = %job.id,
                    clean,
                    retarget = target.is_some(),
                    "New job"
                );

                if clean {
                    self.recent.clear();
                }
                self.recent.push_back(RecentJob::new(Arc::clone(&job)));
                while self.recent.len() > RECENT_JOBS {
                    self.recent.pop_front();
                }

                self.current = Some(job);
                self.paused = false;
                self.assign_all();
            }

            SourceEvent::DifficultyChanged(target) => {
                debug!(difficulty = target.difficulty_float(), "Share target changed");
                self.target = target;
                if !self.paused {
                    self.assign_all();
                }
            }

            SourceEvent::Connected { session } => {
                info!(session, "Pool session up");
                self.session = Some(session);
                self.connected = true;
                self.disconnected_at = None;
                self.target = Difficulty::ONE.to_target();

                // Everything from the old session is void
                self.recent.clear();
                self.current = None;
                self.idle_all();

                let held: Vec<_> = self.buffered.drain(..).collect();
                for (worker, candidate) in held {
                    self.process_candidate(worker, candidate);
                }
            }

            SourceEvent::Disconnected => {
                warn!("Pool session down; holding back shares");
                self.connected = false;
                self.disconnected_at = Some(Instant::now());
            }

            SourceEvent::ShareOutcome {
                job_id,
                nonce,
                outcome,
            } => {
                let nonce = format!("{nonce:#010x}");
                match outcome {
                    ShareOutcome::Accepted => {
                        self.stats.accepted += 1;
                        info!(job = %job_id, %nonce, "Share accepted");
                    }
                    ShareOutcome::Rejected(reason) => {
                        self.stats.rejected += 1;
                        info!(job = %job_id, %nonce, %reason, "Share rejected");
                    }
                    ShareOutcome::Indeterminate => {
                        self.stats.indeterminate += 1;
                        warn!(job = %job_id, %nonce, "No response to share");
                    }
                    ShareOutcome::NotSent(reason) => {
                        self.stats.not_sent += 1;
                        debug!(job = %job_id, %nonce, %reason, "Share not sent");
                    }
                }
            }
        }
    }

    pub fn handle_thread_event(&mut self, event: HashThreadEvent) {
        match event {
            HashThreadEvent::Started { worker } => {
                if let Some(w) = self.workers.get_mut(worker) {
                    w.state = WorkerState::Running;
                    info!(worker = %w.handle.name(), "Hash thread running");
                }
                if !self.paused {
                    self.assign_all();
                }
            }

            HashThreadEvent::Candidate { worker, candidate } => {
                self.stats.found += 1;
                if candidate.session.is_some() && !self.connected {
                    if self.buffered.len() >= MAX_BUFFERED {
                        self.buffered.pop_front();
                        self.stats.stale += 1;
                    }
                    self.buffered.push_back((worker, candidate));
                    return;
                }
                self.process_candidate(worker, candidate);
            }

            HashThreadEvent::Status { worker, status } => {
                if let Some(w) = self.workers.get_mut(worker) {
                    debug!(
                        worker = %w.handle.name(),
                        hash_rate = %status.hash_rate,
                        candidates = status.candidates,
                        hardware_errors = status.hardware_errors,
                        active = status.active,
                        "Hash thread status"
                    );
                    w.status = status;
                }
            }

            HashThreadEvent::Failed { worker, error } => {
                if let Some(w) = self.workers.get_mut(worker) {
                    w.state = WorkerState::Failed;
                    warn!(worker = %w.handle.name(), %error, "Hash thread failed; excluded from work");
                }
                if self.running().count() == 0 {
                    warn!("No hash threads running");
                }
                if !self.paused {
                    self.assign_all();
                }
            }
        }
    }

    /// Turn a candidate into a share, or say why not.
    ///
    /// Uses the job and target current right now.
    pub fn validate(&self, worker: &str, candidate: &Candidate) -> Result<Share, ValidationError> {
        if candidate.session.is_some() && candidate.session != self.session {
            return Err(ValidationError::StaleSession(candidate.job_id.clone()));
        }

        let recent = self
            .recent
            .iter()
            .rev()
            .find(|recent| recent.matches(candidate))
            .ok_or_else(|| ValidationError::UnknownJob(candidate.job_id.clone()))?;
        let job = &recent.job;

        if !job.version_allowed(candidate.version) {
            return Err(ValidationError::Malformed(format!(
                "version {:#010x} outside rolling mask",
                candidate.version.to_consensus()
            )));
        }

        let hash = job
            .block_hash(
                &candidate.extranonce2,
                candidate.ntime,
                candidate.version,
                candidate.nonce,
            )
            .map_err(|e| ValidationError::Malformed(e.to_string()))?;

        if !self.target.is_met_by(hash) {
            return Err(ValidationError::AboveTarget);
        }

        if recent.submitted.contains(&ShareKey::from(candidate)) {
            return Err(ValidationError::Duplicate);
        }

        Ok(Share {
            job_id: job.id.clone(),
            origin: job.origin,
            extranonce2: candidate.extranonce2,
            ntime: candidate.ntime,
            nonce: candidate.nonce,
            version: candidate.version,
            version_bits: job.version_bits(candidate.version),
            hash,
            target: self.target,
            worker: worker.to_string(),
        })
    }

    fn process_candidate(&mut self, worker: WorkerId, candidate: Candidate) {
        let name = self
            .workers
            .get(worker)
            .map(|w| w.handle.name().to_string())
            .unwrap_or_default();

        let share = match self.validate(&name, &candidate) {
            Ok(share) => share,
            Err(e) => {
                match e {
                    ValidationError::UnknownJob(_) | ValidationError::StaleSession(_) => {
                        self.stats.stale += 1
                    }
                    ValidationError::AboveTarget => self.stats.below_target += 1,
                    ValidationError::Duplicate => self.stats.duplicate += 1,
                    ValidationError::Malformed(_) => self.stats.invalid += 1,
                }
                debug!(worker = %name, job = %candidate.job_id, error = %e, "Candidate discarded");
                return;
            }
        };

        if let Some(recent) = self.recent.iter_mut().rev().find(|r| r.matches(&candidate)) {
            recent.submitted.insert(ShareKey::from(&candidate));
        }

        if !matches!(share.origin, JobOrigin::Pool { .. }) {
            self.stats.dummy += 1;
            info!(
                worker = %name,
                job = %share.job_id,
                difficulty = %Difficulty::from_hash(&share.hash),
                "Share found for dummy job (not submitted)"
            );
            return;
        }

        info!(
            worker = %name,
            job = %share.job_id,
            nonce = %format!("{:#010x}", share.nonce),
            difficulty = %Difficulty::from_hash(&share.hash),
            "Share found"
        );
        match self.source.submit_share(share) {
            Ok(()) => self.stats.submitted += 1,
            Err(e) => warn!(error = %e, "Failed to hand share to source"),
        }
    }

    fn log_stats(&self) {
        let hash_rate = self.running().map(|w| w.status.hash_rate.0).sum();
        self.stats.log(HashRate(hash_rate));
    }

    fn running(&self) -> impl Iterator<Item = &Worker> {
        self.workers
            .iter()
            .filter(|w| w.state == WorkerState::Running)
    }

    /// Give every running worker its slice of the current job.
    fn assign_all(&mut self) {
        let Some(job) = self.current.clone() else {
            return;
        };

        let full = match job.extranonce2_range() {
            Ok(range) => range,
            Err(e) => {
                warn!(job = %job.id, error = %e, "Job has no usable extranonce2 space");
                return;
            }
        };

        let running: Vec<&Worker> = self.running().collect();
        if running.is_empty() {
            return;
        }
        // A space too small to split goes to the first worker whole.
        let slices = full
            .split(running.len())
            .unwrap_or_else(|| vec![full.clone()]);

        let mut slices = slices.into_iter();
        for worker in running {
            let work = match slices.next() {
                Some(range) => WorkAssignment::new(Arc::clone(&job), range, self.target).ok(),
                None => None,
            };
            debug!(
                worker = %worker.handle.name(),
                job = %job.id,
                range = ?work.as_ref().map(|w| (w.en2_range.min, w.en2_range.max)),
                "Assigning work"
            );
            worker.handle.assign(work);
        }
    }

    fn idle_all(&self) {
        for worker in self.running() {
            worker.handle.assign(None);
        }
    }

    fn stale_deadline(&self) -> Option<Instant> {
        if self.paused || self.current.is_none() {
            return None;
        }
        self.disconnected_at.map(|at| at + self.stale_work)
    }

    fn pause_stale_work(&mut self) {
        warn!(
            after_secs = self.stale_work.as_secs(),
            "Pool unreachable for too long; idling hash threads"
        );
        self.paused = true;
        self.current = None;
        self.idle_all();
    }
}
