//! CPU HashThread.
//!
//! Hashes on a dedicated `std::thread` so the runtime never blocks on SHA-256.
//! The async side talks to it through a command channel and drains found
//! candidates on poll. Useful for exercising the whole pipeline without
//! hardware; it is far too slow for real difficulty.
//!
//! Utilization is limited by duty cycling: in every 100 ms cycle the thread
//! hashes for `duty_percent` of the time and sleeps for the rest. ntime rolls
//! forward once per second. When the nonce space of one extranonce2 is spent
//! the thread moves to the next value in its range, wrapping at the end.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bitcoin::pow::Target;
use bitcoin::TxMerkleNode;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{Candidate, HashThread, HashThreadError, Status, WorkAssignment};
use crate::tracing::prelude::*;
use crate::types::{Extranonce2, Extranonce2Iter, HashRate};

const CYCLE: Duration = Duration::from_millis(100);

/// Hashes per batch between clock checks.
const BATCH: u32 = 4096;

const NTIME_ROLL_INTERVAL: Duration = Duration::from_secs(1);

const RATE_WINDOW: Duration = Duration::from_secs(5);

/// Found candidates buffered between polls. Excess is dropped.
const CANDIDATE_BUFFER: usize = 256;

enum Command {
    Assign(Option<WorkAssignment>),
    Shutdown,
}

/// Position within one assignment's search space.
struct Search {
    work: WorkAssignment,
    en2: Extranonce2,
    en2_iter: Extranonce2Iter,
    merkle_root: TxMerkleNode,
    ntime: u32,
    nonce: u32,
}

impl Search {
    fn new(work: WorkAssignment) -> Result<Self, HashThreadError> {
        let mut en2_iter = work.en2_range.iter();
        let en2 = en2_iter
            .next()
            .ok_or_else(|| HashThreadError::InvalidAssignment("empty extranonce2 range".into()))?;
        let merkle_root = work
            .job
            .merkle_root(&en2)
            .map_err(|e| HashThreadError::InvalidAssignment(e.to_string()))?;
        let ntime = work.job.time;

        Ok(Self {
            work,
            en2,
            en2_iter,
            merkle_root,
            ntime,
            nonce: 0,
        })
    }

    fn retarget(&mut self, target: Target) {
        self.work.target = target;
    }

    fn roll_ntime(&mut self) {
        self.ntime = self.ntime.wrapping_add(1);
    }

    fn next_extranonce2(&mut self) -> Result<(), HashThreadError> {
        let en2 = match self.en2_iter.next() {
            Some(en2) => en2,
            None => {
                self.en2_iter = self.work.en2_range.iter();
                self.en2_iter.next().ok_or_else(|| {
                    HashThreadError::InvalidAssignment("empty extranonce2 range".into())
                })?
            }
        };
        self.merkle_root = self
            .work
            .job
            .merkle_root(&en2)
            .map_err(|e| HashThreadError::InvalidAssignment(e.to_string()))?;
        self.en2 = en2;
        Ok(())
    }

    /// Hash `count` nonces and return those meeting the assignment target.
    fn step(&mut self, count: u32) -> Result<Vec<Candidate>, HashThreadError> {
        let job = Arc::clone(&self.work.job);
        let mut found = Vec::new();

        for _ in 0..count {
            let header = job.header(self.merkle_root, self.ntime, job.version, self.nonce);
            if self.work.target.is_met_by(header.block_hash()) {
                found.push(Candidate::for_job(
                    &job,
                    self.en2,
                    self.ntime,
                    self.nonce,
                    job.version,
                ));
            }

            if self.nonce == u32::MAX {
                self.nonce = 0;
                self.next_extranonce2()?;
            } else {
                self.nonce += 1;
            }
        }

        Ok(found)
    }
}

/// Apply a new assignment, keeping the position when only the target changed.
fn apply(
    search: Option<Search>,
    work: Option<WorkAssignment>,
) -> Result<Option<Search>, HashThreadError> {
    match (search, work) {
        (_, None) => Ok(None),
        (Some(mut search), Some(work)) if search.work.same_search_space(&work) => {
            search.retarget(work.target);
            Ok(Some(search))
        }
        (_, Some(work)) => Search::new(work).map(Some),
    }
}

fn mining_loop(
    name: String,
    command_rx: std_mpsc::Receiver<Command>,
    candidate_tx: mpsc::Sender<Candidate>,
    status: Arc<Mutex<Status>>,
    duty_percent: u8,
) {
    let work_time = CYCLE * u32::from(duty_percent.clamp(1, 100)) / 100;
    let mut search: Option<Search> = None;
    let mut last_ntime_roll = Instant::now();
    let mut hashes: u64 = 0;
    let mut window_start = Instant::now();

    let handle = |command: Command, search: &mut Option<Search>| -> bool {
        match command {
            Command::Assign(work) => {
                match apply(search.take(), work) {
                    Ok(next) => *search = next,
                    Err(e) => warn!(thread = %name, error = %e, "Ignoring assignment"),
                }
                status.lock().active = search.is_some();
                true
            }
            Command::Shutdown => false,
        }
    };

    loop {
        // Drain commands; block while idle
        loop {
            let command = if search.is_some() {
                match command_rx.try_recv() {
                    Ok(command) => command,
                    Err(std_mpsc::TryRecvError::Empty) => break,
                    Err(std_mpsc::TryRecvError::Disconnected) => return,
                }
            } else {
                match command_rx.recv() {
                    Ok(command) => command,
                    Err(_) => return,
                }
            };
            if !handle(command, &mut search) {
                return;
            }
            if search.is_some() {
                last_ntime_roll = Instant::now();
            }
        }

        let Some(current) = search.as_mut() else {
            continue;
        };

        let cycle_start = Instant::now();
        while cycle_start.elapsed() < work_time {
            match current.step(BATCH) {
                Ok(found) => {
                    for candidate in found {
                        debug!(
                            thread = %name,
                            nonce = %format!("{:#010x}", candidate.nonce),
                            "Candidate found"
                        );
                        status.lock().candidates += 1;
                        if candidate_tx.try_send(candidate).is_err() {
                            status.lock().hardware_errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(thread = %name, error = %e, "Search failed, idling");
                    search = None;
                    status.lock().active = false;
                    break;
                }
            }
            hashes += u64::from(BATCH);
        }

        if let Some(rest) = CYCLE.checked_sub(cycle_start.elapsed()) {
            std::thread::sleep(rest);
        }

        if last_ntime_roll.elapsed() >= NTIME_ROLL_INTERVAL {
            if let Some(current) = search.as_mut() {
                current.roll_ntime();
            }
            last_ntime_roll = Instant::now();
        }

        if window_start.elapsed() >= RATE_WINDOW {
            let rate = HashRate::from_hashes(hashes as f64, window_start.elapsed());
            trace!(thread = %name, hash_rate = %rate, "CPU hash rate");
            status.lock().hash_rate = rate;
            hashes = 0;
            window_start = Instant::now();
        }
    }
}

/// A HashThread backed by one CPU core.
pub struct CpuHashThread {
    name: String,
    duty_percent: u8,
    command_tx: Option<std_mpsc::Sender<Command>>,
    candidate_rx: Option<mpsc::Receiver<Candidate>>,
    status: Arc<Mutex<Status>>,
    thread: Option<JoinHandle<()>>,
}

impl CpuHashThread {
    pub fn new(name: impl Into<String>, duty_percent: u8) -> Self {
        Self {
            name: name.into(),
            duty_percent,
            command_tx: None,
            candidate_rx: None,
            status: Arc::new(Mutex::new(Status::default())),
            thread: None,
        }
    }

    fn send(&self, command: Command) -> Result<(), HashThreadError> {
        self.command_tx
            .as_ref()
            .ok_or(HashThreadError::NotStarted)?
            .send(command)
            .map_err(|_| HashThreadError::Communication("hashing thread exited".into()))
    }
}

#[async_trait]
impl HashThread for CpuHashThread {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&mut self) -> Result<(), HashThreadError> {
        if self.thread.is_some() {
            self.stop().await?;
        }

        let (command_tx, command_rx) = std_mpsc::channel();
        let (candidate_tx, candidate_rx) = mpsc::channel(CANDIDATE_BUFFER);
        let status = Arc::clone(&self.status);
        let name = self.name.clone();
        let duty_percent = self.duty_percent;

        let thread = std::thread::Builder::new()
            .name(format!("cpu-{}", self.name))
            .spawn(move || mining_loop(name, command_rx, candidate_tx, status, duty_percent))
            .map_err(|e| HashThreadError::Communication(format!("spawn: {e}")))?;

        self.command_tx = Some(command_tx);
        self.candidate_rx = Some(candidate_rx);
        self.thread = Some(thread);
        debug!(thread = %self.name, duty_percent, "CPU thread started");
        Ok(())
    }

    async fn assign(&mut self, work: Option<WorkAssignment>) -> Result<(), HashThreadError> {
        self.send(Command::Assign(work))
    }

    async fn poll(&mut self) -> Result<Vec<Candidate>, HashThreadError> {
        let rx = self
            .candidate_rx
            .as_mut()
            .ok_or(HashThreadError::NotStarted)?;

        let mut found = Vec::new();
        loop {
            match rx.try_recv() {
                Ok(candidate) => found.push(candidate),
                Err(mpsc::error::TryRecvError::Empty) => return Ok(found),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if found.is_empty() {
                        return Err(HashThreadError::Communication(
                            "hashing thread exited".into(),
                        ));
                    }
                    return Ok(found);
                }
            }
        }
    }

    async fn stop(&mut self) -> Result<(), HashThreadError> {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Shutdown);
        }
        self.candidate_rx = None;
        self.status.lock().active = false;

        if let Some(thread) = self.thread.take() {
            tokio::task::spawn_blocking(move || thread.join())
                .await
                .map_err(|e| HashThreadError::Communication(e.to_string()))?
                .map_err(|_| HashThreadError::Communication("hashing thread panicked".into()))?;
        }
        Ok(())
    }

    fn status(&self) -> Status {
        self.status.lock().clone()
    }
}

impl Drop for CpuHashThread {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(Command::Shutdown);
        }
    }
}
