//! HashThread abstraction for hardware and software workers.
//!
//! A HashThread is one independently schedulable searcher: a BM13xx chip on a
//! serial port, or a CPU thread. The dispatcher hands each one a
//! [`WorkAssignment`] and collects the [`Candidate`]s it reports, without
//! knowing what sits behind the trait.
//!
//! Each thread runs inside its own task (see [`spawn_worker`]), which owns the
//! device exclusively. The task takes new assignments from a watch channel,
//! polls the thread for candidates at a fixed interval, and isolates device
//! faults: transient errors get a bounded number of reinitializations, after
//! which the worker reports itself failed and exits. Nothing a worker does
//! can take down another worker or the pool session.
//!
//! Threads forward every candidate they see. Hardware may prefilter against
//! an easier chip-level target; the dispatcher does the final check against
//! the pool target.

pub mod bm13xx;
pub mod cpu;
mod task;
mod work;

use async_trait::async_trait;
use thiserror::Error;

pub use task::{spawn_worker, WorkerHandle};

pub use work::{Candidate, WorkAssignment};
use crate::types::HashRate;

/// Index of a worker within the dispatcher.
pub type WorkerId = usize;

/// How often a worker task polls its thread for candidates.
pub const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// How often a worker task reports status.
pub const STATUS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Reinitialization attempts after a transient fault before giving up.
pub const MAX_REINIT_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum HashThreadError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device communication error: {0}")]
    Communication(String),

    #[error("Thread not started")]
    NotStarted,

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid assignment: {0}")]
    InvalidAssignment(String),
}

impl HashThreadError {
    /// Whether reinitializing the device might clear the fault.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HashThreadError::Communication(_) | HashThreadError::NotStarted
        )
    }
}

/// Runtime status of a thread. Observability only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    pub hash_rate: HashRate,

    /// Candidates reported since start
    pub candidates: u64,

    pub hardware_errors: u64,

    pub temperature_c: Option<f32>,

    /// Whether the thread is working on an assignment
    pub active: bool,
}

/// Events from worker tasks to the dispatcher.
#[derive(Debug)]
pub enum HashThreadEvent {
    /// The thread started and is ready for work.
    Started { worker: WorkerId },

    Candidate {
        worker: WorkerId,
        candidate: Candidate,
    },

    Status { worker: WorkerId, status: Status },

    /// The thread failed for good and its task has exited.
    Failed {
        worker: WorkerId,
        error: HashThreadError,
    },
}

/// The dispatcher's view of a worker.
///
/// Implementations own their device. Methods are only ever called from the
/// worker's own task, one at a time.
#[async_trait]
pub trait HashThread: Send {
    fn name(&self) -> &str;

    /// Open and initialize the device. Called again to reinitialize after a
    /// transient fault.
    async fn start(&mut self) -> Result<(), HashThreadError>;

    /// Replace the current assignment, or go idle with `None`.
    ///
    /// Work on the superseded assignment stops promptly. An assignment that
    /// only changes the target keeps the search position.
    async fn assign(&mut self, work: Option<WorkAssignment>) -> Result<(), HashThreadError>;

    /// Candidates found since the last poll.
    ///
    /// Returns within a short, bounded time whether or not anything was found.
    async fn poll(&mut self) -> Result<Vec<Candidate>, HashThreadError>;

    /// Release the device.
    async fn stop(&mut self) -> Result<(), HashThreadError>;

    fn status(&self) -> Status;
}
