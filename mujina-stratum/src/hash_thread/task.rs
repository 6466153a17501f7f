//! The task that drives one [`HashThread`].

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::{
    HashThread, HashThreadError, HashThreadEvent, WorkAssignment, WorkerId, MAX_REINIT_ATTEMPTS,
    POLL_INTERVAL, STATUS_INTERVAL,
};
use crate::tracing::prelude::*;

/// Pause between reinitialization attempts.
const REINIT_DELAY: Duration = Duration::from_secs(1);

/// Dispatcher-side handle to a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: WorkerId,
    name: String,
    work_tx: watch::Sender<Option<WorkAssignment>>,
}

impl WorkerHandle {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand the worker new work, or idle it with `None`.
    ///
    /// Returns false if the worker task has exited.
    pub fn assign(&self, work: Option<WorkAssignment>) -> bool {
        self.work_tx.send(work).is_ok()
    }

    /// The assignment most recently handed to this worker.
    pub fn current(&self) -> Option<WorkAssignment> {
        self.work_tx.borrow().clone()
    }
}

/// Spawn a task owning `thread` and return the handle used to feed it.
///
/// The task starts the thread, applies assignments as they change, polls for
/// candidates every [`POLL_INTERVAL`], and stops the thread on shutdown. The
/// task is registered with `tracker` so shutdown can wait for the device to
/// be released.
pub fn spawn_worker(
    id: WorkerId,
    thread: Box<dyn HashThread>,
    event_tx: mpsc::Sender<HashThreadEvent>,
    shutdown: CancellationToken,
    tracker: &TaskTracker,
) -> WorkerHandle {
    let name = thread.name().to_string();
    let (work_tx, work_rx) = watch::channel(None);
    tracker.spawn(run_worker(id, thread, work_rx, event_tx, shutdown));
    WorkerHandle { id, name, work_tx }
}

/// Start the thread, retrying transient failures a bounded number of times.
async fn start_with_retry(
    thread: &mut dyn HashThread,
    shutdown: &CancellationToken,
) -> Result<(), HashThreadError> {
    let mut attempt = 0;
    loop {
        match thread.start().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < MAX_REINIT_ATTEMPTS => {
                attempt += 1;
                warn!(
                    worker = thread.name(),
                    error = %e,
                    attempt,
                    "Start failed, retrying"
                );
                tokio::select! {
                    _ = time::sleep(REINIT_DELAY) => {}
                    _ = shutdown.cancelled() => return Err(e),
                }
            }
            Err(e) => return Err(e),
        }
    }
}

async fn run_worker(
    id: WorkerId,
    mut thread: Box<dyn HashThread>,
    mut work_rx: watch::Receiver<Option<WorkAssignment>>,
    event_tx: mpsc::Sender<HashThreadEvent>,
    shutdown: CancellationToken,
) {
    let name = thread.name().to_string();

    if let Err(error) = start_with_retry(thread.as_mut(), &shutdown).await {
        error!(worker = %name, %error, "Worker failed to start");
        let _ = event_tx
            .send(HashThreadEvent::Failed { worker: id, error })
            .await;
        return;
    }
    info!(worker = %name, "Worker started");
    if event_tx
        .send(HashThreadEvent::Started { worker: id })
        .await
        .is_err()
    {
        let _ = thread.stop().await;
        return;
    }

    // Work assigned while starting
    let mut current = work_rx.borrow_and_update().clone();
    let mut pending: Result<(), HashThreadError> = match &current {
        Some(_) => thread.assign(current.clone()).await,
        None => Ok(()),
    };

    let mut poll = time::interval(POLL_INTERVAL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut status = time::interval_at(Instant::now() + STATUS_INTERVAL, STATUS_INTERVAL);

    loop {
        if let Err(error) = pending {
            if !error.is_transient() {
                fail(id, &name, error, &event_tx).await;
                let _ = thread.stop().await;
                return;
            }

            warn!(worker = %name, %error, "Worker fault, reinitializing");
            let _ = thread.stop().await;
            let restarted = match start_with_retry(thread.as_mut(), &shutdown).await {
                Ok(()) => thread.assign(current.clone()).await,
                Err(e) => Err(e),
            };
            if let Err(error) = restarted {
                fail(id, &name, error, &event_tx).await;
                let _ = thread.stop().await;
                return;
            }
            info!(worker = %name, "Worker reinitialized");
        }

        pending = tokio::select! {
            _ = shutdown.cancelled() => break,

            changed = work_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                current = work_rx.borrow_and_update().clone();
                match &current {
                    Some(work) => debug!(worker = %name, job = %work.job.id, "New assignment"),
                    None => debug!(worker = %name, "Idle"),
                }
                thread.assign(current.clone()).await
            }

            _ = poll.tick() => {
                match thread.poll().await {
                    Ok(candidates) => {
                        let mut closed = false;
                        for candidate in candidates {
                            let event = HashThreadEvent::Candidate { worker: id, candidate };
                            if event_tx.send(event).await.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        if closed {
                            break;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }

            _ = status.tick() => {
                let event = HashThreadEvent::Status { worker: id, status: thread.status() };
                if event_tx.send(event).await.is_err() {
                    break;
                }
                Ok(())
            }
        };
    }

    if let Err(error) = thread.stop().await {
        warn!(worker = %name, %error, "Error stopping worker");
    }
    info!(worker = %name, "Worker stopped");
}

async fn fail(
    id: WorkerId,
    name: &str,
    error: HashThreadError,
    event_tx: &mpsc::Sender<HashThreadEvent>,
) {
    error!(worker = %name, %error, "Worker failed permanently");
    let _ = event_tx
        .send(HashThreadEvent::Failed { worker: id, error })
        .await;
}
