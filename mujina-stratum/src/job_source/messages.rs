//! Message types for source-dispatcher communication.
//!
//! Sources push [`SourceEvent`]s into a channel the dispatcher owns the
//! receiving end of. The dispatcher talks back through a [`SourceHandle`],
//! which wraps the source's command channel.
//!
//! ```text
//! Source                          Dispatcher
//!   |                                  |
//!   | NewJob / DifficultyChanged       |
//!   |--------------------------------->|
//!   |                                  | (validates candidates)
//!   |    handle.submit_share(share)    |
//!   |<---------------------------------|
//!   | ShareOutcome                     |
//!   |--------------------------------->|
//! ```

use std::sync::Arc;

use anyhow::Result;
use bitcoin::pow::Target;
use tokio::sync::mpsc;

use super::{Job, SessionId, Share};

/// Handle to a job source (name + command channel).
#[derive(Clone, Debug)]
pub struct SourceHandle {
    inner: Arc<SourceHandleInner>,
}

#[derive(Debug)]
struct SourceHandleInner {
    name: String,
    command_tx: mpsc::UnboundedSender<SourceCommand>,
}

impl SourceHandle {
    pub fn new(name: String, command_tx: mpsc::UnboundedSender<SourceCommand>) -> Self {
        Self {
            inner: Arc::new(SourceHandleInner { name, command_tx }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Submit a share to this source. Never waits.
    pub fn submit_share(&self, share: Share) -> Result<()> {
        self.inner
            .command_tx
            .send(SourceCommand::SubmitShare(share))
            .map_err(|_| anyhow::anyhow!("source {} is gone", self.inner.name))
    }
}

/// Pool verdict on a submitted share.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    Accepted,
    Rejected(String),
    /// No response within the submission timeout. Never resubmitted.
    Indeterminate,
    /// Never written to the pool, e.g. its session ended first.
    NotSent(String),
}

/// Events from sources, in the order the source observed them.
#[derive(Debug)]
pub enum SourceEvent {
    /// New work.
    ///
    /// With `clean` set, all work on earlier jobs is invalid. Otherwise
    /// shares for earlier jobs of the same session remain valid.
    ///
    /// `target` carries a difficulty change that arrived together with
    /// this job; the dispatcher applies both in one step.
    NewJob {
        job: Arc<Job>,
        clean: bool,
        target: Option<Target>,
    },

    /// New share target, effective for candidates validated from now on.
    DifficultyChanged(Target),

    /// A session completed its handshake. Work from earlier sessions is void.
    Connected { session: SessionId },

    /// The session lost its connection and is retrying.
    Disconnected,

    /// Result of an earlier submission.
    ShareOutcome {
        job_id: String,
        nonce: u32,
        outcome: ShareOutcome,
    },
}

/// Commands to sources.
#[derive(Debug)]
pub enum SourceCommand {
    /// Submit this share to the pool.
    SubmitShare(Share),
}
