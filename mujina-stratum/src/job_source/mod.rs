//! Mining job sources.
//!
//! A job source produces the work the dispatcher hands to hash threads, and
//! takes back the shares found for it. Two kinds exist:
//!
//! - [`stratum_v1`]: work from a pool over Stratum v1; shares go back to it
//! - [`dummy`]: locally generated work that exercises the hardware and the
//!   dispatcher without a network; its shares go nowhere
//!
//! Sources run as tasks. They push [`SourceEvent`]s into a channel and take
//! [`SourceCommand`]s through a [`SourceHandle`]. Jobs are immutable and
//! shared behind `Arc`; a job's [`JobOrigin`] says whether its shares can be
//! submitted and under which pool session.

mod job;
mod merkle;
mod messages;

pub mod dummy;
pub mod stratum_v1;

#[cfg(test)]
pub(crate) mod test_data;

pub use job::{Job, JobOrigin, SessionId, Share};
pub use merkle::{assemble_coinbase, compute_merkle_root};
pub use messages::{ShareOutcome, SourceCommand, SourceEvent, SourceHandle};
