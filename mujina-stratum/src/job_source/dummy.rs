//! Dummy job source for running without a pool.
//!
//! Emits a job built from Bitcoin's genesis block on a fixed interval. The
//! coinbase is cut up the way a pool would cut it, so hash threads search a
//! real extranonce2 space and the genesis nonce is a known solution. Jobs
//! are tagged [`JobOrigin::Dummy`]; the dispatcher never submits their
//! shares, and shares that reach this source anyway are logged and dropped.

use std::sync::Arc;

use anyhow::{Context, Result};
use bitcoin::block::Version;
use bitcoin::hashes::Hash;
use bitcoin::pow::Target;
use bitcoin::{BlockHash, CompactTarget};
use tokio::sync::mpsc;
use tokio::time::{Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::{Job, JobOrigin, SourceCommand, SourceEvent};
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// Serialized genesis coinbase transaction.
pub(crate) const GENESIS_COINBASE_HEX: &str = "01000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000";

pub(crate) const GENESIS_TIME: u32 = 0x495fab29;
pub(crate) const GENESIS_BITS: u32 = 0x1d00ffff;

/// Where the extranonces sit inside the coinbase script.
const EXTRANONCE1_AT: usize = 50;
const EXTRANONCE2_AT: usize = 54;
const COINBASE2_AT: usize = 58;

/// Dummy job source that generates work from the genesis block.
pub struct DummySource {
    /// Where to send events to the dispatcher
    event_tx: mpsc::Sender<SourceEvent>,

    /// Where to receive commands from the dispatcher
    command_rx: mpsc::UnboundedReceiver<SourceCommand>,

    shutdown: CancellationToken,

    /// Template every emitted job is cloned from
    template: Job,

    /// Share target sent with every job
    target: Target,

    /// How often to emit jobs
    interval: Duration,

    emitted: u64,
}

impl DummySource {
    pub fn new(
        command_rx: mpsc::UnboundedReceiver<SourceCommand>,
        event_tx: mpsc::Sender<SourceEvent>,
        shutdown: CancellationToken,
        interval: Duration,
        difficulty: Difficulty,
    ) -> Result<Self> {
        let coinbase = hex::decode(GENESIS_COINBASE_HEX).context("genesis coinbase hex")?;

        let template = Job {
            id: String::new(),
            origin: JobOrigin::Dummy,
            prev_blockhash: BlockHash::all_zeros(),
            coinbase1: coinbase[..EXTRANONCE1_AT].to_vec(),
            coinbase2: coinbase[COINBASE2_AT..].to_vec(),
            merkle_branches: Vec::new(),
            version: Version::ONE,
            version_mask: None,
            bits: CompactTarget::from_consensus(GENESIS_BITS),
            time: GENESIS_TIME,
            extranonce1: coinbase[EXTRANONCE1_AT..EXTRANONCE2_AT].to_vec(),
            extranonce2_size: (COINBASE2_AT - EXTRANONCE2_AT) as u8,
        };

        Ok(Self {
            event_tx,
            command_rx,
            shutdown,
            template,
            target: difficulty.to_target(),
            interval,
            emitted: 0,
        })
    }

    fn next_job(&mut self) -> Job {
        self.emitted += 1;
        Job {
            id: format!("dummy-{}", self.emitted),
            ..self.template.clone()
        }
    }

    /// Run the dummy source until shutdown.
    ///
    /// The first job goes out immediately, then one per interval. Every job
    /// is clean: there is nothing to gain from finishing the previous one.
    pub async fn run(mut self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Dummy source starting");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let job = self.next_job();
                    debug!(job_id = %job.id, "Emitting dummy job");
                    let event = SourceEvent::NewJob {
                        job: Arc::new(job),
                        clean: true,
                        target: Some(self.target),
                    };
                    if self.event_tx.send(event).await.is_err() {
                        debug!("Dispatcher gone, dummy source stopping");
                        break;
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SourceCommand::SubmitShare(share) => {
                            debug!(
                                job_id = %share.job_id,
                                nonce = format!("{:#010x}", share.nonce),
                                "Dummy source discarding share"
                            );
                        }
                    }
                }

                _ = self.shutdown.cancelled() => {
                    info!("Dummy source shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
