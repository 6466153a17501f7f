//! Stratum v1 job source.
//!
//! Bridges [`StratumV1Client`] into the job source interface: pool jobs
//! become [`Job`]s tagged with their session, difficulty becomes a share
//! target, and shares from the dispatcher become `mining.submit` parameters.
//!
//! Pools usually send `mining.set_difficulty` immediately followed by
//! `mining.notify`. The source couples the two into one
//! [`SourceEvent::NewJob`] carrying the new target, so the dispatcher never
//! runs the new job against the old target or the old job against the new one.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use bitcoin::pow::Target;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Job, JobOrigin, SessionId, Share, SourceCommand, SourceEvent};
use crate::stratum_v1::{
    ClientCommand, ClientEvent, Connector, JobNotification, PoolConfig, StratumV1Client,
    SubmitParams,
};
use crate::tracing::prelude::*;

/// How long to wait for a `mining.notify` after a `mining.set_difficulty`
/// before reporting the difficulty change on its own.
const DIFFICULTY_COUPLING_WINDOW: Duration = Duration::from_millis(50);

/// Session parameters needed to turn notifications into jobs.
#[derive(Debug, Clone)]
struct ProtocolState {
    session: SessionId,
    extranonce1: Vec<u8>,
    extranonce2_size: u8,
    version_mask: Option<u32>,
}

/// Stratum v1 job source.
pub struct StratumV1Source {
    config: PoolConfig,

    connector: Arc<dyn Connector>,

    /// Where to send events to the dispatcher
    event_tx: mpsc::Sender<SourceEvent>,

    /// Where to receive commands from the dispatcher
    command_rx: mpsc::UnboundedReceiver<SourceCommand>,

    shutdown: CancellationToken,

    /// Filled by subscribe, cleared on disconnect
    state: Option<ProtocolState>,
}

impl StratumV1Source {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        command_rx: mpsc::UnboundedReceiver<SourceCommand>,
        event_tx: mpsc::Sender<SourceEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            connector,
            event_tx,
            command_rx,
            shutdown,
            state: None,
        }
    }

    /// Convert a pool notification to a job of the current session.
    fn job_from_notification(&self, notification: JobNotification) -> Result<Job> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| anyhow!("job {} before subscribe", notification.job_id))?;

        Ok(Job {
            id: notification.job_id,
            origin: JobOrigin::Pool {
                session: state.session,
            },
            prev_blockhash: notification.prev_hash,
            coinbase1: notification.coinbase1,
            coinbase2: notification.coinbase2,
            merkle_branches: notification.merkle_branches,
            version: notification.version,
            version_mask: state.version_mask,
            bits: notification.nbits,
            time: notification.ntime,
            extranonce1: state.extranonce1.clone(),
            extranonce2_size: state.extranonce2_size,
        })
    }

    /// Convert a share to `mining.submit` parameters.
    fn share_to_submit_params(&self, share: Share) -> Result<SubmitParams> {
        let JobOrigin::Pool { session } = share.origin else {
            return Err(anyhow!("share for job {} is not from a pool", share.job_id));
        };

        Ok(SubmitParams {
            session,
            username: self.config.username.clone(),
            job_id: share.job_id,
            extranonce2: share.extranonce2.into(),
            ntime: share.ntime,
            nonce: share.nonce,
            version_bits: share.version_bits,
        })
    }

    async fn emit(&self, event: SourceEvent) -> Result<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| anyhow!("dispatcher gone"))
    }

    async fn emit_job(&self, notification: JobNotification, target: Option<Target>) -> Result<()> {
        let clean = notification.clean_jobs;
        match self.job_from_notification(notification) {
            Ok(job) => {
                self.emit(SourceEvent::NewJob {
                    job: Arc::new(job),
                    clean,
                    target,
                })
                .await
            }
            Err(e) => {
                warn!(error = %e, "Dropping job");
                if let Some(target) = target {
                    self.emit(SourceEvent::DifficultyChanged(target)).await?;
                }
                Ok(())
            }
        }
    }

    /// Handle one client event.
    ///
    /// Returns an event that was read ahead while looking for a job to
    /// couple with a difficulty change, for the caller to handle next.
    async fn handle_client_event(
        &mut self,
        event: ClientEvent,
        client_rx: &mut mpsc::Receiver<ClientEvent>,
    ) -> Result<Option<ClientEvent>> {
        match event {
            ClientEvent::Subscribed {
                session,
                extranonce1,
                extranonce2_size,
                version_mask,
            } => {
                self.state = Some(ProtocolState {
                    session,
                    extranonce1,
                    extranonce2_size,
                    version_mask,
                });
                self.emit(SourceEvent::Connected { session }).await?;
            }

            ClientEvent::Authorized { session } => {
                debug!(session, "Session authorized");
            }

            ClientEvent::NewJob(notification) => {
                self.emit_job(notification, None).await?;
            }

            ClientEvent::DifficultyChanged(difficulty) => {
                let target = difficulty.to_target();
                let next = tokio::time::timeout(DIFFICULTY_COUPLING_WINDOW, client_rx.recv()).await;
                match next {
                    Ok(Some(ClientEvent::NewJob(notification))) => {
                        self.emit_job(notification, Some(target)).await?;
                    }
                    Ok(Some(other)) => {
                        self.emit(SourceEvent::DifficultyChanged(target)).await?;
                        return Ok(Some(other));
                    }
                    Ok(None) | Err(_) => {
                        self.emit(SourceEvent::DifficultyChanged(target)).await?;
                    }
                }
            }

            ClientEvent::VersionMaskSet(mask) => {
                if let Some(state) = &mut self.state {
                    state.version_mask = Some(mask);
                }
            }

            ClientEvent::ShareResult {
                job_id,
                nonce,
                outcome,
            } => {
                self.emit(SourceEvent::ShareOutcome {
                    job_id,
                    nonce,
                    outcome,
                })
                .await?;
            }

            ClientEvent::Disconnected => {
                self.state = None;
                self.emit(SourceEvent::Disconnected).await?;
            }
        }

        Ok(None)
    }

    /// Run the source.
    ///
    /// Spawns the Stratum client and bridges events between it and the
    /// dispatcher. On shutdown the client flushes outstanding submissions;
    /// the source keeps forwarding their outcomes until the client is done.
    pub async fn run(mut self) -> Result<()> {
        info!(pool = %self.config.url, "Starting Stratum v1 source");

        let (client_event_tx, mut client_event_rx) = mpsc::channel(100);
        let (client_command_tx, client_command_rx) = mpsc::unbounded_channel();

        let client = StratumV1Client::new(
            self.config.clone(),
            self.connector.clone(),
            client_event_tx,
            client_command_rx,
            self.shutdown.clone(),
        );
        let client_handle = tokio::spawn(client.run());

        loop {
            tokio::select! {
                event = client_event_rx.recv() => {
                    let Some(event) = event else { break };
                    let mut next = Some(event);
                    while let Some(event) = next.take() {
                        match self.handle_client_event(event, &mut client_event_rx).await {
                            Ok(ahead) => next = ahead,
                            Err(e) => debug!(error = %e, "Could not forward pool event"),
                        }
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SourceCommand::SubmitShare(share) => {
                            match self.share_to_submit_params(share) {
                                Ok(params) => {
                                    if client_command_tx.send(ClientCommand::SubmitShare(params)).is_err() {
                                        warn!("Stratum client gone, share not submitted");
                                    }
                                }
                                Err(e) => warn!(error = %e, "Not submitting share"),
                            }
                        }
                    }
                }
            }
        }

        client_handle.await??;
        info!("Stratum v1 source stopped");
        Ok(())
    }
}
