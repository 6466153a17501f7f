//! Daemon lifecycle: wire the job source, dispatcher and hash threads
//! together, run until a signal arrives, then shut down in order.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal::unix::{self, SignalKind};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::config::{Config, HardwareKind};
use crate::dispatcher::Dispatcher;
use crate::hash_thread::bm13xx::Bm13xxThread;
use crate::hash_thread::cpu::CpuHashThread;
use crate::hash_thread::HashThread;
use crate::job_source::dummy::DummySource;
use crate::job_source::stratum_v1::StratumV1Source;
use crate::job_source::{SourceCommand, SourceEvent, SourceHandle};
use crate::stratum_v1::TcpConnector;
use crate::tracing::prelude::*;

const SOURCE_CHANNEL: usize = 100;

/// The main daemon that coordinates all mining operations.
pub struct Daemon {
    config: Config,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Daemon {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Hash threads for the configured hardware.
    fn hash_threads(&self) -> Vec<Box<dyn HashThread>> {
        let hw = &self.config.hardware;
        match hw.kind {
            HardwareKind::Cpu => (0..hw.cpu_threads)
                .map(|i| {
                    Box::new(CpuHashThread::new(format!("cpu-{i}"), hw.cpu_duty))
                        as Box<dyn HashThread>
                })
                .collect(),
            HardwareKind::Bm1370 => hw
                .serial_ports
                .iter()
                .map(|port| {
                    Box::new(Bm13xxThread::serial(port, self.config.log)) as Box<dyn HashThread>
                })
                .collect(),
            HardwareKind::None => Vec::new(),
        }
    }

    /// Start the job source. Returns the handle the dispatcher submits
    /// through.
    fn spawn_source(
        &self,
        command_rx: mpsc::UnboundedReceiver<SourceCommand>,
        command_tx: mpsc::UnboundedSender<SourceCommand>,
        event_tx: mpsc::Sender<SourceEvent>,
    ) -> Result<SourceHandle> {
        match &self.config.pool {
            Some(pool) => {
                info!(url = %pool.url, user = %pool.username, "Mining to pool");
                let name = pool.url.to_string();
                let source = StratumV1Source::new(
                    pool.clone(),
                    Arc::new(TcpConnector::new(self.config.log)),
                    command_rx,
                    event_tx,
                    self.shutdown.clone(),
                );
                let shutdown = self.shutdown.clone();
                self.tracker.spawn(async move {
                    if let Err(e) = source.run().await {
                        error!(error = %e, "Pool source failed");
                        shutdown.cancel();
                    }
                });
                Ok(SourceHandle::new(name, command_tx))
            }
            None => {
                warn!("No pool configured (MUJINA_POOL_URL); running dummy job source");
                let source = DummySource::new(
                    command_rx,
                    event_tx,
                    self.shutdown.clone(),
                    self.config.dummy.interval,
                    self.config.dummy.difficulty,
                )?;
                let shutdown = self.shutdown.clone();
                self.tracker.spawn(async move {
                    if let Err(e) = source.run().await {
                        error!(error = %e, "Dummy source failed");
                        shutdown.cancel();
                    }
                });
                Ok(SourceHandle::new("dummy".into(), command_tx))
            }
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        let (event_tx, event_rx) = mpsc::channel(SOURCE_CHANNEL);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let source = self.spawn_source(command_rx, command_tx, event_tx)?;

        let mut dispatcher = Dispatcher::new(
            source,
            event_rx,
            self.shutdown.clone(),
            self.tracker.clone(),
            self.config.stale_work,
        );
        for thread in self.hash_threads() {
            dispatcher.add_thread(thread);
        }

        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            if let Err(e) = dispatcher.run().await {
                error!(error = %e, "Dispatcher failed");
            }
            shutdown.cancel();
        });
        self.tracker.close();

        info!(hardware = %self.config.hardware.kind, "Started.");
        if !self.config.log.raw_traffic() {
            debug!("Set MUJINA_LOG_LEVEL=trace to see pool and serial traffic");
        }

        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            },
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            },
            _ = self.shutdown.cancelled() => {
                warn!("Stopping after internal failure");
            },
        }

        trace!("Shutting down.");
        self.shutdown.cancel();

        self.tracker.wait().await;
        info!("Exiting.");

        Ok(())
    }
}
