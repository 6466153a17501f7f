//! Stratum v1 mining protocol client.
//!
//! The protocol is JSON-RPC over TCP with newline-delimited messages.
//!
//! # Protocol Overview
//!
//! Stratum v1 is a bidirectional, event-driven protocol:
//!
//! - **Client requests**: configure, subscribe, authorize, submit,
//!   suggest_difficulty
//! - **Server notifications**: mining.notify (new work),
//!   mining.set_difficulty, mining.set_version_mask, client.reconnect
//! - **Server responses**: results for client requests (boolean or error
//!   array), correlated by request id
//!
//! # Architecture
//!
//! [`StratumV1Client`] is an active task. It pushes [`ClientEvent`]s into a
//! channel and takes [`ClientCommand`]s from another; the Stratum job source
//! sits on the other end of both.
//!
//! ```rust,ignore
//! let (event_tx, mut event_rx) = mpsc::channel(100);
//! let (command_tx, command_rx) = mpsc::unbounded_channel();
//! let config = PoolConfig::new("stratum+tcp://pool.example.com:3333".parse()?, "worker", "x");
//! let connector = Arc::new(TcpConnector::new(log_config));
//!
//! let client = StratumV1Client::new(config, connector, event_tx, command_rx, shutdown);
//! tokio::spawn(client.run());
//!
//! while let Some(event) = event_rx.recv().await {
//!     match event {
//!         ClientEvent::NewJob(job) => { /* handle new work */ }
//!         ClientEvent::DifficultyChanged(diff) => { /* update target */ }
//!         // ...
//!     }
//! }
//! ```

mod backoff;
mod client;
mod connection;
mod error;
mod messages;

use std::time::Duration;

pub use backoff::Backoff;
pub use client::{ConnectionState, PoolConfig, SessionState, StratumV1Client};
pub use connection::{Connection, Connector, PoolUrl, TcpConnector, Transport};
pub use error::{StratumError, StratumResult};
pub use messages::{ClientCommand, ClientEvent, JobNotification, JsonRpcMessage, SubmitParams};

#[cfg(test)]
pub(crate) use connection::{MockConnector, MockTransport, MockTransportHandle};

/// Version bits we ask to roll (BIP 320 general purpose bits 13 to 28).
pub const VERSION_ROLLING_MASK: u32 = 0x1fff_e000;

/// Bound on each handshake request (configure, subscribe, authorize).
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for a `mining.submit` response before calling the
/// outcome indeterminate.
pub const SUBMIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Most pools never answer `mining.suggest_difficulty` directly.
pub const SUGGEST_TIMEOUT: Duration = Duration::from_secs(3);

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);

pub const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// Bound on waiting for share responses at shutdown.
pub const SHUTDOWN_FLUSH: Duration = Duration::from_secs(2);
