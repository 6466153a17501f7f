//! Stratum v1 client implementation.
//!
//! The client owns the connection lifecycle: dial, handshake, message loop,
//! and reconnect with backoff when anything goes wrong. It never gives up on
//! its own; only the shutdown token stops it.
//!
//! ```text
//! Disconnected -> Connecting -> Subscribed -> Authorized -> Running
//!                     ^                                        |
//!                     +------------- (fault, backoff) ---------+
//! ```
//!
//! Every successful subscribe starts a new [`SessionId`]. Submissions carry
//! the session they were found under and are dropped unsent if it has since
//! been replaced: a new session means a new extranonce1, so old work is void.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use strum::Display;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use super::backoff::Backoff;
use super::connection::{Connector, PoolUrl, Transport};
use super::error::{StratumError, StratumResult};
use super::messages::{
    error_reason, ClientCommand, ClientEvent, JobNotification, JsonRpcMessage, SubmitParams,
};
use super::{
    HANDSHAKE_TIMEOUT, RECONNECT_INITIAL, RECONNECT_MAX, SHUTDOWN_FLUSH, SUBMIT_TIMEOUT,
    SUGGEST_TIMEOUT, VERSION_ROLLING_MASK,
};
use crate::error::ErrorKind;
use crate::job_source::{SessionId, ShareOutcome};
use crate::tracing::prelude::*;
use crate::types::Difficulty;

/// Pool connection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub url: PoolUrl,

    /// Worker username
    pub username: String,

    /// Worker password. Sent as-is; pools mostly ignore it.
    pub password: String,

    pub user_agent: String,

    /// Difficulty hint sent after authorize
    pub suggest_difficulty: Option<Difficulty>,
}

impl PoolConfig {
    pub fn new(url: PoolUrl, username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            url,
            username: username.into(),
            password: password.into(),
            user_agent: format!("mujina-stratum/{}", env!("CARGO_PKG_VERSION")),
            suggest_difficulty: None,
        }
    }
}

/// Where the client is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Subscribed,
    Authorized,
    Running,
}

/// Everything the pool told us during one session.
///
/// Replaced wholesale on reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionState {
    pub session: SessionId,

    /// Subscription id for `mining.notify`, if the pool sent one
    pub subscription_id: Option<String>,

    pub extranonce1: Vec<u8>,

    pub extranonce2_size: u8,

    pub version_mask: Option<u32>,

    /// Latest `mining.set_difficulty`
    pub difficulty: Option<Difficulty>,
}

#[derive(Debug)]
struct PendingSubmit {
    job_id: String,
    nonce: u32,
    deadline: Instant,
}

/// Stratum v1 client.
///
/// Pushes [`ClientEvent`]s to its consumer and takes [`ClientCommand`]s from
/// it. Submissions are asynchronous: a submit is written and tracked by
/// request id, and its outcome arrives later as a `ShareResult` event.
pub struct StratumV1Client {
    config: PoolConfig,

    connector: Arc<dyn Connector>,

    event_tx: mpsc::Sender<ClientEvent>,

    command_rx: mpsc::UnboundedReceiver<ClientCommand>,

    shutdown: CancellationToken,

    /// Auto-incrementing message ID, unique across sessions
    next_id: u64,

    phase: ConnectionState,

    session: Option<SessionState>,

    /// Most recently issued session id
    last_session: SessionId,

    /// Submissions awaiting a response, by request id
    pending: HashMap<u64, PendingSubmit>,

    /// Notifications that arrived before the subscribe result, replayed
    /// once the session is announced
    early: Vec<(String, Value)>,
}

impl StratumV1Client {
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        event_tx: mpsc::Sender<ClientEvent>,
        command_rx: mpsc::UnboundedReceiver<ClientCommand>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            connector,
            event_tx,
            command_rx,
            shutdown,
            next_id: 1,
            phase: ConnectionState::Disconnected,
            session: None,
            last_session: 0,
            pending: HashMap::new(),
            early: Vec::new(),
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn set_phase(&mut self, phase: ConnectionState) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "Session state");
            self.phase = phase;
        }
    }

    async fn emit(&self, event: ClientEvent) -> StratumResult<()> {
        self.event_tx
            .send(event)
            .await
            .map_err(|_| StratumError::Disconnected)
    }

    /// Run until shutdown, reconnecting as needed.
    pub async fn run(mut self) -> StratumResult<()> {
        info!(
            pool = %self.config.url,
            user = %self.config.username,
            "Starting Stratum v1 client"
        );

        let mut backoff = Backoff::new(RECONNECT_INITIAL, RECONNECT_MAX);

        loop {
            self.set_phase(ConnectionState::Connecting);

            let connector = self.connector.clone();
            let connected = tokio::select! {
                result = connector.connect(&self.config.url) => result,
                _ = self.shutdown.cancelled() => break,
            };

            match connected {
                Ok(mut transport) => {
                    info!(pool = %self.config.url, "Connected to pool");
                    let result = self.run_session(&mut *transport, &mut backoff).await;
                    self.end_session().await;

                    match result {
                        Ok(()) => break,
                        Err(e) if e.kind() == ErrorKind::Connection => {
                            warn!(pool = %self.config.url, error = %e, "Lost connection to pool");
                        }
                        Err(e) => {
                            warn!(pool = %self.config.url, error = %e, "Protocol error, dropping session");
                        }
                    }
                }
                Err(e) => {
                    warn!(pool = %self.config.url, error = %e, "Failed to connect to pool");
                }
            }

            if self.shutdown.is_cancelled() {
                break;
            }
            if self.event_tx.is_closed() {
                debug!("Event consumer gone, stopping client");
                break;
            }

            let delay = backoff.next_delay();
            info!(delay_secs = delay.as_secs(), "Reconnecting to pool");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        self.set_phase(ConnectionState::Disconnected);
        info!("Stratum v1 client stopped");
        Ok(())
    }

    /// One connection: handshake, then the message loop.
    ///
    /// Returns `Ok(())` only on shutdown.
    async fn run_session(
        &mut self,
        conn: &mut dyn Transport,
        backoff: &mut Backoff,
    ) -> StratumResult<()> {
        self.handshake(conn).await?;
        backoff.reset();
        self.set_phase(ConnectionState::Running);

        loop {
            let deadline = self.pending.values().map(|p| p.deadline).min();

            tokio::select! {
                msg = conn.read_message() => {
                    match msg {
                        Ok(Some(msg)) => self.handle_message(msg).await?,
                        Ok(None) => {
                            info!("Connection closed by pool");
                            return Err(StratumError::Disconnected);
                        }
                        Err(StratumError::InvalidMessage(e)) => {
                            // Some pools send error responses with a null id
                            warn!(error = %e, "Ignoring malformed message from pool");
                        }
                        Err(e) => return Err(e),
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        ClientCommand::SubmitShare(params) => self.submit(conn, params).await?,
                    }
                }

                _ = sleep_until(deadline) => {
                    self.expire_pending(Instant::now()).await?;
                }

                _ = self.shutdown.cancelled() => {
                    self.flush(conn).await;
                    return Ok(());
                }
            }
        }
    }

    /// Configure, subscribe, authorize, and optionally suggest difficulty.
    async fn handshake(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        self.early.clear();
        let version_mask = self.configure_version_rolling(conn).await?;

        let (subscription_id, extranonce1, extranonce2_size) = self.subscribe(conn).await?;

        self.last_session += 1;
        let session = self.last_session;
        self.session = Some(SessionState {
            session,
            subscription_id,
            extranonce1: extranonce1.clone(),
            extranonce2_size,
            version_mask,
            difficulty: None,
        });
        self.set_phase(ConnectionState::Subscribed);

        info!(
            session,
            extranonce1 = %hex::encode(&extranonce1),
            extranonce2_size,
            version_mask = ?version_mask.map(|m| format!("{m:#010x}")),
            "Subscribed to pool"
        );
        self.emit(ClientEvent::Subscribed {
            session,
            extranonce1,
            extranonce2_size,
            version_mask,
        })
        .await?;

        // A difficulty sent ahead of the subscribe result belongs to this
        // session and must reach the consumer after it.
        for (method, params) in std::mem::take(&mut self.early) {
            self.handle_notification(&method, &params).await?;
        }

        self.authorize(conn).await?;
        self.set_phase(ConnectionState::Authorized);
        info!(user = %self.config.username, "Authorized with pool");
        self.emit(ClientEvent::Authorized { session }).await?;

        if let Some(difficulty) = self.config.suggest_difficulty {
            self.suggest_difficulty(conn, difficulty).await?;
        }

        Ok(())
    }

    /// Drop session state after the connection ended.
    ///
    /// Outstanding submissions can no longer be answered and are reported
    /// indeterminate. The consumer may already be gone, so send errors are
    /// ignored here.
    async fn end_session(&mut self) {
        for (_, pending) in self.pending.drain().collect::<Vec<_>>() {
            warn!(job_id = %pending.job_id, "Connection ended before share response");
            let _ = self
                .emit(ClientEvent::ShareResult {
                    job_id: pending.job_id,
                    nonce: pending.nonce,
                    outcome: ShareOutcome::Indeterminate,
                })
                .await;
        }

        if self.session.take().is_some() {
            let _ = self.emit(ClientEvent::Disconnected).await;
        }
        self.set_phase(ConnectionState::Disconnected);
    }

    /// Send a request and wait for its response.
    ///
    /// Notifications arriving in between are handled inline, which is how
    /// jobs and difficulty sent right after subscribe reach the consumer.
    /// Before the subscribe result they are held back instead.
    async fn send_request(
        &mut self,
        conn: &mut dyn Transport,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> StratumResult<(Option<Value>, Option<Value>)> {
        let id = self.next_id();
        conn.write_message(&JsonRpcMessage::request(id, method, params))
            .await?;

        let wait = async {
            loop {
                tokio::select! {
                    msg = conn.read_message() => {
                        match msg {
                            Ok(Some(JsonRpcMessage::Response { id: resp_id, result, error }))
                                if resp_id == id =>
                            {
                                return Ok((result, error));
                            }
                            Ok(Some(JsonRpcMessage::Response { id: other, .. })) => {
                                debug!(msg_id = other, method, "Ignoring response to other request");
                            }
                            Ok(Some(JsonRpcMessage::Request { method, params, .. })) => {
                                if self.session.is_some() {
                                    self.handle_notification(&method, &params).await?;
                                } else {
                                    trace!(method = %method, "Holding notification until subscribed");
                                    self.early.push((method, params));
                                }
                            }
                            Ok(None) => return Err(StratumError::Disconnected),
                            Err(StratumError::InvalidMessage(e)) => {
                                warn!(error = %e, "Ignoring malformed message from pool");
                            }
                            Err(e) => return Err(e),
                        }
                    }

                    _ = self.shutdown.cancelled() => {
                        return Err(StratumError::Disconnected);
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| StratumError::Timeout)?
    }

    /// Request version rolling with `mining.configure`.
    ///
    /// An optional extension: an error result, a declined request, or no
    /// answer at all just means mining without version rolling.
    async fn configure_version_rolling(
        &mut self,
        conn: &mut dyn Transport,
    ) -> StratumResult<Option<u32>> {
        let result = self
            .send_request(
                conn,
                "mining.configure",
                json!([
                    ["version-rolling"],
                    {"version-rolling.mask": format!("{:08x}", VERSION_ROLLING_MASK)}
                ]),
                HANDSHAKE_TIMEOUT,
            )
            .await;

        let result = match result {
            Ok((Some(result), None)) => result,
            Ok((_, Some(error))) => {
                debug!(error = %error_reason(&error), "Pool doesn't support mining.configure");
                return Ok(None);
            }
            Ok((None, None)) => return Ok(None),
            Err(StratumError::Timeout) => {
                debug!("Pool didn't answer mining.configure");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let accepted = result
            .get("version-rolling")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !accepted {
            debug!("Pool declined version rolling");
            return Ok(None);
        }

        let mask = result
            .get("version-rolling.mask")
            .and_then(Value::as_str)
            .ok_or_else(|| StratumError::InvalidMessage("missing version-rolling.mask".into()))
            .and_then(|s| {
                u32::from_str_radix(s.trim_start_matches("0x"), 16)
                    .map_err(|_| StratumError::InvalidMessage(format!("bad version mask {s:?}")))
            })?;

        debug!(mask = format!("{mask:#010x}"), "Pool authorized version rolling");
        Ok(Some(mask))
    }

    /// Subscribe; returns subscription id, extranonce1 and extranonce2 size.
    async fn subscribe(
        &mut self,
        conn: &mut dyn Transport,
    ) -> StratumResult<(Option<String>, Vec<u8>, u8)> {
        let user_agent = self.config.user_agent.clone();
        let (result, error) = self
            .send_request(conn, "mining.subscribe", json!([user_agent]), HANDSHAKE_TIMEOUT)
            .await?;

        if let Some(error) = error {
            return Err(StratumError::SubscriptionFailed(error_reason(&error)));
        }
        let result = result
            .ok_or_else(|| StratumError::UnexpectedResponse("empty subscribe result".into()))?;

        // [[[method, subscription_id], ...], extranonce1, extranonce2_size]
        let arr = result
            .as_array()
            .filter(|arr| arr.len() >= 3)
            .ok_or_else(|| StratumError::InvalidMessage(format!("subscribe result {result}")))?;

        let subscription_id = arr[0].as_array().and_then(|subs| {
            subs.iter()
                .filter_map(Value::as_array)
                .find(|pair| pair.first().and_then(Value::as_str) == Some("mining.notify"))
                .and_then(|pair| pair.get(1))
                .and_then(Value::as_str)
                .map(str::to_string)
        });

        let extranonce1 = arr[1]
            .as_str()
            .ok_or_else(|| StratumError::InvalidMessage("extranonce1 not a string".into()))
            .and_then(|s| {
                hex::decode(s)
                    .map_err(|e| StratumError::InvalidMessage(format!("extranonce1 hex: {e}")))
            })?;

        let extranonce2_size = arr[2]
            .as_u64()
            .filter(|size| (1..=8).contains(size))
            .ok_or_else(|| {
                StratumError::InvalidMessage(format!("extranonce2_size {} not in 1..=8", arr[2]))
            })? as u8;

        Ok((subscription_id, extranonce1, extranonce2_size))
    }

    /// Authorize. A refusal ends the session; the reconnect loop retries.
    async fn authorize(&mut self, conn: &mut dyn Transport) -> StratumResult<()> {
        let params = json!([self.config.username, self.config.password]);
        let (result, error) = self
            .send_request(conn, "mining.authorize", params, HANDSHAKE_TIMEOUT)
            .await?;

        match (result, error) {
            (_, Some(error)) => Err(StratumError::AuthorizationFailed(error_reason(&error))),
            (Some(Value::Bool(true)), None) => Ok(()),
            _ => Err(StratumError::AuthorizationFailed(
                "pool returned false".into(),
            )),
        }
    }

    /// Send `mining.suggest_difficulty` as a request.
    ///
    /// Pools that honor it answer with `mining.set_difficulty`, usually
    /// without responding to the request itself, so a timeout is expected
    /// and not an error.
    async fn suggest_difficulty(
        &mut self,
        conn: &mut dyn Transport,
        difficulty: Difficulty,
    ) -> StratumResult<()> {
        let value = difficulty.value();
        let param = if value.fract() == 0.0 && value < (1u64 << 53) as f64 {
            json!(value as u64)
        } else {
            json!(value)
        };

        match self
            .send_request(conn, "mining.suggest_difficulty", json!([param]), SUGGEST_TIMEOUT)
            .await
        {
            Ok(_) => debug!(%difficulty, "Pool answered suggest_difficulty"),
            Err(StratumError::Timeout) => {
                debug!(%difficulty, "No answer to suggest_difficulty")
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    async fn handle_message(&mut self, msg: JsonRpcMessage) -> StratumResult<()> {
        match msg {
            JsonRpcMessage::Request { method, params, .. } => {
                self.handle_notification(&method, &params).await
            }
            JsonRpcMessage::Response { id, result, error } => {
                self.resolve_submit(id, result, error).await
            }
        }
    }

    /// Handle a notification from the pool.
    async fn handle_notification(&mut self, method: &str, params: &Value) -> StratumResult<()> {
        match method {
            "mining.notify" => self.handle_mining_notify(params).await,
            "mining.set_difficulty" => self.handle_set_difficulty(params).await,
            "mining.set_version_mask" => self.handle_set_version_mask(params).await,
            "client.reconnect" => Err(StratumError::ReconnectRequested),
            "client.show_message" => {
                info!(message = %params, "Message from pool");
                Ok(())
            }
            _ => {
                debug!(method, "Ignoring unknown notification");
                Ok(())
            }
        }
    }

    async fn handle_mining_notify(&mut self, params: &Value) -> StratumResult<()> {
        let arr = params.as_array().ok_or_else(|| {
            StratumError::InvalidMessage("mining.notify params not an array".into())
        })?;

        let job = JobNotification::from_stratum_params(arr)
            .map_err(|e| StratumError::InvalidMessage(format!("mining.notify: {e}")))?;

        debug!(job_id = %job.job_id, clean_jobs = job.clean_jobs, "Job from pool");
        self.emit(ClientEvent::NewJob(job)).await
    }

    async fn handle_set_difficulty(&mut self, params: &Value) -> StratumResult<()> {
        let difficulty = params
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                StratumError::InvalidMessage(format!("set_difficulty params {params}"))
            })?;

        let difficulty = Difficulty::new(difficulty)
            .map_err(|e| StratumError::InvalidMessage(format!("set_difficulty: {e}")))?;

        if let Some(state) = &mut self.session {
            state.difficulty = Some(difficulty);
        }

        info!(%difficulty, "Pool difficulty set");
        self.emit(ClientEvent::DifficultyChanged(difficulty)).await
    }

    async fn handle_set_version_mask(&mut self, params: &Value) -> StratumResult<()> {
        let mask_str = params
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StratumError::InvalidMessage(format!("set_version_mask params {params}"))
            })?;

        let mask = u32::from_str_radix(mask_str.trim_start_matches("0x"), 16)
            .map_err(|_| StratumError::InvalidMessage(format!("version mask {mask_str:?}")))?;

        if let Some(state) = &mut self.session {
            state.version_mask = Some(mask);
        }

        debug!(mask = format!("{mask:#010x}"), "Version mask set");
        self.emit(ClientEvent::VersionMaskSet(mask)).await
    }

    /// Write a `mining.submit` and start tracking its response.
    async fn submit(&mut self, conn: &mut dyn Transport, params: SubmitParams) -> StratumResult<()> {
        let current = self.session.as_ref().map(|s| s.session);
        if current != Some(params.session) {
            info!(
                job_id = %params.job_id,
                share_session = params.session,
                "Dropping share from an earlier session"
            );
            return self
                .emit(ClientEvent::ShareResult {
                    job_id: params.job_id,
                    nonce: params.nonce,
                    outcome: ShareOutcome::NotSent("session ended".into()),
                })
                .await;
        }

        let id = self.next_id();
        debug!(
            msg_id = id,
            job_id = %params.job_id,
            nonce = format!("{:#010x}", params.nonce),
            "Submitting share"
        );

        // Tracked before writing: if the write fails half-way, the pool may
        // still have seen it.
        self.pending.insert(
            id,
            PendingSubmit {
                job_id: params.job_id.clone(),
                nonce: params.nonce,
                deadline: Instant::now() + SUBMIT_TIMEOUT,
            },
        );

        let msg = JsonRpcMessage::request(id, "mining.submit", Value::Array(params.to_stratum_json()));
        conn.write_message(&msg).await
    }

    async fn resolve_submit(
        &mut self,
        id: u64,
        result: Option<Value>,
        error: Option<Value>,
    ) -> StratumResult<()> {
        let Some(pending) = self.pending.remove(&id) else {
            debug!(msg_id = id, "Response to unknown request");
            return Ok(());
        };

        let outcome = match (result, error) {
            (_, Some(error)) => ShareOutcome::Rejected(error_reason(&error)),
            (Some(Value::Bool(true)), None) => ShareOutcome::Accepted,
            _ => ShareOutcome::Rejected("pool returned false".into()),
        };

        match &outcome {
            ShareOutcome::Accepted => info!(job_id = %pending.job_id, "Share accepted"),
            ShareOutcome::Rejected(reason) => {
                info!(job_id = %pending.job_id, %reason, "Share rejected")
            }
            _ => {}
        }

        self.emit(ClientEvent::ShareResult {
            job_id: pending.job_id,
            nonce: pending.nonce,
            outcome,
        })
        .await
    }

    /// Give up on submissions whose deadline has passed.
    async fn expire_pending(&mut self, now: Instant) -> StratumResult<()> {
        let expired: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                warn!(job_id = %pending.job_id, msg_id = id, "No response to share, outcome unknown");
                self.emit(ClientEvent::ShareResult {
                    job_id: pending.job_id,
                    nonce: pending.nonce,
                    outcome: ShareOutcome::Indeterminate,
                })
                .await?;
            }
        }
        Ok(())
    }

    /// Best-effort wait for outstanding submit responses at shutdown.
    async fn flush(&mut self, conn: &mut dyn Transport) {
        if self.pending.is_empty() {
            return;
        }
        debug!(pending = self.pending.len(), "Waiting for share responses before closing");

        let drain = async {
            while !self.pending.is_empty() {
                match conn.read_message().await {
                    Ok(Some(JsonRpcMessage::Response { id, result, error })) => {
                        if self.resolve_submit(id, result, error).await.is_err() {
                            break;
                        }
                    }
                    Ok(Some(_)) | Err(StratumError::InvalidMessage(_)) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        };

        if tokio::time::timeout(SHUTDOWN_FLUSH, drain).await.is_err() {
            debug!(pending = self.pending.len(), "Share responses still outstanding at close");
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum_v1::connection::{MockConnector, MockTransport, MockTransportHandle};

    struct Harness {
        events: mpsc::Receiver<ClientEvent>,
        commands: mpsc::UnboundedSender<ClientCommand>,
        shutdown: CancellationToken,
        connector: Arc<MockConnector>,
        task: tokio::task::JoinHandle<StratumResult<()>>,
    }

    fn test_config() -> PoolConfig {
        PoolConfig::new(
            "stratum+tcp://pool.test:3333".parse().unwrap(),
            "worker",
            "x",
        )
    }

    fn start(config: PoolConfig, transports: Vec<MockTransport>) -> Harness {
        let (event_tx, events) = mpsc::channel(64);
        let (commands, command_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let connector = Arc::new(MockConnector::new(transports));

        let client = StratumV1Client::new(
            config,
            connector.clone(),
            event_tx,
            command_rx,
            shutdown.clone(),
        );
        let task = tokio::spawn(client.run());

        Harness {
            events,
            commands,
            shutdown,
            connector,
            task,
        }
    }

    impl Harness {
        async fn next(&mut self) -> ClientEvent {
            self.events.recv().await.expect("client stopped")
        }

        async fn stop(self) {
            self.shutdown.cancel();
            assert!(self.task.await.unwrap().is_ok());
        }
    }

    /// Pool side of a successful handshake.
    async fn pool_handshake(pool: &mut MockTransportHandle, extranonce1: &str) {
        let (id, params) = pool.expect_request("mining.configure").await;
        assert_eq!(params[1]["version-rolling.mask"], "1fffe000");
        pool.respond(
            id,
            json!({"version-rolling": true, "version-rolling.mask": "1fffe000"}),
        );

        let (id, _) = pool.expect_request("mining.subscribe").await;
        pool.respond(
            id,
            json!([[["mining.set_difficulty", "d1"], ["mining.notify", "n1"]], extranonce1, 4]),
        );

        let (id, params) = pool.expect_request("mining.authorize").await;
        assert_eq!(params, json!(["worker", "x"]));
        pool.respond(id, json!(true));
    }

    async fn expect_connected(h: &mut Harness) -> SessionId {
        let session = match h.next().await {
            ClientEvent::Subscribed { session, .. } => session,
            other => panic!("expected Subscribed, got {other:?}"),
        };
        match h.next().await {
            ClientEvent::Authorized { session: s } => assert_eq!(s, session),
            other => panic!("expected Authorized, got {other:?}"),
        }
        session
    }

    fn submit_params(session: SessionId, job_id: &str, nonce: u32) -> SubmitParams {
        SubmitParams {
            session,
            username: "worker".into(),
            job_id: job_id.into(),
            extranonce2: vec![0, 0, 0, 1],
            ntime: 0x495fab29,
            nonce,
            version_bits: None,
        }
    }

    fn notify_params(job_id: &str, clean: bool) -> Value {
        json!([
            job_id,
            "00".repeat(32),
            "01000000",
            "ffffffff",
            [],
            "20000000",
            "1d00ffff",
            "495fab29",
            clean
        ])
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_then_notifications() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);

        pool_handshake(&mut pool, "08000002").await;
        match h.next().await {
            ClientEvent::Subscribed {
                session,
                extranonce1,
                extranonce2_size,
                version_mask,
            } => {
                assert_eq!(session, 1);
                assert_eq!(extranonce1, vec![0x08, 0, 0, 0x02]);
                assert_eq!(extranonce2_size, 4);
                assert_eq!(version_mask, Some(0x1fff_e000));
            }
            other => panic!("expected Subscribed, got {other:?}"),
        }
        assert!(matches!(
            h.next().await,
            ClientEvent::Authorized { session: 1 }
        ));

        pool.notify("mining.set_difficulty", json!([2048]));
        pool.notify("mining.notify", notify_params("j1", true));
        pool.notify("mining.set_version_mask", json!(["00ffe000"]));

        match h.next().await {
            ClientEvent::DifficultyChanged(d) => assert_eq!(d.value(), 2048.0),
            other => panic!("expected DifficultyChanged, got {other:?}"),
        }
        match h.next().await {
            ClientEvent::NewJob(job) => {
                assert_eq!(job.job_id, "j1");
                assert!(job.clean_jobs);
            }
            other => panic!("expected NewJob, got {other:?}"),
        }
        assert!(matches!(
            h.next().await,
            ClientEvent::VersionMaskSet(0x00ff_e000)
        ));

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn difficulty_before_subscribe_result_follows_subscribed() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);

        let (id, _) = pool.expect_request("mining.configure").await;
        pool.respond(
            id,
            json!({"version-rolling": true, "version-rolling.mask": "1fffe000"}),
        );
        let (id, _) = pool.expect_request("mining.subscribe").await;
        pool.notify("mining.set_difficulty", json!([2048]));
        pool.notify("mining.notify", notify_params("j1", true));
        pool.respond(id, json!([[], "08000002", 4]));

        assert!(matches!(
            h.next().await,
            ClientEvent::Subscribed { session: 1, .. }
        ));
        match h.next().await {
            ClientEvent::DifficultyChanged(d) => assert_eq!(d.value(), 2048.0),
            other => panic!("expected DifficultyChanged, got {other:?}"),
        }
        match h.next().await {
            ClientEvent::NewJob(job) => assert_eq!(job.job_id, "j1"),
            other => panic!("expected NewJob, got {other:?}"),
        }

        let (id, _) = pool.expect_request("mining.authorize").await;
        pool.respond(id, json!(true));
        assert!(matches!(
            h.next().await,
            ClientEvent::Authorized { session: 1 }
        ));

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn fractional_difficulty_is_accepted() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);
        pool_handshake(&mut pool, "00").await;
        expect_connected(&mut h).await;

        pool.notify("mining.set_difficulty", json!([0.5]));
        match h.next().await {
            ClientEvent::DifficultyChanged(d) => assert_eq!(d.value(), 0.5),
            other => panic!("expected DifficultyChanged, got {other:?}"),
        }
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn configure_error_means_no_version_rolling() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);

        let (id, _) = pool.expect_request("mining.configure").await;
        pool.respond_error(id, json!([20, "Method not found", null]));
        let (id, _) = pool.expect_request("mining.subscribe").await;
        pool.respond(id, json!([[], "aa", 8]));
        let (id, _) = pool.expect_request("mining.authorize").await;
        pool.respond(id, json!(true));

        match h.next().await {
            ClientEvent::Subscribed {
                version_mask,
                extranonce2_size,
                ..
            } => {
                assert_eq!(version_mask, None);
                assert_eq!(extranonce2_size, 8);
            }
            other => panic!("expected Subscribed, got {other:?}"),
        }
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn configure_timeout_means_no_version_rolling() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);

        // Never answered; the handshake timeout fires and we move on
        pool.expect_request("mining.configure").await;
        let (id, _) = pool.expect_request("mining.subscribe").await;
        pool.respond(id, json!([[], "aa", 4]));
        let (id, _) = pool.expect_request("mining.authorize").await;
        pool.respond(id, json!(true));

        match h.next().await {
            ClientEvent::Subscribed { version_mask, .. } => assert_eq!(version_mask, None),
            other => panic!("expected Subscribed, got {other:?}"),
        }
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn submit_outcomes_are_correlated_by_id() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);
        pool_handshake(&mut pool, "08000002").await;
        let session = expect_connected(&mut h).await;

        h.commands
            .send(ClientCommand::SubmitShare(submit_params(session, "a", 1)))
            .unwrap();
        h.commands
            .send(ClientCommand::SubmitShare(submit_params(session, "b", 2)))
            .unwrap();

        let (id_a, params_a) = pool.expect_request("mining.submit").await;
        let (id_b, _) = pool.expect_request("mining.submit").await;
        assert_eq!(
            params_a,
            json!(["worker", "a", "00000001", "495fab29", "00000001"])
        );

        // Answer out of order
        pool.respond_error(id_b, json!([23, "Low difficulty share", null]));
        pool.respond(id_a, json!(true));

        match h.next().await {
            ClientEvent::ShareResult { job_id, outcome, .. } => {
                assert_eq!(job_id, "b");
                assert_eq!(outcome, ShareOutcome::Rejected("Low difficulty share".into()));
            }
            other => panic!("expected ShareResult, got {other:?}"),
        }
        match h.next().await {
            ClientEvent::ShareResult {
                job_id,
                nonce,
                outcome,
            } => {
                assert_eq!(job_id, "a");
                assert_eq!(nonce, 1);
                assert_eq!(outcome, ShareOutcome::Accepted);
            }
            other => panic!("expected ShareResult, got {other:?}"),
        }
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_submit_is_indeterminate_and_not_resent() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);
        pool_handshake(&mut pool, "08000002").await;
        let session = expect_connected(&mut h).await;

        let sent_at = Instant::now();
        h.commands
            .send(ClientCommand::SubmitShare(submit_params(session, "a", 7)))
            .unwrap();
        let (id, _) = pool.expect_request("mining.submit").await;

        match h.next().await {
            ClientEvent::ShareResult { outcome, .. } => {
                assert_eq!(outcome, ShareOutcome::Indeterminate)
            }
            other => panic!("expected ShareResult, got {other:?}"),
        }
        assert!(sent_at.elapsed() >= SUBMIT_TIMEOUT);

        // A late answer is ignored, and nothing was resubmitted
        pool.respond(id, json!(true));
        h.shutdown.cancel();
        assert!(h.task.await.unwrap().is_ok());
        assert!(pool.rx_is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_runs_fresh_handshake() {
        let (first, mut pool1) = MockTransport::pair();
        let (second, mut pool2) = MockTransport::pair();
        let mut h = start(test_config(), vec![first, second]);

        pool_handshake(&mut pool1, "01").await;
        let first_session = expect_connected(&mut h).await;

        drop(pool1);
        assert!(matches!(h.next().await, ClientEvent::Disconnected));

        pool_handshake(&mut pool2, "02").await;
        match h.next().await {
            ClientEvent::Subscribed {
                session,
                extranonce1,
                ..
            } => {
                assert!(session > first_session);
                assert_eq!(extranonce1, vec![0x02]);
            }
            other => panic!("expected Subscribed, got {other:?}"),
        }
        assert!(matches!(h.next().await, ClientEvent::Authorized { .. }));
        assert_eq!(h.connector.attempts(), 2);

        // A share from the first session is not sent on the second
        h.commands
            .send(ClientCommand::SubmitShare(submit_params(first_session, "old", 1)))
            .unwrap();
        match h.next().await {
            ClientEvent::ShareResult { job_id, outcome, .. } => {
                assert_eq!(job_id, "old");
                assert!(matches!(outcome, ShareOutcome::NotSent(_)));
            }
            other => panic!("expected ShareResult, got {other:?}"),
        }
        assert!(pool2.rx_is_empty());

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pending_submit_is_indeterminate_on_disconnect() {
        let (first, mut pool1) = MockTransport::pair();
        let mut h = start(test_config(), vec![first]);
        pool_handshake(&mut pool1, "01").await;
        let session = expect_connected(&mut h).await;

        h.commands
            .send(ClientCommand::SubmitShare(submit_params(session, "a", 1)))
            .unwrap();
        pool1.expect_request("mining.submit").await;
        drop(pool1);

        match h.next().await {
            ClientEvent::ShareResult { outcome, .. } => {
                assert_eq!(outcome, ShareOutcome::Indeterminate)
            }
            other => panic!("expected ShareResult, got {other:?}"),
        }
        assert!(matches!(h.next().await, ClientEvent::Disconnected));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn authorization_refusal_reconnects() {
        let (first, mut pool1) = MockTransport::pair();
        let (second, mut pool2) = MockTransport::pair();
        let mut h = start(test_config(), vec![first, second]);

        let (id, _) = pool1.expect_request("mining.configure").await;
        pool1.respond(id, json!({"version-rolling": false}));
        let (id, _) = pool1.expect_request("mining.subscribe").await;
        pool1.respond(id, json!([[], "01", 4]));
        let (id, _) = pool1.expect_request("mining.authorize").await;
        pool1.respond(id, json!(false));

        assert!(matches!(h.next().await, ClientEvent::Subscribed { session: 1, .. }));
        assert!(matches!(h.next().await, ClientEvent::Disconnected));

        // Backoff, then a new connection with a full handshake
        pool_handshake(&mut pool2, "02").await;
        assert!(matches!(h.next().await, ClientEvent::Subscribed { session: 2, .. }));
        assert_eq!(h.connector.attempts(), 2);
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn client_reconnect_drops_session() {
        let (first, mut pool1) = MockTransport::pair();
        let (second, mut pool2) = MockTransport::pair();
        let mut h = start(test_config(), vec![first, second]);

        pool_handshake(&mut pool1, "01").await;
        expect_connected(&mut h).await;

        pool1.notify("client.reconnect", json!([]));
        assert!(matches!(h.next().await, ClientEvent::Disconnected));

        pool_handshake(&mut pool2, "02").await;
        assert!(matches!(h.next().await, ClientEvent::Subscribed { session: 2, .. }));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_notify_drops_session() {
        let (first, mut pool1) = MockTransport::pair();
        let mut h = start(test_config(), vec![first]);

        pool_handshake(&mut pool1, "01").await;
        expect_connected(&mut h).await;

        pool1.notify("mining.notify", json!(["too", "short"]));
        assert!(matches!(h.next().await, ClientEvent::Disconnected));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_back_off_exponentially() {
        let h = start(test_config(), vec![]);
        let started = Instant::now();

        // Attempts at t = 0, 1, 3, 7, 15
        while h.connector.attempts() < 5 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(15));
        assert!(elapsed < Duration::from_secs(16));

        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn suggest_difficulty_after_authorize() {
        let (transport, mut pool) = MockTransport::pair();
        let mut config = test_config();
        config.suggest_difficulty = Some(Difficulty::new(1024.0).unwrap());
        let mut h = start(config, vec![transport]);

        pool_handshake(&mut pool, "01").await;
        let (_, params) = pool.expect_request("mining.suggest_difficulty").await;
        assert_eq!(params, json!([1024]));

        // Pools answer with set_difficulty, not a response
        pool.notify("mining.set_difficulty", json!([1024]));

        expect_connected(&mut h).await;
        assert!(matches!(h.next().await, ClientEvent::DifficultyChanged(_)));
        h.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_briefly_for_share_responses() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);
        pool_handshake(&mut pool, "01").await;
        let session = expect_connected(&mut h).await;

        h.commands
            .send(ClientCommand::SubmitShare(submit_params(session, "a", 1)))
            .unwrap();
        let (id, _) = pool.expect_request("mining.submit").await;

        h.shutdown.cancel();
        pool.respond(id, json!(true));

        match h.next().await {
            ClientEvent::ShareResult { outcome, .. } => assert_eq!(outcome, ShareOutcome::Accepted),
            other => panic!("expected ShareResult, got {other:?}"),
        }
        assert!(matches!(h.next().await, ClientEvent::Disconnected));
        assert!(h.task.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flush_is_bounded() {
        let (transport, mut pool) = MockTransport::pair();
        let mut h = start(test_config(), vec![transport]);
        pool_handshake(&mut pool, "01").await;
        let session = expect_connected(&mut h).await;

        h.commands
            .send(ClientCommand::SubmitShare(submit_params(session, "a", 1)))
            .unwrap();
        pool.expect_request("mining.submit").await;

        let cancelled_at = Instant::now();
        h.shutdown.cancel();

        match h.next().await {
            ClientEvent::ShareResult { outcome, .. } => {
                assert_eq!(outcome, ShareOutcome::Indeterminate)
            }
            other => panic!("expected ShareResult, got {other:?}"),
        }
        assert!(cancelled_at.elapsed() >= SHUTDOWN_FLUSH);
        assert!(cancelled_at.elapsed() < SUBMIT_TIMEOUT);
        assert!(h.task.await.unwrap().is_ok());
    }
}
