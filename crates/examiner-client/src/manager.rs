//! Connection manager: trust bootstrap and secure reconnect.
//!
//! ```text
//! Idle ─start─▶ ConnectingInsecure ─opened─▶ AwaitingCertSigning
//!                     │                             │ signed
//!                  failed                           ▼
//!                     ▼                      ConnectingSecure ◀──timer── Retrying
//!          Stopped(BootstrapFailed)            │ opened   │ failed         ▲
//!                                              ▼          └───────────────-┤
//!                                          Connected ──────failed──────────┘
//! ```
//!
//! Every bootstrap starts by purging local keys, then asks the desktop to sign
//! a fresh CSR over the insecure channel. Once the secure channel is up, all
//! inbound messages go to the [`MessageHandler`]. A secure failure schedules a
//! reconnect after `retry_delay`; after `retry_limit` consecutive failed
//! reconnects the manager stops with [`StopReason::RetriesExhausted`].
//!
//! All transitions happen on one task. Channel events carry a
//! [`ChannelTag`]; events from a channel that is no longer current are
//! dropped, so late callbacks from a torn-down channel cannot move the state.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use examiner_core::messages::{SignCertificateRequest, SignCertificateResponse};
use examiner_core::transport::send_json;
use examiner_core::{
    decode_json, ChannelEvent, ChannelEvents, ChannelRole, ChannelTag, ConnectionParameters,
    ExaminerConfig, ExaminerError, ExaminerResult, MessageHandler, TaggedEvent,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

use crate::certificate::{CertificateAuthority, DeviceIdentity};
use crate::transport::{Transport, TransportFactory};

/// Why the manager stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `stop` was called.
    Requested,
    /// The insecure channel failed before a certificate was obtained.
    BootstrapFailed,
    /// The secure channel kept failing past the retry limit.
    RetriesExhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Idle,
    ConnectingInsecure,
    AwaitingCertSigning,
    ConnectingSecure,
    Connected,
    Retrying,
    Stopped(StopReason),
}

/// Snapshot published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    /// Identifier the desktop assigned when it signed our certificate.
    pub device_id: Option<String>,
    /// Consecutive failed secure reconnects; reset when the channel opens.
    pub secure_retry_count: u32,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Idle,
            device_id: None,
            secure_retry_count: 0,
        }
    }
}

impl ConnectionState {
    pub fn is_stopped(&self) -> bool {
        matches!(self.phase, ConnectionPhase::Stopped(_))
    }
}

struct Running {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Owns the outbound channels and drives the bootstrap state machine.
pub struct ConnectionManager {
    config: ExaminerConfig,
    factory: Arc<dyn TransportFactory>,
    authority: Arc<dyn CertificateAuthority>,
    state: Arc<watch::Sender<ConnectionState>>,
    running: Mutex<Option<Running>>,
}

impl ConnectionManager {
    pub fn new(
        config: ExaminerConfig,
        factory: Arc<dyn TransportFactory>,
        authority: Arc<dyn CertificateAuthority>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::default());
        Self {
            config,
            factory,
            authority,
            state: Arc::new(state),
            running: Mutex::new(None),
        }
    }

    /// Begin a fresh bootstrap. Must be called from within a tokio runtime.
    ///
    /// Fails if the manager is already running; a stopped manager may be
    /// started again.
    pub fn start(&self, handler: Arc<dyn MessageHandler>) -> ExaminerResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| ExaminerError::Other("start requires a tokio runtime".into()))?;

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.as_ref().is_some_and(|r| !r.task.is_finished()) {
            return Err(ExaminerError::Other("connection manager already started".into()));
        }

        self.state.send_replace(ConnectionState::default());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let machine = StateMachine {
            config: self.config.clone(),
            factory: self.factory.clone(),
            authority: self.authority.clone(),
            handler,
            state: self.state.clone(),
            events_tx,
            insecure: None,
            secure: None,
            identity: None,
            attempts: 0,
        };
        let task = runtime.spawn(machine.run(events_rx, stop_rx));
        *running = Some(Running { stop_tx, task });
        Ok(())
    }

    /// Stop all channels and cancel any pending reconnect. Returns once the
    /// manager has reached `Stopped`.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match running {
            Some(Running { stop_tx, task }) => {
                let _ = stop_tx.send(());
                if let Err(e) = task.await {
                    warn!("connection manager task ended abnormally: {e}");
                    self.state
                        .send_modify(|s| s.phase = ConnectionPhase::Stopped(StopReason::Requested));
                }
            }
            None => {
                // Never started: stopping still ends in `Stopped`.
                self.state.send_if_modified(|s| {
                    if s.is_stopped() {
                        return false;
                    }
                    s.phase = ConnectionPhase::Stopped(StopReason::Requested);
                    true
                });
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Wait until the manager reaches `Stopped` and return why.
    pub async fn wait_stopped(&self) -> StopReason {
        let mut rx = self.state.subscribe();
        let result = rx.wait_for(ConnectionState::is_stopped).await;
        match result.map(|s| s.phase) {
            Ok(ConnectionPhase::Stopped(reason)) => reason,
            _ => StopReason::Requested,
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(running) = self
            .running
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = running.stop_tx.send(());
        }
    }
}

struct ActiveChannel {
    tag: ChannelTag,
    transport: Box<dyn Transport>,
}

impl ActiveChannel {
    fn stop(mut self) {
        self.transport.stop();
    }
}

struct StateMachine {
    config: ExaminerConfig,
    factory: Arc<dyn TransportFactory>,
    authority: Arc<dyn CertificateAuthority>,
    handler: Arc<dyn MessageHandler>,
    state: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::UnboundedSender<TaggedEvent>,
    insecure: Option<ActiveChannel>,
    secure: Option<ActiveChannel>,
    identity: Option<DeviceIdentity>,
    attempts: u32,
}

impl StateMachine {
    async fn run(
        mut self,
        mut events_rx: mpsc::UnboundedReceiver<TaggedEvent>,
        mut stop_rx: oneshot::Receiver<()>,
    ) {
        let retry = time::sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut retry_armed = false;

        self.start_bootstrap();
        let mut next_retry = None;

        loop {
            if let Some(delay) = next_retry.take() {
                retry.as_mut().reset(Instant::now() + delay);
                retry_armed = true;
            }
            if self.is_stopped() {
                break;
            }

            tokio::select! {
                _ = &mut stop_rx => {
                    self.shutdown(StopReason::Requested);
                    break;
                }
                Some(event) = events_rx.recv() => {
                    next_retry = self.on_event(event);
                }
                () = &mut retry, if retry_armed => {
                    retry_armed = false;
                    next_retry = self.open_secure();
                }
            }
        }
        debug!("connection manager loop exited");
    }

    fn phase(&self) -> ConnectionPhase {
        self.state.borrow().phase
    }

    fn is_stopped(&self) -> bool {
        self.state.borrow().is_stopped()
    }

    fn set_phase(&self, phase: ConnectionPhase) {
        debug!(?phase, "connection phase");
        self.state.send_modify(|s| s.phase = phase);
    }

    fn next_tag(&mut self, role: ChannelRole) -> ChannelTag {
        self.attempts += 1;
        ChannelTag {
            role,
            attempt: self.attempts,
        }
    }

    fn params(&self) -> ConnectionParameters {
        let device_id = self.state.borrow().device_id.clone().unwrap_or_default();
        ConnectionParameters::for_device(&self.config, device_id)
    }

    fn start_bootstrap(&mut self) {
        if let Err(e) = self.authority.purge_local_keys() {
            warn!("failed to purge local keys: {e}");
        }
        self.identity = None;
        self.state.send_modify(|s| s.device_id = None);

        let tag = self.next_tag(ChannelRole::Insecure);
        let events = ChannelEvents::new(tag, self.events_tx.clone());
        let params = self.params();
        info!(
            host = %self.config.host,
            port = self.config.insecure_port,
            "starting certificate bootstrap"
        );
        self.set_phase(ConnectionPhase::ConnectingInsecure);

        match self.factory.open_insecure(&params, events) {
            Ok(transport) => self.insecure = Some(ActiveChannel { tag, transport }),
            Err(e) => {
                error!("failed to open insecure channel: {e}");
                self.shutdown(StopReason::BootstrapFailed);
            }
        }
    }

    fn on_event(&mut self, TaggedEvent { tag, event }: TaggedEvent) -> Option<Duration> {
        let current = match tag.role {
            ChannelRole::Insecure => self.insecure.as_ref().map(|c| c.tag),
            ChannelRole::Secure => self.secure.as_ref().map(|c| c.tag),
        };
        if current != Some(tag) {
            debug!(channel = %tag.role, attempt = tag.attempt, "ignoring event from stale channel");
            return None;
        }

        match tag.role {
            ChannelRole::Insecure => self.on_insecure_event(event),
            ChannelRole::Secure => self.on_secure_event(event),
        }
    }

    fn on_insecure_event(&mut self, event: ChannelEvent) -> Option<Duration> {
        match event {
            ChannelEvent::Opened => {
                if self.phase() == ConnectionPhase::ConnectingInsecure {
                    if let Err(e) = self.request_signing() {
                        error!("certificate signing request failed: {e}");
                    }
                }
                None
            }
            ChannelEvent::Message(data) => {
                if self.phase() != ConnectionPhase::AwaitingCertSigning {
                    debug!("ignoring insecure message outside of signing");
                    return None;
                }
                // Not retried on error: the engine stays here until restarted.
                self.complete_signing(&data).unwrap_or_else(|e| {
                    error!("certificate signing failed: {e}");
                    None
                })
            }
            ChannelEvent::Failed(reason) => {
                error!("insecure channel failed: {reason}");
                self.shutdown(StopReason::BootstrapFailed);
                None
            }
        }
    }

    fn request_signing(&mut self) -> ExaminerResult<()> {
        let csr = self.authority.generate_csr(&self.config.app_id)?;
        let request = SignCertificateRequest::new(csr, self.authority.destination());
        let channel = self.insecure.as_ref().ok_or(ExaminerError::ChannelClosed)?;
        send_json(channel.transport.sink().as_ref(), &request)?;
        info!("sent certificate signing request");
        self.set_phase(ConnectionPhase::AwaitingCertSigning);
        Ok(())
    }

    fn complete_signing(&mut self, data: &[u8]) -> ExaminerResult<Option<Duration>> {
        if let Some(channel) = self.insecure.take() {
            channel.stop();
        }

        let response: SignCertificateResponse = decode_json(data)?;
        self.authority.import_signed_certificate()?;
        let identity = self.authority.device_identity()?;

        info!(device_id = %response.device_id, "certificate signed");
        self.identity = Some(identity);
        self.state
            .send_modify(|s| s.device_id = Some(response.device_id));
        Ok(self.open_secure())
    }

    /// Open a new secure channel, replacing any current one.
    fn open_secure(&mut self) -> Option<Duration> {
        if let Some(channel) = self.secure.take() {
            channel.stop();
        }
        let Some(identity) = self.identity.clone() else {
            warn!("secure channel requested without a device identity");
            return None;
        };

        let tag = self.next_tag(ChannelRole::Secure);
        let events = ChannelEvents::new(tag, self.events_tx.clone());
        let params = self.params();
        self.set_phase(ConnectionPhase::ConnectingSecure);

        match self.factory.open_secure(&params, &identity, events) {
            Ok(transport) => {
                self.secure = Some(ActiveChannel { tag, transport });
                None
            }
            Err(e) => self.secure_failed(&format!("failed to open secure channel: {e}")),
        }
    }

    fn on_secure_event(&mut self, event: ChannelEvent) -> Option<Duration> {
        match event {
            ChannelEvent::Opened => {
                info!("secure channel connected");
                self.state.send_modify(|s| {
                    s.phase = ConnectionPhase::Connected;
                    s.secure_retry_count = 0;
                });
                None
            }
            ChannelEvent::Message(data) => {
                if let Some(channel) = &self.secure {
                    self.handler.handle_message(&data, channel.transport.sink());
                }
                None
            }
            ChannelEvent::Failed(reason) => self.secure_failed(&reason),
        }
    }

    fn secure_failed(&mut self, reason: &str) -> Option<Duration> {
        if let Some(channel) = self.secure.take() {
            channel.stop();
        }

        let (count, has_device_id) = {
            let state = self.state.borrow();
            (state.secure_retry_count, state.device_id.is_some())
        };
        let limit = self.config.secure_retry_limit();
        if count >= limit || !has_device_id {
            warn!(attempts = count, "secure channel failed: {reason}; giving up");
            self.shutdown(StopReason::RetriesExhausted);
            return None;
        }

        let delay = self.config.retry_delay();
        warn!(
            retry = count + 1,
            limit,
            delay_ms = delay.as_millis() as u64,
            "secure channel failed: {reason}; scheduling reconnect"
        );
        self.state.send_modify(|s| {
            s.phase = ConnectionPhase::Retrying;
            s.secure_retry_count += 1;
        });
        Some(delay)
    }

    fn shutdown(&mut self, reason: StopReason) {
        if let Some(channel) = self.insecure.take() {
            channel.stop();
        }
        if let Some(channel) = self.secure.take() {
            channel.stop();
        }
        info!(?reason, "connection manager stopped");
        self.set_phase(ConnectionPhase::Stopped(reason));
    }
}
