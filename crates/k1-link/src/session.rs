//! Device link session.
//!
//! A [`LinkSession`] task exclusively owns the transport, the reconnect
//! backoff, the device status and every timer. Callers talk to it through a
//! cloneable [`LinkHandle`]: each request is a command on an mpsc channel
//! with its own oneshot reply, and commands run strictly one at a time, so
//! uploads are written and acknowledged in submission order.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use k1_core::{make_put_plan, LinkConfig, PutPlan, Tlv, TlvType};

use crate::backoff::Backoff;
use crate::error::{LinkError, TransportError};
use crate::reply::{parse_inventory, AckCode, AckReply, DeviceStatus, PatternEntry};
use crate::transport::{Connector, Inbound, Transport};
use crate::url::DeviceUrl;

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Probing,
    Ready,
    Reconnecting { delay_ms: u64, retry_at: Instant },
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Disconnected => f.write_str("disconnected"),
            LinkState::Connecting => f.write_str("connecting"),
            LinkState::Probing => f.write_str("probing"),
            LinkState::Ready => f.write_str("ready"),
            LinkState::Reconnecting { delay_ms, .. } => write!(f, "reconnecting in {delay_ms} ms"),
        }
    }
}

/// Outcome of one logical upload, after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckReport {
    /// Last reply seen.
    pub reply: AckReply,
    pub attempts: u32,
    pub total_bytes: usize,
    pub crc: u32,
}

impl AckReport {
    pub fn is_ok(&self) -> bool {
        self.reply.is_ok()
    }

    pub fn code(&self) -> &AckCode {
        &self.reply.code
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamReport {
    pub sent: usize,
    pub failed: usize,
    pub cancelled: bool,
    /// Input was longer than the device's frame table.
    pub truncated: bool,
}

/// Cooperative cancellation for [`LinkHandle::stream_sequence`]. Checked
/// before each frame; an upload already in flight always completes.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Commands ──────────────────────────────────────────────────────────────────

enum Command {
    Connect(oneshot::Sender<Result<Option<DeviceStatus>, LinkError>>),
    Send {
        payload: Bytes,
        reply: oneshot::Sender<Result<AckReport, LinkError>>,
    },
    Status(oneshot::Sender<Option<DeviceStatus>>),
    List(oneshot::Sender<Vec<PatternEntry>>),
    Close(oneshot::Sender<()>),
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct LinkHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<LinkState>,
    config: LinkConfig,
}

impl LinkHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| LinkError::SessionClosed)?;
        rx.await.map_err(|_| LinkError::SessionClosed)
    }

    /// Open the link and probe the device. A failed open schedules a
    /// reconnect and returns the connect error.
    pub async fn connect(&self) -> Result<Option<DeviceStatus>, LinkError> {
        self.request(Command::Connect).await?
    }

    /// Upload one payload as a Put Plan and wait for its acknowledgement,
    /// retrying transient failures. Oversize payloads fail before any I/O.
    pub async fn send_and_await_ack(&self, payload: impl Into<Bytes>) -> Result<AckReport, LinkError> {
        let payload = payload.into();
        self.request(|reply| Command::Send { payload, reply }).await?
    }

    /// Re-probe when ready; returns the latest known status.
    pub async fn status(&self) -> Result<Option<DeviceStatus>, LinkError> {
        self.request(Command::Status).await
    }

    /// Query stored patterns. On timeout the previous listing is returned.
    pub async fn list_patterns(&self) -> Result<Vec<PatternEntry>, LinkError> {
        self.request(Command::List).await
    }

    /// Close the link and stop the session task.
    pub async fn close(&self) -> Result<(), LinkError> {
        self.request(Command::Close).await
    }

    /// Upload frames one after another at `fps`, up to the device's
    /// sequence limit.
    pub async fn stream_sequence(
        &self,
        frames: &[Bytes],
        fps: f64,
        cancel: &CancelFlag,
    ) -> Result<StreamReport, LinkError> {
        if !(fps.is_finite() && fps > 0.0) {
            return Err(LinkError::InvalidFps(fps));
        }
        let spacing = Duration::from_millis(((1000.0 / fps).round() as u64).max(1));
        let limit = self.config.max_sequence_frames;

        let mut report = StreamReport {
            truncated: frames.len() > limit,
            ..StreamReport::default()
        };
        if report.truncated {
            tracing::warn!(frames = frames.len(), limit, "sequence truncated");
        }

        for (index, frame) in frames.iter().take(limit).enumerate() {
            if index > 0 {
                tokio::time::sleep(spacing).await;
            }
            if cancel.is_cancelled() {
                tracing::info!(sent = report.sent, "sequence cancelled");
                report.cancelled = true;
                break;
            }
            let ack = self.send_and_await_ack(frame.clone()).await?;
            if ack.is_ok() {
                report.sent += 1;
            } else {
                tracing::warn!(index, code = %ack.code(), "sequence frame failed");
                report.failed += 1;
            }
        }
        Ok(report)
    }

    pub fn state(&self) -> LinkState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }

    /// Time left before the next reconnect attempt, if one is scheduled.
    pub fn reconnect_countdown(&self) -> Option<Duration> {
        match &*self.state.borrow() {
            LinkState::Reconnecting { retry_at, .. } => {
                Some(retry_at.saturating_duration_since(Instant::now()))
            }
            _ => None,
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

enum Event {
    Command(Option<Command>),
    Keepalive,
    StatusRefresh,
    ReconnectDue,
    Inbound(Option<Result<Inbound, TransportError>>),
}

/// Result of waiting for one reply.
enum Wait {
    Message(Inbound),
    TimedOut,
    Lost,
}

pub struct LinkSession {
    url: DeviceUrl,
    config: LinkConfig,
    connector: Arc<dyn Connector>,
    transport: Option<Box<dyn Transport>>,
    backoff: Backoff,
    status: Option<DeviceStatus>,
    chunk_max: usize,
    inventory: Vec<PatternEntry>,
    reconnect_at: Option<Instant>,
    keepalive: Interval,
    refresh: Interval,
    state_tx: watch::Sender<LinkState>,
    commands: mpsc::Receiver<Command>,
}

impl LinkSession {
    /// Spawn a session task for `url`. The link stays down until
    /// [`LinkHandle::connect`]. Must be called from within a tokio runtime.
    pub fn spawn(url: DeviceUrl, config: LinkConfig, connector: Arc<dyn Connector>) -> LinkHandle {
        let backoff = Backoff::from_config(&config);
        Self::spawn_with_backoff(url, config, connector, backoff)
    }

    pub fn spawn_with_backoff(
        url: DeviceUrl,
        config: LinkConfig,
        connector: Arc<dyn Connector>,
        backoff: Backoff,
    ) -> LinkHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let session = LinkSession {
            url,
            chunk_max: config.chunk_max,
            keepalive: periodic(config.keepalive()),
            refresh: periodic(config.status_refresh()),
            config: config.clone(),
            connector,
            transport: None,
            backoff,
            status: None,
            inventory: Vec::new(),
            reconnect_at: None,
            state_tx,
            commands: cmd_rx,
        };
        tokio::spawn(session.run());
        LinkHandle {
            commands: cmd_tx,
            state: state_rx,
            config,
        }
    }

    async fn run(mut self) {
        loop {
            let connected = self.transport.is_some();
            let ready = self.is_ready();
            let reconnect_at = self.reconnect_at;

            let event = tokio::select! {
                cmd = self.commands.recv() => Event::Command(cmd),
                _ = self.keepalive.tick(), if connected => Event::Keepalive,
                _ = self.refresh.tick(), if ready => Event::StatusRefresh,
                _ = sleep_until_opt(reconnect_at), if reconnect_at.is_some() => Event::ReconnectDue,
                msg = next_inbound(&mut self.transport), if connected => Event::Inbound(msg),
            };

            match event {
                Event::Command(None) => {
                    tracing::info!(url = %self.url, "all link handles dropped, session exiting");
                    self.shutdown().await;
                    return;
                }
                Event::Command(Some(Command::Close(reply))) => {
                    tracing::info!(url = %self.url, "link closed");
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                Event::Command(Some(cmd)) => self.handle_command(cmd).await,
                Event::Keepalive => self.keepalive_ping().await,
                Event::StatusRefresh => {
                    tracing::debug!("status refresh");
                    self.probe_status().await;
                }
                Event::ReconnectDue => {
                    tracing::info!(url = %self.url, "reconnecting");
                    let _ = self.open().await;
                }
                Event::Inbound(Some(Ok(msg))) => self.unsolicited(msg),
                Event::Inbound(Some(Err(e))) => self.connection_lost(&e.to_string()),
                Event::Inbound(None) => self.connection_lost("closed by peer"),
            }
        }
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                let result = if self.transport.is_some() {
                    Ok(self.status.clone())
                } else {
                    self.open().await.map(|()| self.status.clone())
                };
                let _ = reply.send(result);
            }
            Command::Send { payload, reply } => {
                let result = self.send_with_retry(&payload).await;
                let _ = reply.send(result);
            }
            Command::Status(reply) => {
                if self.is_ready() {
                    self.probe_status().await;
                }
                let _ = reply.send(self.status.clone());
            }
            Command::List(reply) => {
                let entries = self.list_patterns().await;
                let _ = reply.send(entries);
            }
            // Handled in run().
            Command::Close(reply) => {
                let _ = reply.send(());
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    async fn open(&mut self) -> Result<(), LinkError> {
        self.reconnect_at = None;
        self.set_state(LinkState::Connecting);

        let transport = match self.connector.connect(&self.url).await {
            Ok(t) => t,
            Err(e) => {
                self.connection_lost(&e.to_string());
                return Err(e.into());
            }
        };

        tracing::info!(url = %self.url, "link open");
        self.transport = Some(transport);
        self.backoff.reset();
        self.keepalive.reset();
        self.refresh.reset();

        self.set_state(LinkState::Probing);
        self.probe_status().await;
        if self.transport.is_none() {
            // Lost during the probe; a reconnect is already scheduled.
            return Err(TransportError::Closed.into());
        }
        self.set_state(LinkState::Ready);
        Ok(())
    }

    /// Drop the transport and schedule one reconnect with the next backoff delay.
    fn connection_lost(&mut self, reason: &str) {
        self.transport = None;
        let delay = self.backoff.next_delay();
        let retry_at = Instant::now() + delay;
        let delay_ms = delay.as_millis() as u64;
        self.reconnect_at = Some(retry_at);
        tracing::warn!(url = %self.url, reason, delay_ms, "link lost, reconnect scheduled");
        self.set_state(LinkState::Reconnecting { delay_ms, retry_at });
    }

    async fn shutdown(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                tracing::debug!(error = %e, "close failed");
            }
        }
        self.reconnect_at = None;
        self.set_state(LinkState::Disconnected);
    }

    fn set_state(&self, state: LinkState) {
        tracing::debug!(state = %state, "link state");
        self.state_tx.send_replace(state);
    }

    fn is_ready(&self) -> bool {
        *self.state_tx.borrow() == LinkState::Ready
    }

    async fn keepalive_ping(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let result = transport.ping().await;
        if let Err(e) = result {
            self.connection_lost(&e.to_string());
        }
    }

    // ── I/O helpers ───────────────────────────────────────────────────────────

    /// Write one frame. On failure the connection is treated as lost.
    async fn write(&mut self, frame: Bytes) -> bool {
        let Some(transport) = self.transport.as_mut() else {
            return false;
        };
        let result = transport.send(frame).await;
        match result {
            Ok(()) => true,
            Err(e) => {
                self.connection_lost(&e.to_string());
                false
            }
        }
    }

    /// Hand every already-buffered message to `unsolicited`, so a request
    /// only ever reads replies that arrive after it was written.
    fn drain_stale(&mut self) {
        loop {
            let Some(transport) = self.transport.as_mut() else {
                return;
            };
            let next = transport.recv().now_or_never();
            match next {
                None => return,
                Some(Some(Ok(msg))) => {
                    tracing::debug!("stale reply before request");
                    self.unsolicited(msg);
                }
                Some(Some(Err(e))) => {
                    self.connection_lost(&e.to_string());
                    return;
                }
                Some(None) => {
                    self.connection_lost("closed by peer");
                    return;
                }
            }
        }
    }

    async fn wait_until(&mut self, deadline: Instant) -> Wait {
        let Some(transport) = self.transport.as_mut() else {
            return Wait::Lost;
        };
        let result = tokio::time::timeout_at(deadline, transport.recv()).await;
        match result {
            Err(_) => Wait::TimedOut,
            Ok(Some(Ok(msg))) => Wait::Message(msg),
            Ok(Some(Err(e))) => {
                self.connection_lost(&e.to_string());
                Wait::Lost
            }
            Ok(None) => {
                self.connection_lost("closed by peer");
                Wait::Lost
            }
        }
    }

    // ── Status ────────────────────────────────────────────────────────────────

    async fn probe_status(&mut self) -> Option<DeviceStatus> {
        self.drain_stale();
        if !self.write(encode_empty(TlvType::Status)).await {
            return None;
        }
        let deadline = Instant::now() + self.config.ack_timeout();
        match self.wait_until(deadline).await {
            Wait::Message(Inbound::Binary(bytes)) => {
                let status = status_frame(&bytes).map(DeviceStatus::parse);
                if let Some(status) = &status {
                    self.apply_status(status.clone());
                } else {
                    tracing::debug!(len = bytes.len(), "status probe answered with another frame");
                }
                status
            }
            Wait::Message(Inbound::Text(text)) => {
                tracing::debug!(%text, "status probe answered with text");
                None
            }
            Wait::TimedOut => {
                tracing::debug!("status probe timed out");
                None
            }
            Wait::Lost => None,
        }
    }

    fn apply_status(&mut self, status: DeviceStatus) {
        if let Some(max) = status.max_chunk.filter(|&m| m > 0) {
            let chunk = usize::from(max).min(usize::from(u16::MAX) - 4);
            if chunk != self.chunk_max {
                tracing::info!(chunk_max = chunk, "device chunk size");
            }
            self.chunk_max = chunk;
        }
        tracing::debug!(
            version = ?status.version,
            leds = ?status.led_count,
            storage = ?status.storage_available,
            "device status"
        );
        self.status = Some(status);
    }

    fn unsolicited(&mut self, msg: Inbound) {
        match &msg {
            Inbound::Binary(bytes) => match status_frame(bytes) {
                Some(payload) => self.apply_status(DeviceStatus::parse(payload)),
                None => tracing::debug!(len = bytes.len(), "ignoring unsolicited frame"),
            },
            Inbound::Text(text) => tracing::debug!(%text, "ignoring unsolicited text"),
        }
    }

    // ── Uploads ───────────────────────────────────────────────────────────────

    async fn send_with_retry(&mut self, payload: &[u8]) -> Result<AckReport, LinkError> {
        let plan = make_put_plan(payload, self.chunk_max)?;
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let reply = self.attempt(&plan).await?;
            let done = reply.is_ok() || !reply.code.is_retryable() || attempts >= max_attempts;

            if reply.is_ok() {
                tracing::info!(attempts, bytes = payload.len(), crc = plan.crc, "upload acknowledged");
            } else if done {
                tracing::warn!(attempts, code = %reply.code, "upload failed");
            } else {
                tracing::debug!(attempt = attempts, code = %reply.code, "retrying upload");
            }

            if done {
                return Ok(AckReport {
                    reply,
                    attempts,
                    total_bytes: plan.total_bytes,
                    crc: plan.crc,
                });
            }
            tokio::time::sleep(self.config.retry_pause(attempts)).await;
        }
    }

    async fn attempt(&mut self, plan: &PutPlan) -> Result<AckReply, LinkError> {
        self.drain_stale();
        if self.transport.is_none() {
            return Ok(AckReply::disconnected());
        }
        for tlv in &plan.tlvs {
            if !self.write(tlv.encode()?).await {
                return Ok(AckReply::disconnected());
            }
        }
        let deadline = Instant::now() + self.config.ack_timeout();
        Ok(match self.wait_until(deadline).await {
            Wait::Message(msg) => AckReply::parse(&msg),
            Wait::TimedOut => AckReply::timeout(),
            Wait::Lost => AckReply::disconnected(),
        })
    }

    // ── Inventory ─────────────────────────────────────────────────────────────

    async fn list_patterns(&mut self) -> Vec<PatternEntry> {
        self.drain_stale();
        if !self.write(encode_empty(TlvType::List)).await {
            return self.inventory.clone();
        }
        let deadline = Instant::now() + self.config.inventory_timeout();
        loop {
            match self.wait_until(deadline).await {
                Wait::Message(Inbound::Binary(bytes)) => {
                    let (frames, _) = Tlv::decode_all(&bytes);
                    if let Some(list) = frames.iter().find(|f| f.kind == u8::from(TlvType::List)) {
                        self.inventory = parse_inventory(&list.value);
                        tracing::info!(patterns = self.inventory.len(), "inventory updated");
                        return self.inventory.clone();
                    }
                    self.unsolicited(Inbound::Binary(bytes));
                }
                Wait::Message(other) => self.unsolicited(other),
                Wait::TimedOut => {
                    tracing::debug!("inventory query timed out, keeping previous listing");
                    return self.inventory.clone();
                }
                Wait::Lost => return self.inventory.clone(),
            }
        }
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn periodic(period: Duration) -> Interval {
    let period = period.max(Duration::from_millis(1));
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn encode_empty(kind: TlvType) -> Bytes {
    let mut out = bytes::BytesMut::with_capacity(3);
    out.extend_from_slice(&[u8::from(kind), 0, 0]);
    out.freeze()
}

/// Payload of the first 0x30 frame in a binary message.
fn status_frame(bytes: &[u8]) -> Option<&[u8]> {
    let (tlv, _) = Tlv::decode_one(bytes).ok()?;
    if tlv.kind != u8::from(TlvType::Status) {
        return None;
    }
    let len = tlv.value.len();
    bytes.get(3..3 + len)
}

async fn sleep_until_opt(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_inbound(
    transport: &mut Option<Box<dyn Transport>>,
) -> Option<Result<Inbound, TransportError>> {
    match transport {
        Some(t) => t.recv().await,
        None => std::future::pending().await,
    }
}
