//! The encrypted session: one auth key, one connection, many requests.
//!
//! Each [`Session`] is a cheap handle to a background task that owns the
//! connection and the sans-IO [`EncryptedSession`] state. The task:
//!
//! * correlates answers to requests by `msg_id`, whatever order they arrive in;
//! * acknowledges content messages in batches, piggybacked on outgoing traffic;
//! * resends unacknowledged requests under their original `msg_id` with
//!   exponential backoff;
//! * follows `bad_server_salt` and `bad_msg_notification` corrections;
//! * keeps the connection alive with `ping_delay_disconnect` and refreshes
//!   future salts;
//! * reconnects after transport failures and replays everything pending;
//! * forwards server pushes to a [`PushSink`].
//!
//! Decryption failures are fatal: the task fails every pending request with
//! [`InvocationError::Security`] and stops, so the pool builds a new session.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use ferrogram_crypto::random_array;
use ferrogram_mtproto::encrypted::{self, EncryptedSession, MAX_CONTAINER_BYTES, MAX_CONTAINER_LEN, OutgoingMessage, UnpackError};
use ferrogram_mtproto::service::{self, Inbound, RpcOutcome};
use ferrogram_tl::{Deserializable, RemoteCall, Serializable, functions, types};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::blocking::CryptoPool;
use crate::errors::{InvocationError, RpcError};
use crate::pool::Mode;
use crate::transport::{Connection, Connector, TransportKind};

/// Frames and packets above this size are encrypted or decrypted on the
/// [`CryptoPool`] instead of the session task.
const OFFLOAD_LEN: usize = 64 * 1024;
/// Granularity of the resend and ack timers.
const TICK: Duration = Duration::from_secs(1);
/// How many future salts to ask for at a time.
const FUTURE_SALTS: i32 = 64;

// ─── Configuration ────────────────────────────────────────────────────────────

/// Bounds for resending unacknowledged requests and for reconnecting.
///
/// The n-th resend of a request happens `min(ack_timeout * 2^n, max_backoff)`
/// after the previous send; the n-th reconnect attempt waits
/// `min(base * 2^n, max_backoff)` where `base` is the client's start timeout.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResendConfig {
    pub ack_timeout: Duration,
    pub max_backoff: Duration,
    pub max_resends: u32,
    pub max_reconnects: u32,
}

impl Default for ResendConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(15),
            max_backoff: Duration::from_secs(60),
            max_resends: 5,
            max_reconnects: 5,
        }
    }
}

impl ResendConfig {
    pub fn resend_delay(&self, resends: u32) -> Duration {
        backoff(self.ack_timeout, resends, self.max_backoff)
    }
}

fn backoff(base: Duration, attempt: u32, max: Duration) -> Duration {
    base.saturating_mul(1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX)).min(max)
}

/// Everything a session task needs to (re)connect and behave.
#[derive(Clone, Debug)]
pub(crate) struct SessionOptions {
    pub dc_id: i32,
    pub mode: Mode,
    pub addr: String,
    pub transport: TransportKind,
    pub obfuscation_dc: i16,
    pub connect_timeout: Duration,
    pub reconnect_delay: Duration,
    pub resend: ResendConfig,
    pub ping_interval: Duration,
    pub disconnect_delay: Duration,
    pub ack_threshold: usize,
}

// ─── Push delivery ────────────────────────────────────────────────────────────

/// Receives what the server sends without being asked.
///
/// Sessions hold this as a non-owning back-reference: the sink must not
/// keep the pool alive.
pub trait PushSink: Send + Sync + 'static {
    /// An update or other unsolicited object.
    fn push(&self, dc_id: i32, body: Vec<u8>);

    /// The server started a new session; updates may have been lost.
    fn session_created(&self, dc_id: i32);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoPushes;

impl PushSink for NoPushes {
    fn push(&self, _: i32, _: Vec<u8>) {}
    fn session_created(&self, _: i32) {}
}

// ─── Handle ───────────────────────────────────────────────────────────────────

type Reply = oneshot::Sender<Result<Vec<u8>, InvocationError>>;

enum Command {
    Invoke { request: u64, body: Vec<u8>, reply: Reply },
    Cancel { request: u64 },
}

struct Shared {
    dc_id: i32,
    mode: Mode,
    tx: mpsc::UnboundedSender<Command>,
    next_request: AtomicU64,
    flood_until: std::sync::Mutex<Option<Instant>>,
    cancel: CancellationToken,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A handle to a running encrypted session. Cheap to clone; the session
/// stops when the last handle is dropped or [`Session::close`] is called.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("dc_id", &self.shared.dc_id)
            .field("mode", &self.shared.mode)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Start the session task over an open connection.
    pub(crate) fn spawn(
        opts: SessionOptions,
        conn: Connection,
        state: EncryptedSession,
        connector: Arc<dyn Connector>,
        sink: Arc<dyn PushSink>,
        crypto: CryptoPool,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let shared = Arc::new(Shared {
            dc_id: opts.dc_id,
            mode: opts.mode,
            tx,
            next_request: AtomicU64::new(0),
            flood_until: std::sync::Mutex::new(None),
            cancel: cancel.clone(),
        });

        let actor = Actor {
            opts,
            connector,
            state,
            conn: Some(conn),
            rx,
            cancel,
            sink,
            crypto,
            pending: HashMap::new(),
            by_request: HashMap::new(),
            containers: HashMap::new(),
            outbox: Vec::new(),
            service_out: Vec::new(),
            acks: Vec::new(),
        };
        tokio::spawn(actor.run());
        Self { shared }
    }

    pub fn dc_id(&self) -> i32 {
        self.shared.dc_id
    }

    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// True once the session task has stopped.
    pub fn is_closed(&self) -> bool {
        self.shared.tx.is_closed()
    }

    /// Stop the session task. Pending requests fail with
    /// [`InvocationError::SessionClosed`].
    pub fn close(&self) {
        self.shared.cancel.cancel();
    }

    /// Send `request` and wait for its answer.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let body = self.invoke_raw(request.to_bytes()).await?;
        Ok(R::Return::from_bytes(&body)?)
    }

    /// Send a serialized request and return the serialized answer.
    ///
    /// Dropping the returned future forgets the request locally; an answer
    /// that still arrives is ignored.
    pub async fn invoke_raw(&self, body: Vec<u8>) -> Result<Vec<u8>, InvocationError> {
        self.wait_out_flood().await;

        let request = self.shared.next_request.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.shared.tx.send(Command::Invoke { request, body, reply }).map_err(|_| InvocationError::SessionClosed)?;

        let mut guard = CancelOnDrop { tx: &self.shared.tx, request, armed: true };
        let result = rx.await.unwrap_or(Err(InvocationError::SessionClosed));
        guard.armed = false;
        result
    }

    /// Hold further sends on this session until `wait` has passed.
    pub fn suspend_for(&self, wait: Duration) {
        let until = Instant::now() + wait;
        if let Ok(mut slot) = self.shared.flood_until.lock() {
            if slot.is_none_or(|current| current < until) {
                *slot = Some(until);
            }
        }
    }

    async fn wait_out_flood(&self) {
        let until = self.shared.flood_until.lock().ok().and_then(|slot| *slot);
        if let Some(until) = until {
            if until > Instant::now() {
                tracing::debug!("[ferrogram] DC{} suspended by flood wait", self.shared.dc_id);
                tokio::time::sleep_until(until).await;
            }
        }
    }
}

struct CancelOnDrop<'a> {
    tx: &'a mpsc::UnboundedSender<Command>,
    request: u64,
    armed: bool,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            let _ = self.tx.send(Command::Cancel { request: self.request });
        }
    }
}

// ─── Actor ────────────────────────────────────────────────────────────────────

enum Origin {
    Caller { request: u64, reply: Reply },
    Ping,
    FutureSalts,
}

struct Pending {
    msg: OutgoingMessage,
    origin: Origin,
    sent_at: Option<Instant>,
    resends: u32,
    acked: bool,
}

enum Event {
    Stop,
    Command(Command),
    Frame(Result<Vec<u8>, InvocationError>),
    Tick,
    Ping,
}

struct Actor {
    opts: SessionOptions,
    connector: Arc<dyn Connector>,
    state: EncryptedSession,
    conn: Option<Connection>,
    rx: mpsc::UnboundedReceiver<Command>,
    cancel: CancellationToken,
    sink: Arc<dyn PushSink>,
    crypto: CryptoPool,
    pending: HashMap<i64, Pending>,
    by_request: HashMap<u64, i64>,
    /// container msg_id → the msg_ids packed into it
    containers: HashMap<i64, Vec<i64>>,
    /// msg_ids of pending messages waiting to be (re)sent
    outbox: Vec<i64>,
    /// service messages that expect no answer
    service_out: Vec<Vec<u8>>,
    acks: Vec<i64>,
}

impl Actor {
    async fn run(mut self) {
        let mut tick = tokio::time::interval_at(Instant::now() + TICK, TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ping = tokio::time::interval(self.opts.ping_interval);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("[ferrogram] session for DC{} ({:?}) started", self.opts.dc_id, self.opts.mode);

        let fatal = loop {
            if self.conn.is_none() {
                if let Err(e) = self.reconnect().await {
                    break Some(e);
                }
                if self.cancel.is_cancelled() {
                    break None;
                }
            }
            let Some(conn) = self.conn.as_mut() else { continue };

            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Stop,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => Event::Command(cmd),
                    None => Event::Stop,
                },
                frame = conn.recv() => Event::Frame(frame),
                _ = tick.tick() => Event::Tick,
                _ = ping.tick() => Event::Ping,
            };

            let outcome = match event {
                Event::Stop => break None,
                Event::Command(cmd) => {
                    self.on_command(cmd);
                    while let Ok(cmd) = self.rx.try_recv() {
                        self.on_command(cmd);
                    }
                    self.flush(false).await
                }
                Event::Frame(Ok(frame)) => match self.on_frame(frame).await {
                    Ok(()) => self.flush(false).await,
                    Err(e) => Err(e),
                },
                Event::Frame(Err(e)) => Err(e),
                Event::Tick => {
                    self.check_resends();
                    self.flush(true).await
                }
                Event::Ping => {
                    self.keepalive();
                    self.flush(false).await
                }
            };

            if let Err(e) = outcome {
                if let Err(fatal) = self.connection_lost(e).await {
                    break Some(fatal);
                }
            }
        };

        let error = fatal.unwrap_or(InvocationError::SessionClosed);
        if !matches!(error, InvocationError::SessionClosed) {
            tracing::error!("[ferrogram] session for DC{} stopped: {error}", self.opts.dc_id);
        } else {
            tracing::info!("[ferrogram] session for DC{} closed", self.opts.dc_id);
        }
        // Reported closed before any caller learns of the failure.
        self.rx.close();
        while let Ok(cmd) = self.rx.try_recv() {
            if let Command::Invoke { reply, .. } = cmd {
                let _ = reply.send(Err(error.duplicate()));
            }
        }
        self.fail_all(&error);
        if let Some(conn) = self.conn.as_mut() {
            conn.shutdown().await;
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Invoke { request, body, reply } => {
                let msg = self.state.new_message(body, true);
                tracing::debug!("[ferrogram] DC{} send request {:#x}", self.opts.dc_id, msg.msg_id);
                self.by_request.insert(request, msg.msg_id);
                self.enqueue(msg, Origin::Caller { request, reply });
            }
            Command::Cancel { request } => {
                if let Some(msg_id) = self.by_request.remove(&request) {
                    self.pending.remove(&msg_id);
                    tracing::debug!("[ferrogram] request {msg_id:#x} cancelled");
                }
            }
        }
    }

    fn enqueue(&mut self, msg: OutgoingMessage, origin: Origin) {
        self.outbox.push(msg.msg_id);
        self.pending.insert(msg.msg_id, Pending { msg, origin, sent_at: None, resends: 0, acked: false });
    }

    // ── Outgoing ─────────────────────────────────────────────────────────

    /// Send everything queued, plus acks when there are enough of them, when
    /// they can ride along with other messages, or when `force_acks` is set.
    async fn flush(&mut self, force_acks: bool) -> Result<(), InvocationError> {
        if self.conn.is_none() {
            return Ok(());
        }

        let now = Instant::now();
        let mut seen = HashSet::new();
        let mut batch = Vec::new();
        for msg_id in std::mem::take(&mut self.outbox) {
            if !seen.insert(msg_id) {
                continue;
            }
            if let Some(p) = self.pending.get_mut(&msg_id) {
                p.sent_at = Some(now);
                batch.push(p.msg.clone());
            }
        }
        for body in std::mem::take(&mut self.service_out) {
            batch.push(self.state.new_message(body, false));
        }
        let send_acks = !self.acks.is_empty()
            && (force_acks || !batch.is_empty() || self.acks.len() >= self.opts.ack_threshold);
        if send_acks {
            let msg_ids = std::mem::take(&mut self.acks);
            batch.push(self.state.new_message(types::MsgsAck { msg_ids }.to_bytes(), false));
        }

        for packet in split_packets(batch) {
            self.send_packet(packet).await?;
        }
        Ok(())
    }

    async fn send_packet(&mut self, messages: Vec<OutgoingMessage>) -> Result<(), InvocationError> {
        let packed = self.state.pack(&messages);
        if packed.container {
            self.containers.insert(packed.msg_id, messages.iter().map(|m| m.msg_id).collect());
        }
        let key = Arc::clone(self.state.auth_key());
        let sealed = if packed.plaintext.len() > OFFLOAD_LEN {
            self.crypto.run(move || encrypted::seal(&packed.plaintext, &key)).await?
        } else {
            encrypted::seal(&packed.plaintext, &key)
        };
        let wire = sealed.map_err(|e| InvocationError::Io(std::io::Error::other(e)))?;
        match self.conn.as_mut() {
            Some(conn) => conn.send(&wire).await,
            None => Ok(()),
        }
    }

    // ── Incoming ─────────────────────────────────────────────────────────

    async fn on_frame(&mut self, mut frame: Vec<u8>) -> Result<(), InvocationError> {
        let key = Arc::clone(self.state.auth_key());
        let session_id = self.state.session_id();
        let opened = if frame.len() > OFFLOAD_LEN {
            self.crypto.run(move || encrypted::open(&mut frame, &key, session_id)).await?
        } else {
            encrypted::open(&mut frame, &key, session_id)
        };

        let msg = match opened {
            Ok(msg) => msg,
            Err(UnpackError::SessionMismatch { got, .. }) => {
                tracing::warn!("[ferrogram] dropping frame for old session {got:#x}");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if let Err(rejection) = self.state.accept(&msg) {
            tracing::warn!("[ferrogram] DC{} dropped server message: {rejection}", self.opts.dc_id);
            if self.state.should_restart() {
                return Err(InvocationError::Io(std::io::Error::other("too many rejected server messages")));
            }
            return Ok(());
        }

        if msg.seq_no & 1 == 1 {
            self.acks.push(msg.msg_id);
        }
        match service::classify(&msg.body) {
            Ok(Inbound::Container(inner)) => {
                for m in inner {
                    if m.seq_no & 1 == 1 {
                        self.acks.push(m.msg_id);
                    }
                    match service::classify(&m.body) {
                        Ok(Inbound::Container(_)) => tracing::warn!("[ferrogram] ignoring nested container"),
                        Ok(inbound) => self.dispatch(m.msg_id, inbound),
                        Err(e) => tracing::warn!("[ferrogram] undecodable message {:#x}: {e}", m.msg_id),
                    }
                }
            }
            Ok(inbound) => self.dispatch(msg.msg_id, inbound),
            Err(e) => tracing::warn!("[ferrogram] undecodable message {:#x}: {e}", msg.msg_id),
        }
        Ok(())
    }

    fn dispatch(&mut self, msg_id: i64, inbound: Inbound) {
        match inbound {
            Inbound::RpcResult { req_msg_id, outcome } => {
                let result = match outcome {
                    RpcOutcome::Ok(body) => Ok(body),
                    RpcOutcome::Err(e) => Err(InvocationError::Rpc(RpcError::from_telegram(e.error_code, &e.error_message))),
                    RpcOutcome::Dropped => Err(InvocationError::Dropped),
                };
                if let Err(e) = &result {
                    tracing::debug!("[ferrogram] request {req_msg_id:#x} failed: {e}");
                }
                self.complete(req_msg_id, result);
            }
            Inbound::Ack(ids) => {
                let ids: Vec<i64> = ids.into_iter().flat_map(|id| self.expand(id)).collect();
                for id in ids {
                    if let Some(p) = self.pending.get_mut(&id) {
                        p.acked = true;
                    }
                }
            }
            Inbound::BadServerSalt(bad) => {
                tracing::warn!("[ferrogram] DC{} bad server salt, adopting {:#x}", self.opts.dc_id, bad.new_server_salt);
                self.state.salts_mut().set_current(bad.new_server_salt);
                self.state.sync_time(msg_id);
                for id in self.expand(bad.bad_msg_id) {
                    if self.pending.contains_key(&id) {
                        self.outbox.push(id);
                    }
                }
            }
            Inbound::BadMsgNotification(bad) => self.on_bad_msg(msg_id, bad),
            Inbound::NewSessionCreated(created) => {
                tracing::info!("[ferrogram] DC{} server created a new session", self.opts.dc_id);
                self.state.salts_mut().set_current(created.server_salt);
                let lost: Vec<i64> = self
                    .pending
                    .keys()
                    .copied()
                    .filter(|&id| id < created.first_msg_id)
                    .collect();
                self.outbox.extend(lost);
                self.sink.session_created(self.opts.dc_id);
            }
            Inbound::Pong(pong) => self.complete(pong.msg_id, Ok(pong.to_bytes())),
            Inbound::FutureSalts(salts) => {
                tracing::debug!("[ferrogram] DC{} received {} future salts", self.opts.dc_id, salts.salts.len());
                let req_msg_id = salts.req_msg_id;
                let body = salts.to_bytes();
                self.state.salts_mut().store_future(salts.salts);
                self.complete(req_msg_id, Ok(body));
            }
            Inbound::DetailedInfo { answer_msg_id } => self.acks.push(answer_msg_id),
            Inbound::StateInfo(info) => {
                tracing::debug!("[ferrogram] msgs_state_info for {:#x}", info.req_msg_id);
            }
            Inbound::ResendRequest(ids) => {
                for id in ids {
                    if self.pending.contains_key(&id) {
                        self.outbox.push(id);
                    }
                }
            }
            Inbound::StateRequest(ids) => {
                // Nothing about individual server messages is kept beyond the
                // replay window, so every id is reported as unknown.
                let info = types::MsgsStateInfo { req_msg_id: msg_id, info: vec![1; ids.len()] };
                self.service_out.push(info.to_bytes());
            }
            Inbound::DestroySession { session_id, existed } => {
                tracing::info!("[ferrogram] destroy_session {session_id:#x} (existed: {existed})");
            }
            Inbound::Push(body) => self.sink.push(self.opts.dc_id, body),
            Inbound::Container(_) => {}
        }
    }

    fn on_bad_msg(&mut self, msg_id: i64, bad: types::BadMsgNotification) {
        tracing::warn!(
            "[ferrogram] DC{} bad_msg_notification {} for {:#x}",
            self.opts.dc_id,
            bad.error_code,
            bad.bad_msg_id
        );
        match bad.error_code {
            // msg_id too low / too high: our clock is off.
            16 | 17 => {
                let offset = self.state.sync_time(msg_id);
                tracing::info!("[ferrogram] clock resynced, offset {offset}s");
                for id in self.expand(bad.bad_msg_id) {
                    self.reassign(id);
                }
            }
            // seq_no too low / too high: start over on a fresh session.
            32 | 33 => {
                if let Err(e) = self.state.reset_session() {
                    tracing::error!("[ferrogram] cannot start a new session: {e}");
                    return;
                }
                let ids: Vec<i64> = self.pending.keys().copied().collect();
                for id in ids {
                    self.reassign(id);
                }
            }
            code => {
                for id in self.expand(bad.bad_msg_id) {
                    self.complete(id, Err(InvocationError::BadMessage(code)));
                }
            }
        }
    }

    /// The ids a (possibly container) msg_id stands for.
    fn expand(&self, msg_id: i64) -> Vec<i64> {
        match self.containers.get(&msg_id) {
            Some(inner) => inner.clone(),
            None => vec![msg_id],
        }
    }

    fn reassign(&mut self, old: i64) {
        let Some(mut p) = self.pending.remove(&old) else { return };
        self.state.reassign(&mut p.msg);
        let new = p.msg.msg_id;
        if let Origin::Caller { request, .. } = &p.origin {
            self.by_request.insert(*request, new);
        }
        p.acked = false;
        p.sent_at = None;
        self.pending.insert(new, p);
        self.outbox.push(new);
    }

    fn complete(&mut self, msg_id: i64, result: Result<Vec<u8>, InvocationError>) {
        let Some(p) = self.pending.remove(&msg_id) else {
            tracing::debug!("[ferrogram] answer for unknown or cancelled message {msg_id:#x}");
            return;
        };
        match p.origin {
            Origin::Caller { request, reply } => {
                self.by_request.remove(&request);
                let _ = reply.send(result);
            }
            Origin::Ping | Origin::FutureSalts => {
                if let Err(e) = result {
                    tracing::debug!("[ferrogram] service request {msg_id:#x} failed: {e}");
                }
            }
        }
    }

    fn fail_all(&mut self, error: &InvocationError) {
        for (_, p) in self.pending.drain() {
            if let Origin::Caller { reply, .. } = p.origin {
                let _ = reply.send(Err(error.duplicate()));
            }
        }
        self.by_request.clear();
    }

    // ── Timers ───────────────────────────────────────────────────────────

    fn check_resends(&mut self) {
        let now = Instant::now();
        let resend = &self.opts.resend;
        let mut expired = Vec::new();
        for (&id, p) in self.pending.iter_mut() {
            if p.acked || matches!(p.origin, Origin::Ping) {
                continue;
            }
            let Some(sent_at) = p.sent_at else { continue };
            if now < sent_at + resend.resend_delay(p.resends) {
                continue;
            }
            if p.resends >= resend.max_resends {
                expired.push(id);
            } else {
                p.resends += 1;
                tracing::debug!("[ferrogram] resending {id:#x} (attempt {})", p.resends);
                self.outbox.push(id);
            }
        }
        for id in expired {
            tracing::warn!("[ferrogram] no acknowledgement for {id:#x}, giving up");
            self.complete(id, Err(InvocationError::Timeout));
        }
        let pending = &self.pending;
        self.containers.retain(|_, inner| inner.iter().any(|id| pending.contains_key(id)));
    }

    fn keepalive(&mut self) {
        let now = Instant::now();
        let stale_ping = self.pending.iter().find_map(|(&id, p)| match (&p.origin, p.sent_at) {
            (Origin::Ping, Some(sent)) => Some((id, now.saturating_duration_since(sent))),
            _ => None,
        });
        if let Some((id, age)) = stale_ping {
            if age >= self.opts.connect_timeout {
                tracing::warn!("[ferrogram] DC{} ping unanswered for {age:?}, reconnecting", self.opts.dc_id);
                self.pending.remove(&id);
                self.conn = None;
                return;
            }
        }

        if stale_ping.is_none() {
            let ping_id = random_array::<8>().map(i64::from_le_bytes).unwrap_or_default();
            let request = functions::PingDelayDisconnect {
                ping_id,
                disconnect_delay: self.opts.disconnect_delay.as_secs() as i32,
            };
            let msg = self.state.new_request(&request);
            self.enqueue(msg, Origin::Ping);
        }

        let refreshing = self.pending.values().any(|p| matches!(p.origin, Origin::FutureSalts));
        if !refreshing && self.state.salts().needs_refresh(self.state.server_now()) {
            let msg = self.state.new_request(&functions::GetFutureSalts { num: FUTURE_SALTS });
            self.enqueue(msg, Origin::FutureSalts);
        }
    }

    // ── Connection loss ──────────────────────────────────────────────────

    /// Fatal errors are returned; anything else drops the connection so the
    /// loop reconnects.
    async fn connection_lost(&mut self, error: InvocationError) -> Result<(), InvocationError> {
        match error {
            InvocationError::Transport(code @ (-404 | -444)) => Err(InvocationError::Transport(code)),
            InvocationError::Security(_) => Err(error),
            other => {
                tracing::warn!("[ferrogram] DC{} connection lost: {other}", self.opts.dc_id);
                if let Some(mut conn) = self.conn.take() {
                    conn.shutdown().await;
                }
                Ok(())
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), InvocationError> {
        let resend = self.opts.resend.clone();
        for attempt in 0..resend.max_reconnects {
            let delay = backoff(self.opts.reconnect_delay, attempt, resend.max_backoff);
            tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
            match Connection::open(
                &self.connector,
                &self.opts.addr,
                &self.opts.transport,
                self.opts.obfuscation_dc,
                self.opts.connect_timeout,
            )
            .await
            {
                Ok(conn) => {
                    tracing::info!("[ferrogram] DC{} reconnected to {}", self.opts.dc_id, self.opts.addr);
                    self.conn = Some(conn);
                    self.replay_pending();
                    return Ok(());
                }
                Err(e) => tracing::warn!("[ferrogram] DC{} reconnect attempt {} failed: {e}", self.opts.dc_id, attempt + 1),
            }
        }
        Err(InvocationError::Io(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            format!("DC{} unreachable after {} reconnect attempts", self.opts.dc_id, resend.max_reconnects),
        )))
    }

    /// Queue every pending request again, keeping msg_id and seq_no.
    fn replay_pending(&mut self) {
        self.pending.retain(|_, p| !matches!(p.origin, Origin::Ping));
        let mut ids: Vec<i64> = self.pending.keys().copied().collect();
        ids.sort_unstable();
        for p in self.pending.values_mut() {
            p.acked = false;
            p.sent_at = None;
        }
        tracing::debug!("[ferrogram] replaying {} pending messages", ids.len());
        self.outbox = ids;
    }
}

/// Group messages into packets no container could refuse.
fn split_packets(batch: Vec<OutgoingMessage>) -> Vec<Vec<OutgoingMessage>> {
    let mut packets = Vec::new();
    let mut current: Vec<OutgoingMessage> = Vec::new();
    let mut size = 0;
    for msg in batch {
        let len = msg.body.len() + 16;
        if !current.is_empty() && (current.len() == MAX_CONTAINER_LEN || size + len > MAX_CONTAINER_BYTES) {
            packets.push(std::mem::take(&mut current));
            size = 0;
        }
        size += len;
        current.push(msg);
    }
    if !current.is_empty() {
        packets.push(current);
    }
    packets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resend_backoff_doubles_up_to_the_cap() {
        let cfg = ResendConfig {
            ack_timeout: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            ..ResendConfig::default()
        };
        assert_eq!(cfg.resend_delay(0), Duration::from_secs(2));
        assert_eq!(cfg.resend_delay(1), Duration::from_secs(4));
        assert_eq!(cfg.resend_delay(2), Duration::from_secs(8));
        assert_eq!(cfg.resend_delay(3), Duration::from_secs(10));
        assert_eq!(cfg.resend_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn big_messages_travel_alone() {
        let msg = |id: i64, len: usize| OutgoingMessage { msg_id: id, seq_no: 1, body: vec![0; len] };
        let packets = split_packets(vec![msg(1, 16), msg(2, MAX_CONTAINER_BYTES), msg(3, 16)]);
        assert_eq!(packets.iter().map(Vec::len).collect::<Vec<_>>(), vec![1, 1, 1]);

        let many = (0..MAX_CONTAINER_LEN as i64 + 5).map(|i| msg(i, 4)).collect();
        let packets = split_packets(many);
        assert_eq!(packets.iter().map(Vec::len).collect::<Vec<_>>(), vec![MAX_CONTAINER_LEN, 5]);
    }
}
