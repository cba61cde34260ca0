//! Gap-checked, ordered delivery of server pushes.
//!
//! The engine does not know the application schema. An [`UpdateSchema`]
//! adapter turns raw push bodies into [`Element`]s that carry their scope
//! and sequence numbers, builds difference requests and reads their answers.
//!
//! One task owns every [`Position`]: pushes are checked against it in
//! arrival order, gaps are filled with a difference fetch before the
//! triggering element is delivered, and accepted updates are queued to a
//! fixed pool of workers running the [`UpdateHandler`].

use std::future::Future;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use ferrogram_tl::functions;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::cache::BoundedCache;
use crate::errors::InvocationError;
use crate::pool::SessionPool;
use crate::session::PushSink;
use crate::storage::Position;

/// Without any push for this long, the server is asked for its state.
pub const IDLE_PROBE_AFTER: Duration = Duration::from_secs(15 * 60);
const WATCHDOG_TICK: Duration = Duration::from_secs(60);
/// Difference rounds per recovery before giving up on filling a gap.
const MAX_DIFFERENCE_ROUNDS: usize = 10;
const CHANNEL_CAPACITY: usize = 10_000;
const DEDUP_CAPACITY: usize = 4_096;

// ─── Schema adapter ───────────────────────────────────────────────────────────

/// Which counter an element is sequenced by.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scope {
    /// The account-wide `pts`, `date` and `seq`.
    Common,
    /// Secret chats and bot updates, sequenced by `qts`.
    Secret,
    Channel(i64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sequence {
    /// Not sequenced; delivered as it arrives.
    None,
    /// Must satisfy `pts == local + count`.
    Pts { pts: i32, count: i32 },
    /// Must satisfy `qts == local + 1`.
    Qts { qts: i32 },
}

/// One update out of a push.
#[derive(Clone, Debug)]
pub struct Element<U> {
    pub scope: Scope,
    pub sequence: Sequence,
    pub update: U,
}

/// What a push body turned out to be.
#[derive(Clone, Debug)]
pub enum Batch<U> {
    /// `seq_start == 0` means the batch is not `seq`-ordered.
    Updates { elements: Vec<Element<U>>, seq: i32, seq_start: i32, date: i32 },
    /// The server gave up on sending everything; fetch the difference.
    TooLong,
}

/// Where a difference left off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DifferenceState {
    /// Caught up.
    Final(Position),
    /// More to fetch from this position.
    Partial(Position),
    /// Nothing happened since the request; only the clock moved.
    Empty { date: i32, seq: i32 },
    /// Too much to replay; resume from `pts`.
    TooLong { pts: i32 },
}

/// A decoded difference answer. Users, chats and other context the
/// difference carries are the adapter's to merge into its elements.
#[derive(Clone, Debug)]
pub struct Difference<U> {
    pub elements: Vec<U>,
    pub state: DifferenceState,
}

/// Bridges the engine to an application schema.
pub trait UpdateSchema: Send + Sync + 'static {
    type Update: Send + 'static;

    /// `None` when the push is not an update at all.
    fn classify(&self, body: &[u8]) -> Option<Batch<Self::Update>>;

    /// A serialized `updates.getDifference` or `updates.getChannelDifference`
    /// for `scope`, starting at `position`.
    fn difference_request(&self, scope: Scope, position: &Position) -> Vec<u8>;

    fn read_difference(&self, scope: Scope, body: &[u8]) -> Result<Difference<Self::Update>, InvocationError>;
}

/// Runs on the worker pool for every accepted update.
#[async_trait]
pub trait UpdateHandler<U>: Send + Sync + 'static {
    async fn handle(&self, update: U);
}

#[async_trait]
impl<U, F, Fut> UpdateHandler<U> for F
where
    U: Send + 'static,
    F: Fn(U) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn handle(&self, update: U) {
        (self)(update).await
    }
}

// ─── Push routing ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum PushEvent {
    Push { dc_id: i32, body: Vec<u8> },
    SessionCreated { dc_id: i32 },
}

/// The sink sessions push into. Pushes arriving while no update stream is
/// running are dropped.
#[derive(Default)]
pub(crate) struct PushRouter {
    tx: std::sync::Mutex<Option<mpsc::UnboundedSender<PushEvent>>>,
}

impl PushRouter {
    /// Route everything to a new receiver, detaching any previous one.
    pub(crate) fn attach(&self) -> mpsc::UnboundedReceiver<PushEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut slot) = self.tx.lock() {
            *slot = Some(tx);
        }
        rx
    }

    fn send(&self, event: PushEvent) {
        if let Ok(slot) = self.tx.lock() {
            if let Some(tx) = slot.as_ref() {
                let _ = tx.send(event);
            }
        }
    }
}

impl PushSink for PushRouter {
    fn push(&self, dc_id: i32, body: Vec<u8>) {
        self.send(PushEvent::Push { dc_id, body });
    }

    fn session_created(&self, dc_id: i32) {
        self.send(PushEvent::SessionCreated { dc_id });
    }
}

// ─── Running stream ───────────────────────────────────────────────────────────

/// Handle to a running update stream.
pub struct UpdateStream {
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl UpdateStream {
    pub(crate) fn spawn<S, H>(
        pool: Weak<SessionPool>,
        schema: S,
        handler: H,
        events: mpsc::UnboundedReceiver<PushEvent>,
        initial: (Position, Vec<(i64, i32)>),
        workers: usize,
        queue: usize,
    ) -> Self
    where
        S: UpdateSchema,
        H: UpdateHandler<S::Update>,
    {
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let (tx, rx) = mpsc::channel(queue.max(1));

        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);
        for _ in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            tasks.spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    match next {
                        Some(update) => handler.handle(update).await,
                        None => break,
                    }
                }
            });
        }

        let (common, channel_list) = initial;
        let mut channels = BoundedCache::new(CHANNEL_CAPACITY);
        for (id, pts) in channel_list {
            channels.insert(id, pts);
        }
        let engine = Engine {
            schema,
            pool,
            out: tx,
            common,
            channels,
            seen: BoundedCache::new(DEDUP_CAPACITY),
            last_activity: Instant::now(),
        };
        tasks.spawn(engine.run(events, cancel.clone()));
        tasks.close();

        tracing::info!("[ferrogram] update stream started with {} workers", workers.max(1));
        Self { cancel, tasks }
    }

    /// Stop fetching; updates already queued are still handled.
    pub async fn stop(self) {
        self.cancel.cancel();
        self.tasks.wait().await;
    }
}

impl Drop for UpdateStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─── Engine ───────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Check {
    Apply,
    Duplicate,
    Gap,
}

/// Compare a received counter with the local one. An unknown local value
/// (zero) accepts anything.
fn check(local: i32, value: i32, count: i32) -> Check {
    if local == 0 {
        return Check::Apply;
    }
    match (local + count).cmp(&value) {
        std::cmp::Ordering::Equal => Check::Apply,
        std::cmp::Ordering::Greater => Check::Duplicate,
        std::cmp::Ordering::Less => Check::Gap,
    }
}

struct Engine<S: UpdateSchema> {
    schema: S,
    pool: Weak<SessionPool>,
    out: mpsc::Sender<S::Update>,
    common: Position,
    channels: BoundedCache<i64, i32>,
    seen: BoundedCache<u64, ()>,
    last_activity: Instant,
}

impl<S: UpdateSchema> Engine<S> {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PushEvent>, cancel: CancellationToken) {
        self.catch_up().await;

        let mut watchdog = tokio::time::interval_at(Instant::now() + WATCHDOG_TICK, WATCHDOG_TICK);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(PushEvent::Push { dc_id, body }) => self.on_push(dc_id, body).await,
                    Some(PushEvent::SessionCreated { dc_id }) => {
                        tracing::info!("[ferrogram] new server session on DC{dc_id}, fetching difference");
                        self.recover(Scope::Common).await;
                    }
                    None => break,
                },
                _ = watchdog.tick() => {
                    if self.last_activity.elapsed() >= IDLE_PROBE_AFTER {
                        tracing::info!("[ferrogram] no updates for {:?}, probing state", IDLE_PROBE_AFTER);
                        self.probe().await;
                    }
                }
            }
        }
        tracing::info!("[ferrogram] update stream stopped");
    }

    /// Bring the positions up to date after a start.
    async fn catch_up(&mut self) {
        if self.common.pts == 0 {
            self.probe().await;
        } else {
            self.recover(Scope::Common).await;
        }
    }

    async fn on_push(&mut self, dc_id: i32, body: Vec<u8>) {
        let mut hasher = DefaultHasher::new();
        body.hash(&mut hasher);
        let digest = hasher.finish();
        if self.seen.contains(&digest) {
            tracing::debug!("[ferrogram] duplicate push from DC{dc_id} dropped");
            return;
        }
        self.seen.insert(digest, ());

        let Some(batch) = self.schema.classify(&body) else { return };
        self.last_activity = Instant::now();

        match batch {
            Batch::TooLong => {
                tracing::info!("[ferrogram] updates too long, fetching difference");
                self.recover(Scope::Common).await;
            }
            Batch::Updates { elements, seq, seq_start, date } => {
                if seq_start != 0 && self.common.seq != 0 {
                    if seq_start <= self.common.seq {
                        tracing::debug!("[ferrogram] batch seq {seq_start} already applied");
                        return;
                    }
                    if seq_start > self.common.seq + 1 {
                        tracing::warn!("[ferrogram] seq gap: local {}, batch starts at {seq_start}", self.common.seq);
                        self.recover(Scope::Common).await;
                    }
                }
                for element in elements {
                    self.apply(element).await;
                }
                if seq != 0 && seq > self.common.seq {
                    self.common.seq = seq;
                    self.common.date = date;
                    self.persist(Scope::Common);
                }
            }
        }
    }

    async fn apply(&mut self, element: Element<S::Update>) {
        let Element { scope, sequence, update } = element;
        let (value, count) = match sequence {
            Sequence::None => {
                self.deliver(update).await;
                return;
            }
            Sequence::Pts { pts, count } => (pts, count),
            Sequence::Qts { qts } => (qts, 1),
        };

        let local = self.counter(scope, sequence);
        let mismatch = check(local, value, count);
        if mismatch != Check::Apply {
            tracing::warn!("[ferrogram] {mismatch:?} in {scope:?}: local {local}, got {value} (count {count})");
            let recovery = match scope {
                Scope::Channel(_) => scope,
                Scope::Common | Scope::Secret => Scope::Common,
            };
            self.recover(recovery).await;
            match check(self.counter(scope, sequence), value, count) {
                Check::Apply => {}
                Check::Duplicate => {
                    tracing::debug!("[ferrogram] {scope:?} update at {value} already applied");
                    return;
                }
                Check::Gap => tracing::warn!("[ferrogram] gap in {scope:?} not filled, accepting update"),
            }
        }

        self.set_counter(scope, sequence, value);
        self.persist(scope);
        self.deliver(update).await;
    }

    fn counter(&self, scope: Scope, sequence: Sequence) -> i32 {
        match (scope, sequence) {
            (_, Sequence::Qts { .. }) => self.common.qts,
            (Scope::Channel(id), _) => self.channels.get(&id).copied().unwrap_or(0),
            _ => self.common.pts,
        }
    }

    fn set_counter(&mut self, scope: Scope, sequence: Sequence, value: i32) {
        match (scope, sequence) {
            (_, Sequence::Qts { .. }) => self.common.qts = value,
            (Scope::Channel(id), _) => {
                self.channels.insert(id, value);
            }
            _ => self.common.pts = value,
        }
    }

    async fn deliver(&self, update: S::Update) {
        if self.out.send(update).await.is_err() {
            tracing::debug!("[ferrogram] update workers gone, update dropped");
        }
    }

    /// Fetch differences for `scope` until the server says we are caught up.
    async fn recover(&mut self, scope: Scope) {
        let Some(pool) = self.pool.upgrade() else { return };
        for _ in 0..MAX_DIFFERENCE_ROUNDS {
            let position = match scope {
                Scope::Channel(id) => match self.channels.get(&id) {
                    Some(&pts) => Position { pts, ..Position::default() },
                    None => {
                        tracing::debug!("[ferrogram] no position for channel {id}, nothing to recover from");
                        return;
                    }
                },
                Scope::Common | Scope::Secret => self.common,
            };
            let request = self.schema.difference_request(scope, &position);
            let body = match pool.invoke_bytes(None, request).await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!("[ferrogram] difference for {scope:?} failed: {e}");
                    return;
                }
            };
            let difference = match self.schema.read_difference(scope, &body) {
                Ok(d) => d,
                Err(e) => {
                    tracing::warn!("[ferrogram] unreadable difference for {scope:?}: {e}");
                    return;
                }
            };

            tracing::debug!("[ferrogram] difference for {scope:?}: {} updates", difference.elements.len());
            for update in difference.elements {
                self.deliver(update).await;
            }
            let done = match difference.state {
                DifferenceState::Final(p) => {
                    self.set_position(scope, p);
                    true
                }
                DifferenceState::Partial(p) => {
                    self.set_position(scope, p);
                    false
                }
                DifferenceState::Empty { date, seq } => {
                    if !matches!(scope, Scope::Channel(_)) {
                        self.common.date = date;
                        self.common.seq = seq;
                    }
                    true
                }
                DifferenceState::TooLong { pts } => {
                    tracing::warn!("[ferrogram] difference for {scope:?} too long, resuming at pts {pts}");
                    self.set_position(scope, Position { pts, ..self.common });
                    true
                }
            };
            self.persist(scope);
            self.last_activity = Instant::now();
            if done {
                return;
            }
        }
        tracing::warn!("[ferrogram] difference for {scope:?} incomplete after {MAX_DIFFERENCE_ROUNDS} rounds");
    }

    fn set_position(&mut self, scope: Scope, position: Position) {
        match scope {
            Scope::Channel(id) => {
                self.channels.insert(id, position.pts);
            }
            Scope::Common | Scope::Secret => self.common = position,
        }
    }

    /// Ask for `updates.getState` and recover if the server is ahead.
    async fn probe(&mut self) {
        let Some(pool) = self.pool.upgrade() else { return };
        self.last_activity = Instant::now();
        let state = match pool.invoke(&functions::updates::GetState {}).await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("[ferrogram] updates.getState failed: {e}");
                return;
            }
        };
        drop(pool);

        if self.common.pts == 0 {
            self.common = Position { pts: state.pts, qts: state.qts, date: state.date, seq: state.seq };
            tracing::info!("[ferrogram] update state initialized at pts {}", state.pts);
            self.persist(Scope::Common);
        } else if state.pts > self.common.pts || state.qts > self.common.qts || state.seq > self.common.seq {
            tracing::info!("[ferrogram] server is at pts {}, local {}; recovering", state.pts, self.common.pts);
            self.recover(Scope::Common).await;
        }
    }

    fn persist(&self, scope: Scope) {
        let Some(pool) = self.pool.upgrade() else { return };
        let common = self.common;
        let channel = match scope {
            Scope::Channel(id) => self.channels.get(&id).map(|&pts| (id, pts)),
            Scope::Common | Scope::Secret => None,
        };
        let result = pool.store().update(|s| match channel {
            Some((id, pts)) => match s.channels.iter_mut().find(|(c, _)| *c == id) {
                Some(entry) => entry.1 = pts,
                None => s.channels.push((id, pts)),
            },
            None => s.common = common,
        });
        if let Err(e) = result {
            tracing::warn!("[ferrogram] could not persist update position: {e}");
        }
    }
}
