//! # ferrogram-client
//!
//! Async MTProto engine on tokio.
//!
//! ## Features
//! - Abridged, Intermediate, Full and Obfuscated2 transports, direct or via SOCKS5
//! - Auth key negotiation with the heavy math off the I/O threads
//! - Encrypted sessions with batched acks, resend under the original `msg_id`,
//!   salt rotation, clock resync, keepalive and transparent reconnects
//! - One session per DC and purpose, authorization export/import, DC migration
//! - `FLOOD_WAIT` auto-sleep with a configurable policy
//! - Gap-checked update delivery to a bounded worker pool
//! - Chunked downloads (including verified CDN downloads) and parallel uploads
//! - Pluggable session persistence and portable session strings
//!
//! The engine does not carry the application schema. Any request type that
//! implements [`ferrogram_tl::RemoteCall`] can be sent with [`Client::invoke`];
//! updates are decoded by an [`UpdateSchema`] the caller provides.

#![deny(unsafe_code)]

mod blocking;
mod errors;
mod handshake;
mod retry;

pub mod cache;
pub mod pool;
pub mod session;
pub mod socks5;
pub mod storage;
pub mod transfer;
pub mod transport;
pub mod updates;

use std::sync::Arc;
use std::time::Duration;

use ferrogram_mtproto::authentication::TrustedKeys;
use ferrogram_tl::RemoteCall;
use tokio::sync::Semaphore;

pub use blocking::CryptoPool;
pub use cache::BoundedCache;
pub use errors::{InvocationError, RpcError};
pub use handshake::{HANDSHAKE_ATTEMPTS, HandshakeTarget, connect_and_negotiate, negotiate};
pub use pool::{Mode, SessionPool};
pub use retry::{AutoSleep, NoRetries, RetryContext, RetryPolicy};
pub use session::{NoPushes, PushSink, ResendConfig, Session};
pub use socks5::Socks5Config;
pub use storage::{BinaryFileBackend, DcEntry, InMemoryBackend, PersistedSession, Position, SessionBackend};
#[cfg(feature = "sqlite-session")]
pub use storage::SqliteBackend;
pub use transfer::{DownloadIter, FileLocation, TransferOutcome, UploadedFile};
pub use transport::{Connection, Connector, TcpConnector, TransportKind};
pub use updates::{
    Batch, Difference, DifferenceState, Element, IDLE_PROBE_AFTER, Scope, Sequence, UpdateHandler, UpdateSchema,
    UpdateStream,
};

use storage::Store;
use updates::PushRouter;

// ─── Config ───────────────────────────────────────────────────────────────────

/// Engine tunables that are plain data.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct SessionConfig {
    /// Delay before the first reconnect attempt; later attempts back off.
    pub start_timeout: Duration,
    /// Bound on connecting and on every handshake step.
    pub wait_timeout: Duration,
    pub resend: ResendConfig,
    pub ping_interval: Duration,
    /// The server closes the connection after this much silence.
    pub disconnect_delay: Duration,
    /// Pending acks that force a flush.
    pub ack_threshold: usize,
    pub update_workers: usize,
    /// Accepted updates waiting for a free worker.
    pub update_queue: usize,
    /// Parallel chunk requests per direction, across all transfers.
    pub max_concurrent_transmissions: usize,
    /// How long a fetched DC list stays fresh.
    pub config_ttl: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self {
            start_timeout: Duration::from_secs(2),
            wait_timeout: Duration::from_secs(15),
            resend: ResendConfig::default(),
            ping_interval: Duration::from_secs(5),
            disconnect_delay: Duration::from_secs(25),
            ack_threshold: 10,
            update_workers: (cpus + 4).min(32),
            update_queue: 1000,
            max_concurrent_transmissions: 1,
            config_ttl: Duration::from_secs(3600),
        }
    }
}

/// Configuration for [`Client::connect`].
#[derive(Clone)]
pub struct Config {
    pub api_id: i32,
    pub api_hash: String,
    pub device_model: String,
    pub system_version: String,
    pub app_version: String,
    pub system_lang_code: String,
    pub lang_pack: String,
    pub lang_code: String,
    /// Which MTProto transport framing to use (default: Intermediate).
    pub transport: TransportKind,
    /// Optional SOCKS5 proxy; every connection is tunnelled through it.
    pub socks5: Option<Socks5Config>,
    /// Talk to the test DCs.
    pub test_mode: bool,
    /// Allow IPv6 DC addresses (default: false).
    pub allow_ipv6: bool,
    /// API layer announced in `invokeWithLayer`.
    pub layer: i32,
    pub retry_policy: Arc<dyn RetryPolicy>,
    /// Session persistence backend (default: binary file `"ferrogram.session"`).
    pub session_backend: Arc<dyn SessionBackend>,
    /// RSA keys a server must prove it holds during key negotiation.
    pub trusted_keys: Arc<TrustedKeys>,
    pub session: SessionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_id: 0,
            api_hash: String::new(),
            device_model: "ferrogram".into(),
            system_version: std::env::consts::OS.into(),
            app_version: env!("CARGO_PKG_VERSION").into(),
            system_lang_code: "en".into(),
            lang_pack: String::new(),
            lang_code: "en".into(),
            transport: TransportKind::default(),
            socks5: None,
            test_mode: false,
            allow_ipv6: false,
            layer: ferrogram_tl::LAYER,
            retry_policy: Arc::new(AutoSleep::default()),
            session_backend: Arc::new(BinaryFileBackend::new("ferrogram.session")),
            trusted_keys: Arc::new(TrustedKeys::builtin()),
            session: SessionConfig::default(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("api_id", &self.api_id)
            .field("transport", &self.transport)
            .field("test_mode", &self.test_mode)
            .field("layer", &self.layer)
            .field("session_backend", &self.session_backend.name())
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientInner {
    pool: Arc<SessionPool>,
    router: Arc<PushRouter>,
    downloads: Arc<Semaphore>,
    uploads: Arc<Semaphore>,
}

/// The engine's entry point. Cheap to clone; clones share every session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Load the stored session (if any) and connect to the home DC.
    pub async fn connect(config: Config) -> Result<Self, InvocationError> {
        let connector: Arc<dyn Connector> = Arc::new(TcpConnector::new(config.socks5.clone()));
        Self::connect_with(config, connector).await
    }

    /// Like [`Client::connect`], opening connections through `connector`.
    pub async fn connect_with(config: Config, connector: Arc<dyn Connector>) -> Result<Self, InvocationError> {
        let fallback = PersistedSession { test_mode: config.test_mode, ..PersistedSession::default() };
        let store = Store::open(Arc::clone(&config.session_backend), fallback)?;
        let permits = config.session.max_concurrent_transmissions.max(1);

        let router = Arc::new(PushRouter::default());
        let sink: Arc<dyn PushSink> = router.clone();
        let pool = Arc::new(SessionPool::new(config, connector, store, sink));

        let home = pool.home_dc_id()?;
        tracing::info!("[ferrogram] connecting to home DC{home}");
        pool.get_session(home, Mode::Primary).await?;
        pool.spawn_config_refresh();

        Ok(Self {
            inner: Arc::new(ClientInner {
                pool,
                router,
                downloads: Arc::new(Semaphore::new(permits)),
                uploads: Arc::new(Semaphore::new(permits)),
            }),
        })
    }

    /// Send `request` to the home DC.
    ///
    /// Flood waits under the retry policy's threshold, transient failures
    /// and `*_MIGRATE` redirects are handled here; everything else reaches
    /// the caller.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        self.inner.pool.invoke(request).await
    }

    /// Send `request` to a specific DC, transferring the authorization first
    /// if needed.
    pub async fn invoke_on_dc<R: RemoteCall>(&self, dc_id: i32, request: &R) -> Result<R::Return, InvocationError> {
        self.inner.pool.invoke_on(dc_id, Mode::Primary, request).await
    }

    /// The session for a DC and purpose, for callers that manage their own
    /// retries.
    pub async fn session(&self, dc_id: i32, mode: Mode) -> Result<Session, InvocationError> {
        self.inner.pool.get_session(dc_id, mode).await
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.inner.pool
    }

    pub fn is_authorized(&self) -> Result<bool, InvocationError> {
        self.inner.pool.is_authorized()
    }

    /// Record the account a login layer signed in. From now on sessions on
    /// other DCs receive the authorization before their first request.
    pub fn set_authorized(&self, user_id: i64, bot: bool) -> Result<(), InvocationError> {
        tracing::info!("[ferrogram] authorized as {user_id} (bot: {bot})");
        self.inner.pool.store().update(|s| {
            s.user_id = Some(user_id);
            s.bot = bot;
        })?;
        Ok(())
    }

    /// Start delivering updates to `handler`.
    ///
    /// Only one stream receives pushes at a time; starting another replaces
    /// the previous one's feed.
    pub fn spawn_updates<S, H>(&self, schema: S, handler: H) -> Result<UpdateStream, InvocationError>
    where
        S: UpdateSchema,
        H: UpdateHandler<S::Update>,
    {
        let pool = &self.inner.pool;
        let initial = pool.store().read(|s| (s.common, s.channels.clone()))?;
        let tuning = &pool.config().session;
        Ok(UpdateStream::spawn(
            Arc::downgrade(pool),
            schema,
            handler,
            self.inner.router.attach(),
            initial,
            tuning.update_workers,
            tuning.update_queue,
        ))
    }

    /// A portable string holding the home DC's auth key and the account.
    pub fn export_session_string(&self) -> Result<String, InvocationError> {
        let api_id = self.inner.pool.config().api_id;
        Ok(self.inner.pool.store().read(|s| s.export_string(api_id))??)
    }

    /// Close every session and stop background tasks.
    pub async fn disconnect(&self) {
        self.inner.pool.close().await;
        tracing::info!("[ferrogram] disconnected");
    }

    /// Disconnect and delete the stored session, auth keys included.
    pub async fn forget_session(&self) -> Result<(), InvocationError> {
        self.disconnect().await;
        self.inner.pool.store().delete()?;
        tracing::info!("[ferrogram] stored session deleted");
        Ok(())
    }
}
