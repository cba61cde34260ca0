//! Sessions per DC and purpose, endpoint discovery, authorization transfer
//! and DC migration.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::{Arc, Weak};
use std::time::Duration;

use ferrogram_crypto::AuthKey;
use ferrogram_mtproto::EncryptedSession;
use ferrogram_tl::functions::{InitConnection, InvokeWithLayer, auth, help};
use ferrogram_tl::{Deserializable, RemoteCall, types};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::blocking::CryptoPool;
use crate::errors::{InvocationError, RpcError};
use crate::handshake::{self, HandshakeTarget};
use crate::retry::{self, RetryContext};
use crate::session::{NoPushes, PushSink, Session, SessionOptions};
use crate::storage::{PersistedSession, Store};
use crate::transport::{Connection, Connector};
use crate::Config;

/// `auth.importAuthorization` attempts before `AUTH_BYTES_INVALID` is final.
const IMPORT_ATTEMPTS: u32 = 3;

const PROD_DCS: &[(i32, &str)] = &[
    (1, "149.154.175.53"),
    (2, "149.154.167.51"),
    (3, "149.154.175.100"),
    (4, "149.154.167.91"),
    (5, "91.108.56.130"),
];
const TEST_DCS: &[(i32, &str)] = &[(1, "149.154.175.10"), (2, "149.154.167.40"), (3, "149.154.175.117")];

/// What a session is used for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Ordinary API calls; the home DC's primary session also receives updates.
    Primary,
    /// File transfers, on media-only endpoints when the DC has them.
    Media,
    /// Temporary, for fetching from a CDN DC. Never cached.
    Cdn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct SessionKey {
    dc_id: i32,
    mode: Mode,
}

/// The DC id the server expects in handshakes and obfuscation headers.
pub(crate) fn wire_dc_id(dc_id: i32, mode: Mode, test_mode: bool) -> i32 {
    let id = if test_mode { dc_id + 10_000 } else { dc_id };
    if mode == Mode::Media { -id } else { id }
}

/// How a `*_MIGRATE` error is followed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Migration {
    /// The account lives elsewhere: move the home DC.
    Home(i32),
    /// Only this request belongs elsewhere.
    Request(i32),
}

fn migration(error: &InvocationError) -> Option<Migration> {
    let dc_id = error.migrate_dc()?;
    if error.is("PHONE_MIGRATE") || error.is("NETWORK_MIGRATE") || error.is("USER_MIGRATE") {
        Some(Migration::Home(dc_id))
    } else {
        Some(Migration::Request(dc_id))
    }
}

#[derive(Default)]
struct DcTable {
    options: Vec<types::DcOption>,
    fetched_at: Option<Instant>,
}

/// Owns every session of one client.
///
/// The session map is guarded by one async lock held across
/// check-then-create, so concurrent callers asking for the same missing
/// session wait for a single construction.
pub struct SessionPool {
    config: Config,
    connector: Arc<dyn Connector>,
    store: Store,
    crypto: CryptoPool,
    sink: Arc<dyn PushSink>,
    dcs: std::sync::Mutex<DcTable>,
    sessions: Mutex<HashMap<SessionKey, Session>>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl SessionPool {
    pub(crate) fn new(config: Config, connector: Arc<dyn Connector>, store: Store, sink: Arc<dyn PushSink>) -> Self {
        Self {
            config,
            connector,
            store,
            crypto: CryptoPool::default(),
            sink,
            dcs: std::sync::Mutex::new(DcTable::default()),
            sessions: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn crypto(&self) -> &CryptoPool {
        &self.crypto
    }

    pub fn home_dc_id(&self) -> Result<i32, InvocationError> {
        Ok(self.store.read(|s| s.home_dc_id)?)
    }

    pub fn is_authorized(&self) -> Result<bool, InvocationError> {
        Ok(self.store.read(PersistedSession::is_authorized)?)
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    /// The session for `(dc_id, mode)`, created on first use.
    ///
    /// CDN sessions are built fresh every time and belong to the caller.
    /// A cached session whose task has stopped is replaced.
    pub async fn get_session(&self, dc_id: i32, mode: Mode) -> Result<Session, InvocationError> {
        if mode == Mode::Cdn {
            return self.open_session(dc_id, mode).await;
        }

        let key = SessionKey { dc_id, mode };
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get(&key) {
            if !session.is_closed() {
                return Ok(session.clone());
            }
            tracing::info!("[ferrogram] session for DC{dc_id} ({mode:?}) has stopped, recreating");
            sessions.remove(&key);
        }

        let session = self.open_session(dc_id, mode).await?;
        let home = self.home_dc_id()?;
        if dc_id != home && self.is_authorized()? {
            let home_key = SessionKey { dc_id: home, mode: Mode::Primary };
            let home_session = match sessions.get(&home_key) {
                Some(s) if !s.is_closed() => s.clone(),
                _ => {
                    let s = self.open_session(home, Mode::Primary).await?;
                    sessions.insert(home_key, s.clone());
                    s
                }
            };
            if let Err(e) = transfer_authorization(&home_session, &session, dc_id).await {
                session.close();
                return Err(e);
            }
        }
        sessions.insert(key, session.clone());
        Ok(session)
    }

    async fn open_session(&self, dc_id: i32, mode: Mode) -> Result<Session, InvocationError> {
        let test_mode = self.config.test_mode;
        let (ip, port) = self.resolve(dc_id, mode)?;
        let addr = if ip.contains(':') { format!("[{ip}]:{port}") } else { format!("{ip}:{port}") };
        let wire_dc = wire_dc_id(dc_id, mode, test_mode);
        let tuning = &self.config.session;

        let stored = self
            .store
            .read(|s| s.dc(dc_id).and_then(|d| d.auth_key.map(|k| (k, d.salt, d.time_offset))))?;

        let (conn, auth_key, salt, time_offset) = match stored {
            Some((key, salt, offset)) => {
                let conn = Connection::open(&self.connector, &addr, &self.config.transport, wire_dc as i16, tuning.wait_timeout)
                    .await?;
                (conn, AuthKey::from_bytes(key), salt, offset)
            }
            None => {
                tracing::info!("[ferrogram] no auth key for DC{dc_id}, negotiating one");
                let target = HandshakeTarget {
                    addr: &addr,
                    transport: &self.config.transport,
                    wire_dc_id: wire_dc,
                    step_timeout: tuning.wait_timeout,
                };
                let (conn, finished) =
                    handshake::connect_and_negotiate(&self.connector, target, &self.config.trusted_keys, &self.crypto)
                        .await?;
                self.store.update(|s| {
                    let entry = s.dc_mut(dc_id);
                    entry.auth_key = Some(finished.auth_key.to_bytes());
                    entry.salt = finished.first_salt;
                    entry.time_offset = finished.time_offset;
                    if entry.ip.is_empty() {
                        entry.ip = ip.clone();
                        entry.port = port;
                    }
                })?;
                (conn, finished.auth_key, finished.first_salt, finished.time_offset)
            }
        };

        let state = EncryptedSession::new(Arc::new(auth_key), salt, time_offset)
            .map_err(|e| InvocationError::Io(std::io::Error::other(e)))?;
        let sink: Arc<dyn PushSink> = match mode {
            Mode::Primary => Arc::clone(&self.sink),
            Mode::Media | Mode::Cdn => Arc::new(NoPushes),
        };
        let opts = SessionOptions {
            dc_id,
            mode,
            addr,
            transport: self.config.transport.clone(),
            obfuscation_dc: wire_dc as i16,
            connect_timeout: tuning.wait_timeout,
            reconnect_delay: tuning.start_timeout,
            resend: tuning.resend.clone(),
            ping_interval: tuning.ping_interval,
            disconnect_delay: tuning.disconnect_delay,
            ack_threshold: tuning.ack_threshold,
        };
        let session = Session::spawn(opts, conn, state, Arc::clone(&self.connector), sink, self.crypto.clone());

        if mode != Mode::Cdn {
            if let Err(e) = self.initialize(&session).await {
                session.close();
                return Err(e);
            }
        }
        Ok(session)
    }

    /// `invokeWithLayer(initConnection(help.getConfig))`, caching the DC list.
    async fn initialize(&self, session: &Session) -> Result<(), InvocationError> {
        let cfg = &self.config;
        let request = InvokeWithLayer {
            layer: cfg.layer,
            query: InitConnection {
                api_id: cfg.api_id,
                device_model: cfg.device_model.clone(),
                system_version: cfg.system_version.clone(),
                app_version: cfg.app_version.clone(),
                system_lang_code: cfg.system_lang_code.clone(),
                lang_pack: cfg.lang_pack.clone(),
                lang_code: cfg.lang_code.clone(),
                query: help::GetConfig {},
            },
        };
        let config = session.invoke(&request).await?;
        self.apply_config(config)
    }

    fn apply_config(&self, config: types::Config) -> Result<(), InvocationError> {
        tracing::info!(
            "[ferrogram] config received: {} DC options, this DC{}",
            config.dc_options.len(),
            config.this_dc
        );
        let general: Vec<(i32, String, u16)> = config
            .dc_options
            .iter()
            .filter(|o| !o.ipv6 && !o.media_only && !o.cdn && !o.tcpo_only)
            .filter_map(|o| u16::try_from(o.port).ok().map(|p| (o.id, o.ip_address.clone(), p)))
            .collect();
        if let Ok(mut table) = self.dcs.lock() {
            table.options = config.dc_options;
            table.fetched_at = Some(Instant::now());
        }
        self.store.update(|s| {
            for entry in s.dcs.iter_mut() {
                if let Some((_, ip, port)) = general.iter().find(|(id, _, _)| *id == entry.dc_id) {
                    entry.ip = ip.clone();
                    entry.port = *port;
                }
            }
        })?;
        Ok(())
    }

    /// Pick an address for `dc_id`: a CDN or media-only option when asked
    /// for, the general one otherwise, then stored and built-in addresses.
    fn resolve(&self, dc_id: i32, mode: Mode) -> Result<(String, u16), InvocationError> {
        let advertised = {
            let table = self.dcs.lock().map_err(|_| InvocationError::Config("DC table poisoned".into()))?;
            pick_option(&table.options, dc_id, mode, self.config.allow_ipv6).map(|o| (o.ip_address.clone(), o.port))
        };
        if let Some((ip, port)) = advertised {
            let port = u16::try_from(port)
                .map_err(|_| InvocationError::Config(format!("DC{dc_id} advertises port {port}")))?;
            return Ok((ip, port));
        }

        if let Some((ip, port)) =
            self.store.read(|s| s.dc(dc_id).filter(|d| !d.ip.is_empty()).map(|d| (d.ip.clone(), d.port)))?
        {
            return Ok((ip, port));
        }
        let builtin = if self.config.test_mode { TEST_DCS } else { PROD_DCS };
        let port = if self.config.test_mode { 80 } else { 443 };
        builtin
            .iter()
            .find(|(id, _)| *id == dc_id)
            .map(|(_, ip)| (ip.to_string(), port))
            .ok_or_else(|| InvocationError::Config(format!("no address known for DC{dc_id} ({mode:?})")))
    }

    // ── Invocation ───────────────────────────────────────────────────────

    /// Send `request` to the home DC, following flood waits, transient
    /// failures and migrations.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<R::Return, InvocationError> {
        let body = self.invoke_bytes(None, request.to_bytes()).await?;
        Ok(R::Return::from_bytes(&body)?)
    }

    /// Like [`SessionPool::invoke`] but on a specific DC and session kind.
    pub async fn invoke_on<R: RemoteCall>(&self, dc_id: i32, mode: Mode, request: &R) -> Result<R::Return, InvocationError> {
        let body = self.invoke_bytes(Some((dc_id, mode)), request.to_bytes()).await?;
        Ok(R::Return::from_bytes(&body)?)
    }

    pub(crate) async fn invoke_bytes(
        &self,
        target: Option<(i32, Mode)>,
        body: Vec<u8>,
    ) -> Result<Vec<u8>, InvocationError> {
        let mut target = target;
        let mut fail_count = NonZeroU32::MIN;
        let mut slept_so_far = Duration::ZERO;
        let mut migrated = false;

        loop {
            let (dc_id, mode) = match target {
                Some(t) => t,
                None => (self.home_dc_id()?, Mode::Primary),
            };
            let session = self.get_session(dc_id, mode).await?;
            let error = match session.invoke_raw(body.clone()).await {
                Ok(answer) => return Ok(answer),
                Err(e) => e,
            };

            if let Some(m) = migration(&error) {
                if migrated {
                    return Err(error);
                }
                migrated = true;
                match m {
                    Migration::Home(new_home) => {
                        self.migrate_home(new_home)?;
                        target = None;
                    }
                    Migration::Request(other) => {
                        tracing::info!("[ferrogram] request redirected to DC{other}");
                        target = Some((other, mode));
                    }
                }
                continue;
            }

            let ctx = RetryContext { fail_count, slept_so_far, error };
            match self.config.retry_policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    if ctx.error.flood_wait().is_some() {
                        // The session holds every sender, this one included.
                        session.suspend_for(delay);
                    } else {
                        tokio::time::sleep(delay).await;
                    }
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => return Err(retry::surface(ctx.error)),
            }
        }
    }

    fn migrate_home(&self, dc_id: i32) -> Result<(), InvocationError> {
        tracing::info!("[ferrogram] migrating home to DC{dc_id}");
        self.store.update(|s| s.home_dc_id = dc_id)?;
        Ok(())
    }

    // ── Config refresh ───────────────────────────────────────────────────

    /// Fetch `help.getConfig` on the home DC now.
    pub async fn refresh_config(&self) -> Result<(), InvocationError> {
        let config = self.invoke(&help::GetConfig {}).await?;
        self.apply_config(config)
    }

    /// True when the cached DC list is older than the configured TTL.
    pub fn config_is_stale(&self) -> bool {
        let ttl = self.config.session.config_ttl;
        self.dcs
            .lock()
            .map(|t| t.fetched_at.is_none_or(|at| at.elapsed() >= ttl))
            .unwrap_or(true)
    }

    /// Keep the DC list fresh in the background. The task holds only a weak
    /// reference and ends with the pool.
    pub(crate) fn spawn_config_refresh(self: &Arc<Self>) {
        let pool: Weak<Self> = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let ttl = self.config.session.config_ttl;
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(ttl) => {}
                }
                let Some(pool) = pool.upgrade() else { break };
                if pool.config_is_stale() {
                    if let Err(e) = pool.refresh_config().await {
                        tracing::warn!("[ferrogram] config refresh failed: {e}");
                    }
                }
            }
        });
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    /// Close every cached session and stop background tasks.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        let mut sessions = self.sessions.lock().await;
        for (_, session) in sessions.drain() {
            session.close();
        }
        self.tasks.wait().await;
    }

    /// Sessions currently cached, for diagnostics and tests.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }
}

fn pick_option(options: &[types::DcOption], dc_id: i32, mode: Mode, ipv6: bool) -> Option<&types::DcOption> {
    let mut candidates: Vec<&types::DcOption> =
        options.iter().filter(|o| o.id == dc_id && !o.tcpo_only && o.ipv6 == ipv6).collect();
    if candidates.is_empty() && ipv6 {
        candidates = options.iter().filter(|o| o.id == dc_id && !o.tcpo_only && !o.ipv6).collect();
    }

    let cdn = || candidates.iter().copied().find(|o| o.cdn);
    let media = || candidates.iter().copied().find(|o| o.media_only && !o.cdn);
    let general = || candidates.iter().copied().find(|o| !o.media_only && !o.cdn);
    match mode {
        Mode::Cdn => cdn().or_else(media).or_else(general),
        Mode::Media => media().or_else(general),
        Mode::Primary => general(),
    }
}

/// Copy the home authorization to `target` with export/import.
async fn transfer_authorization(home: &Session, target: &Session, dc_id: i32) -> Result<(), InvocationError> {
    for attempt in 1..=IMPORT_ATTEMPTS {
        let exported = home.invoke(&auth::ExportAuthorization { dc_id }).await?;
        let import = auth::ImportAuthorization { id: exported.id, bytes: exported.bytes };
        match target.invoke(&import).await {
            Ok(_) => {
                tracing::info!("[ferrogram] authorization imported into DC{dc_id}");
                return Ok(());
            }
            Err(e) if e.is("AUTH_BYTES_INVALID") => {
                tracing::warn!("[ferrogram] DC{dc_id} rejected exported authorization (attempt {attempt})");
            }
            Err(e) => return Err(e),
        }
    }
    Err(InvocationError::Rpc(RpcError { code: 400, name: "AUTH_BYTES_INVALID".into(), value: None }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rpc(code: i32, message: &str) -> InvocationError {
        InvocationError::Rpc(RpcError::from_telegram(code, message))
    }

    #[test]
    fn wire_ids() {
        assert_eq!(wire_dc_id(2, Mode::Primary, false), 2);
        assert_eq!(wire_dc_id(2, Mode::Media, false), -2);
        assert_eq!(wire_dc_id(2, Mode::Primary, true), 10_002);
        assert_eq!(wire_dc_id(4, Mode::Media, true), -10_004);
        assert_eq!(wire_dc_id(203, Mode::Cdn, false), 203);
    }

    fn option(id: i32, ip: &str, media_only: bool, cdn: bool, ipv6: bool) -> types::DcOption {
        types::DcOption { id, ip_address: ip.into(), port: 443, media_only, cdn, ipv6, ..Default::default() }
    }

    #[test]
    fn endpoint_preference_falls_back_to_general() {
        let options = vec![
            option(2, "10.0.0.1", false, false, false),
            option(2, "10.0.0.2", true, false, false),
            option(2, "::2", false, false, true),
            option(203, "10.0.0.3", false, true, false),
            option(4, "10.0.0.4", false, false, false),
        ];
        let ip = |dc, mode, v6| pick_option(&options, dc, mode, v6).map(|o| o.ip_address.as_str());
        assert_eq!(ip(2, Mode::Primary, false), Some("10.0.0.1"));
        assert_eq!(ip(2, Mode::Media, false), Some("10.0.0.2"));
        assert_eq!(ip(4, Mode::Media, false), Some("10.0.0.4"));
        assert_eq!(ip(203, Mode::Cdn, false), Some("10.0.0.3"));
        assert_eq!(ip(2, Mode::Primary, true), Some("::2"));
        assert_eq!(ip(4, Mode::Primary, true), Some("10.0.0.4"));
        assert_eq!(ip(9, Mode::Primary, false), None);
    }

    #[test]
    fn migrations_are_classified() {
        assert_eq!(migration(&rpc(303, "PHONE_MIGRATE_4")), Some(Migration::Home(4)));
        assert_eq!(migration(&rpc(303, "USER_MIGRATE_1")), Some(Migration::Home(1)));
        assert_eq!(migration(&rpc(303, "NETWORK_MIGRATE_5")), Some(Migration::Home(5)));
        assert_eq!(migration(&rpc(303, "FILE_MIGRATE_3")), Some(Migration::Request(3)));
        assert_eq!(migration(&rpc(303, "STATS_MIGRATE_2")), Some(Migration::Request(2)));
        assert_eq!(migration(&rpc(400, "PHONE_CODE_INVALID")), None);
    }
}
