//! Pluggable session storage.
//!
//! The [`SessionBackend`] trait abstracts over where the engine keeps what it
//! must remember across restarts: the home DC, per-DC auth keys, salts and
//! clock offsets, and the update stream positions.
//!
//! Built-in backends:
//! * [`BinaryFileBackend`]: a compact binary file, replaced atomically on save.
//! * [`InMemoryBackend`]: nothing touches the disk.
//! * [`SqliteBackend`]: SQLite (requires the `sqlite-session` Cargo feature).
//!
//! [`PersistedSession::export_string`] produces a portable session string
//! holding just the home DC's key.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;

// ─── Data ─────────────────────────────────────────────────────────────────────

/// One DC the client has talked to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcEntry {
    pub dc_id: i32,
    /// Empty when the address is not known yet.
    pub ip: String,
    pub port: u16,
    pub auth_key: Option<[u8; 256]>,
    pub salt: i64,
    pub time_offset: i32,
}

impl DcEntry {
    pub fn new(dc_id: i32) -> Self {
        Self { dc_id, ip: String::new(), port: 0, auth_key: None, salt: 0, time_offset: 0 }
    }

    /// `ip:port`, with IPv6 addresses bracketed.
    pub fn addr(&self) -> Option<String> {
        if self.ip.is_empty() {
            None
        } else if self.ip.contains(':') {
            Some(format!("[{}]:{}", self.ip, self.port))
        } else {
            Some(format!("{}:{}", self.ip, self.port))
        }
    }
}

/// Update sequence counters for one scope.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Position {
    pub pts: i32,
    pub qts: i32,
    pub date: i32,
    pub seq: i32,
}

/// Everything the engine persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedSession {
    pub home_dc_id: i32,
    pub test_mode: bool,
    /// Set once a login layer reports an authorized user.
    pub user_id: Option<i64>,
    pub bot: bool,
    pub dcs: Vec<DcEntry>,
    pub common: Position,
    /// `(channel_id, pts)`
    pub channels: Vec<(i64, i32)>,
}

impl Default for PersistedSession {
    fn default() -> Self {
        Self {
            home_dc_id: 2,
            test_mode: false,
            user_id: None,
            bot: false,
            dcs: Vec::new(),
            common: Position::default(),
            channels: Vec::new(),
        }
    }
}

const MAGIC: &[u8; 4] = b"FGS\x01";

impl PersistedSession {
    pub fn dc(&self, dc_id: i32) -> Option<&DcEntry> {
        self.dcs.iter().find(|d| d.dc_id == dc_id)
    }

    /// The entry for `dc_id`, created empty if missing.
    pub fn dc_mut(&mut self, dc_id: i32) -> &mut DcEntry {
        match self.dcs.iter().position(|d| d.dc_id == dc_id) {
            Some(i) => &mut self.dcs[i],
            None => {
                self.dcs.push(DcEntry::new(dc_id));
                let last = self.dcs.len() - 1;
                &mut self.dcs[last]
            }
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.user_id.is_some()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(64 + self.dcs.len() * 300);
        b.extend_from_slice(MAGIC);
        b.extend_from_slice(&self.home_dc_id.to_le_bytes());
        b.push(self.test_mode as u8);
        b.push(self.bot as u8);
        match self.user_id {
            Some(id) => {
                b.push(1);
                b.extend_from_slice(&id.to_le_bytes());
            }
            None => b.push(0),
        }
        for v in [self.common.pts, self.common.qts, self.common.date, self.common.seq] {
            b.extend_from_slice(&v.to_le_bytes());
        }
        b.extend_from_slice(&(self.dcs.len() as u16).to_le_bytes());
        for d in &self.dcs {
            b.extend_from_slice(&d.dc_id.to_le_bytes());
            let ip = d.ip.as_bytes();
            b.push(ip.len().min(255) as u8);
            b.extend_from_slice(&ip[..ip.len().min(255)]);
            b.extend_from_slice(&d.port.to_le_bytes());
            match &d.auth_key {
                Some(k) => {
                    b.push(1);
                    b.extend_from_slice(k);
                }
                None => b.push(0),
            }
            b.extend_from_slice(&d.salt.to_le_bytes());
            b.extend_from_slice(&d.time_offset.to_le_bytes());
        }
        b.extend_from_slice(&(self.channels.len() as u32).to_le_bytes());
        for (id, pts) in &self.channels {
            b.extend_from_slice(&id.to_le_bytes());
            b.extend_from_slice(&pts.to_le_bytes());
        }
        b
    }

    pub fn from_bytes(buf: &[u8]) -> io::Result<Self> {
        let mut r = Reader { buf, pos: 0 };
        if r.take(4)? != MAGIC {
            return Err(invalid("not a ferrogram session file"));
        }
        let home_dc_id = r.i32()?;
        let test_mode = r.u8()? != 0;
        let bot = r.u8()? != 0;
        let user_id = if r.u8()? == 1 { Some(r.i64()?) } else { None };
        let common = Position { pts: r.i32()?, qts: r.i32()?, date: r.i32()?, seq: r.i32()? };

        let dc_count = r.u16()? as usize;
        let mut dcs = Vec::with_capacity(dc_count);
        for _ in 0..dc_count {
            let dc_id = r.i32()?;
            let ip_len = r.u8()? as usize;
            let ip = String::from_utf8_lossy(r.take(ip_len)?).into_owned();
            let port = r.u16()?;
            let auth_key = if r.u8()? == 1 {
                let mut k = [0u8; 256];
                k.copy_from_slice(r.take(256)?);
                Some(k)
            } else {
                None
            };
            dcs.push(DcEntry { dc_id, ip, port, auth_key, salt: r.i64()?, time_offset: r.i32()? });
        }

        let channel_count = r.u32()? as usize;
        let mut channels = Vec::with_capacity(channel_count.min(4096));
        for _ in 0..channel_count {
            channels.push((r.i64()?, r.i32()?));
        }
        Ok(Self { home_dc_id, test_mode, user_id, bot, dcs, common, channels })
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, self.to_bytes())?;
        std::fs::rename(&tmp, path)
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// A URL-safe base64 session string:
    /// `dc_id:u8 api_id:u32 test_mode:u8 auth_key:[u8;256] user_id:u64 bot:u8`,
    /// all big-endian.
    pub fn export_string(&self, api_id: i32) -> io::Result<String> {
        let key = self
            .dc(self.home_dc_id)
            .and_then(|d| d.auth_key)
            .ok_or_else(|| invalid("the home DC has no auth key yet"))?;
        let mut b = Vec::with_capacity(271);
        b.push(self.home_dc_id as u8);
        b.extend_from_slice(&(api_id as u32).to_be_bytes());
        b.push(self.test_mode as u8);
        b.extend_from_slice(&key);
        b.extend_from_slice(&(self.user_id.unwrap_or(0) as u64).to_be_bytes());
        b.push(self.bot as u8);
        Ok(URL_SAFE_NO_PAD.encode(b))
    }

    /// Parse a string made by [`export_string`](Self::export_string).
    /// Returns the session and the api id it was made for.
    pub fn import_string(s: &str) -> io::Result<(Self, i32)> {
        let raw = URL_SAFE_NO_PAD
            .decode(s.trim_end_matches('='))
            .map_err(|e| invalid(&format!("bad session string: {e}")))?;
        if raw.len() != 271 {
            return Err(invalid("session string has the wrong length"));
        }
        let mut r = Reader { buf: &raw, pos: 0 };
        let home_dc_id = r.u8()? as i32;
        let api_id = u32::from_be_bytes(r.array()?) as i32;
        let test_mode = r.u8()? != 0;
        let mut key = [0u8; 256];
        key.copy_from_slice(r.take(256)?);
        let user_id = u64::from_be_bytes(r.array()?) as i64;
        let bot = r.u8()? != 0;

        let mut dc = DcEntry::new(home_dc_id);
        dc.auth_key = Some(key);
        let session = Self {
            home_dc_id,
            test_mode,
            user_id: (user_id != 0).then_some(user_id),
            bot,
            dcs: vec![dc],
            ..Self::default()
        };
        Ok((session, api_id))
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(invalid("truncated session"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn array<const N: usize>(&mut self) -> io::Result<[u8; N]> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    fn u8(&mut self) -> io::Result<u8> { Ok(self.take(1)?[0]) }
    fn u16(&mut self) -> io::Result<u16> { Ok(u16::from_le_bytes(self.array()?)) }
    fn u32(&mut self) -> io::Result<u32> { Ok(u32::from_le_bytes(self.array()?)) }
    fn i32(&mut self) -> io::Result<i32> { Ok(i32::from_le_bytes(self.array()?)) }
    fn i64(&mut self) -> io::Result<i64> { Ok(i64::from_le_bytes(self.array()?)) }
}

// ─── Trait ────────────────────────────────────────────────────────────────────

/// Where and how session data is persisted.
pub trait SessionBackend: Send + Sync {
    /// Persist the given session.
    fn save(&self, session: &PersistedSession) -> io::Result<()>;

    /// Load a previously persisted session, or `None` if none exists.
    fn load(&self) -> io::Result<Option<PersistedSession>>;

    /// Remove the stored session (e.g. on sign-out).
    fn delete(&self) -> io::Result<()>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── BinaryFileBackend ────────────────────────────────────────────────────────

/// The default backend: one binary file, written to a temporary sibling and
/// renamed over the old one so a crash never leaves half a session behind.
pub struct BinaryFileBackend {
    path: PathBuf,
}

impl BinaryFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SessionBackend for BinaryFileBackend {
    fn save(&self, session: &PersistedSession) -> io::Result<()> {
        session.save(&self.path)
    }

    fn load(&self) -> io::Result<Option<PersistedSession>> {
        if !self.path.exists() {
            return Ok(None);
        }
        PersistedSession::load(&self.path).map(Some)
    }

    fn delete(&self) -> io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn name(&self) -> &str { "binary-file" }
}

// ─── InMemoryBackend ─────────────────────────────────────────────────────────

/// An ephemeral backend that stores nothing on disk.
///
/// Useful for tests, or for bots that should always start fresh.
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<Option<PersistedSession>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with `session` already stored.
    pub fn with_session(session: PersistedSession) -> Self {
        Self { data: Mutex::new(Some(session)) }
    }

    fn slot(&self) -> io::Result<std::sync::MutexGuard<'_, Option<PersistedSession>>> {
        self.data.lock().map_err(|_| io::Error::other("session store poisoned"))
    }
}

impl SessionBackend for InMemoryBackend {
    fn save(&self, session: &PersistedSession) -> io::Result<()> {
        *self.slot()? = Some(session.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<PersistedSession>> {
        Ok(self.slot()?.clone())
    }

    fn delete(&self) -> io::Result<()> {
        *self.slot()? = None;
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── SqliteBackend ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-session")]
pub use sqlite_backend::SqliteBackend;

#[cfg(feature = "sqlite-session")]
mod sqlite_backend {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};

    fn db_err(e: rusqlite::Error) -> io::Error {
        io::Error::other(e)
    }

    /// SQLite-backed session store.
    ///
    /// Tables: `meta` (key/value), `dc_entries` and `channel_pts`.
    pub struct SqliteBackend {
        path: PathBuf,
    }

    impl SqliteBackend {
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            // Create the schema now so errors surface early.
            let conn = Connection::open(&path).map_err(db_err)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS meta (
                    key   TEXT PRIMARY KEY,
                    value INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS dc_entries (
                    dc_id       INTEGER PRIMARY KEY,
                    ip          TEXT    NOT NULL,
                    port        INTEGER NOT NULL,
                    auth_key    BLOB,
                    salt        INTEGER NOT NULL DEFAULT 0,
                    time_offset INTEGER NOT NULL DEFAULT 0
                );
                CREATE TABLE IF NOT EXISTS channel_pts (
                    channel_id INTEGER PRIMARY KEY,
                    pts        INTEGER NOT NULL
                );",
            )
            .map_err(db_err)?;
            Ok(Self { path })
        }
    }

    impl SessionBackend for SqliteBackend {
        fn save(&self, session: &PersistedSession) -> io::Result<()> {
            let mut conn = Connection::open(&self.path).map_err(db_err)?;
            let tx = conn.transaction().map_err(db_err)?;

            let meta: [(&str, i64); 8] = [
                ("home_dc_id", session.home_dc_id as i64),
                ("test_mode", session.test_mode as i64),
                ("bot", session.bot as i64),
                ("user_id", session.user_id.unwrap_or(0)),
                ("pts", session.common.pts as i64),
                ("qts", session.common.qts as i64),
                ("date", session.common.date as i64),
                ("seq", session.common.seq as i64),
            ];
            for (key, value) in meta {
                tx.execute("INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)", params![key, value])
                    .map_err(db_err)?;
            }

            tx.execute("DELETE FROM dc_entries", []).map_err(db_err)?;
            for dc in &session.dcs {
                let key_blob: Option<Vec<u8>> = dc.auth_key.map(|k| k.to_vec());
                tx.execute(
                    "INSERT INTO dc_entries (dc_id, ip, port, auth_key, salt, time_offset)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![dc.dc_id, dc.ip, dc.port, key_blob, dc.salt, dc.time_offset],
                )
                .map_err(db_err)?;
            }

            tx.execute("DELETE FROM channel_pts", []).map_err(db_err)?;
            for (id, pts) in &session.channels {
                tx.execute("INSERT INTO channel_pts (channel_id, pts) VALUES (?1, ?2)", params![id, pts])
                    .map_err(db_err)?;
            }
            tx.commit().map_err(db_err)
        }

        fn load(&self) -> io::Result<Option<PersistedSession>> {
            if !self.path.exists() {
                return Ok(None);
            }
            let conn = Connection::open(&self.path).map_err(db_err)?;
            let meta = |key: &str| -> io::Result<Option<i64>> {
                conn.query_row("SELECT value FROM meta WHERE key = ?1", params![key], |row| row.get(0))
                    .optional()
                    .map_err(db_err)
            };

            let Some(home_dc_id) = meta("home_dc_id")? else {
                return Ok(None);
            };
            let user_id = meta("user_id")?.filter(|&id| id != 0);
            let common = Position {
                pts: meta("pts")?.unwrap_or(0) as i32,
                qts: meta("qts")?.unwrap_or(0) as i32,
                date: meta("date")?.unwrap_or(0) as i32,
                seq: meta("seq")?.unwrap_or(0) as i32,
            };

            let mut stmt = conn
                .prepare("SELECT dc_id, ip, port, auth_key, salt, time_offset FROM dc_entries")
                .map_err(db_err)?;
            let dcs = stmt
                .query_map([], |row| {
                    let key_blob: Option<Vec<u8>> = row.get(3)?;
                    Ok(DcEntry {
                        dc_id: row.get(0)?,
                        ip: row.get(1)?,
                        port: row.get(2)?,
                        auth_key: key_blob.and_then(|k| <[u8; 256]>::try_from(k.as_slice()).ok()),
                        salt: row.get(4)?,
                        time_offset: row.get(5)?,
                    })
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;

            let mut stmt = conn.prepare("SELECT channel_id, pts FROM channel_pts").map_err(db_err)?;
            let channels = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;

            Ok(Some(PersistedSession {
                home_dc_id: home_dc_id as i32,
                test_mode: meta("test_mode")?.unwrap_or(0) != 0,
                user_id,
                bot: meta("bot")?.unwrap_or(0) != 0,
                dcs,
                common,
                channels,
            }))
        }

        fn delete(&self) -> io::Result<()> {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }
}

// ─── Store ────────────────────────────────────────────────────────────────────

/// The in-memory copy of the session plus the backend it is written to.
/// Every mutation goes through [`Store::update`], which saves immediately.
pub(crate) struct Store {
    backend: Arc<dyn SessionBackend>,
    state: Mutex<PersistedSession>,
}

impl Store {
    pub(crate) fn open(backend: Arc<dyn SessionBackend>, fallback: PersistedSession) -> io::Result<Self> {
        let state = match backend.load()? {
            Some(s) => {
                tracing::info!("[ferrogram] loaded session from {} backend (home DC{})", backend.name(), s.home_dc_id);
                s
            }
            None => fallback,
        };
        Ok(Self { backend, state: Mutex::new(state) })
    }

    fn lock(&self) -> io::Result<std::sync::MutexGuard<'_, PersistedSession>> {
        self.state.lock().map_err(|_| io::Error::other("session state poisoned"))
    }

    pub(crate) fn snapshot(&self) -> io::Result<PersistedSession> {
        Ok(self.lock()?.clone())
    }

    pub(crate) fn read<T>(&self, f: impl FnOnce(&PersistedSession) -> T) -> io::Result<T> {
        let state = self.lock()?;
        Ok(f(&state))
    }

    pub(crate) fn update<T>(&self, f: impl FnOnce(&mut PersistedSession) -> T) -> io::Result<T> {
        let mut state = self.lock()?;
        let out = f(&mut state);
        self.backend.save(&state)?;
        Ok(out)
    }

    pub(crate) fn delete(&self) -> io::Result<()> {
        self.backend.delete()
    }
}
