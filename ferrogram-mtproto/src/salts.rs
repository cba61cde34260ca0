//! Server salts and their validity windows.

use ferrogram_tl::types::FutureSalt;

/// How long before the last known salt expires a refresh is requested.
pub const REFRESH_MARGIN_SECS: i32 = 10 * 60;

/// The salt in use plus any future salts announced by the server.
#[derive(Clone, Debug)]
pub struct SaltSet {
    current: i64,
    future: Vec<FutureSalt>,
}

impl SaltSet {
    pub fn new(current: i64) -> Self {
        Self { current, future: Vec::new() }
    }

    /// The salt last put into use.
    pub fn current(&self) -> i64 { self.current }

    /// Adopt a salt the server told us to use. A correction means the
    /// announced list can no longer be trusted, so it is dropped.
    pub fn set_current(&mut self, salt: i64) {
        self.current = salt;
        self.future.clear();
    }

    /// Replace the future salt list with a fresh `future_salts` answer.
    pub fn store_future(&mut self, mut salts: Vec<FutureSalt>) {
        salts.sort_by_key(|s| s.valid_since);
        self.future = salts;
    }

    /// Pick the salt to use at `server_now`, dropping expired entries.
    ///
    /// The newest salt whose window covers `server_now` wins; with none
    /// known the current one is kept.
    pub fn select(&mut self, server_now: i32) -> i64 {
        self.future.retain(|s| s.valid_until > server_now);
        if let Some(s) = self.future.iter().rev().find(|s| s.valid_since <= server_now) {
            self.current = s.salt;
        }
        self.current
    }

    /// True when no known salt covers the next [`REFRESH_MARGIN_SECS`].
    pub fn needs_refresh(&self, server_now: i32) -> bool {
        let horizon = server_now.saturating_add(REFRESH_MARGIN_SECS);
        !self.future.iter().any(|s| s.valid_until > horizon)
    }

    pub fn future_count(&self) -> usize { self.future.len() }
}
