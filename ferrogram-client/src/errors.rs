//! Error types for ferrogram-client.

use std::time::Duration;
use std::{fmt, io};

use ferrogram_mtproto::authentication;
use ferrogram_mtproto::encrypted::UnpackError;
use ferrogram_mtproto::transport::FramingError;

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// A numeric argument embedded in the name is taken out and placed in
/// [`RpcError::value`], wherever it appears:
///
/// * `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30) }`
/// * `FILE_PART_3_MISSING` → `RpcError { code: 400, name: "FILE_PART_MISSING", value: Some(3) }`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code: i32,
    /// Error name in SCREAMING_SNAKE_CASE with the numeric part removed.
    pub name: String,
    /// Numeric argument extracted from the name, if any.
    pub value: Option<u32>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        let mut value = None;
        let mut parts = Vec::new();
        for part in message.split('_') {
            if value.is_none() && !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(v) = part.parse::<u32>() {
                    value = Some(v);
                    continue;
                }
            }
            parts.push(part);
        }
        match value {
            Some(_) => Self { code, name: parts.join("_"), value },
            None => Self { code, name: message.to_string(), value: None },
        }
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_MIGRATE")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// The wait a rate-limit error asks for.
    pub fn flood_wait(&self) -> Option<Duration> {
        if self.code == 420 && matches!(self.name.as_str(), "FLOOD_WAIT" | "FLOOD_PREMIUM_WAIT" | "SLOWMODE_WAIT") {
            self.value.map(|v| Duration::from_secs(v as u64))
        } else {
            None
        }
    }

    /// The DC a `*_MIGRATE_X` error points at.
    pub fn migrate_dc(&self) -> Option<i32> {
        if self.code == 303 && self.is("*_MIGRATE") {
            self.value.map(|v| v as i32)
        } else {
            None
        }
    }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from anything that talks to the server.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    /// The server rejected the request.
    #[error("{0}")]
    Rpc(RpcError),
    /// Network failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The response could not be decoded.
    #[error("deserialize error: {0}")]
    Deserialize(String),
    /// The server dropped the answer, or the session went away before it came.
    #[error("request dropped")]
    Dropped,
    /// No answer within the configured bounds.
    #[error("request timed out")]
    Timeout,
    /// A rate limit longer than the configured sleep threshold.
    #[error("flood wait of {}s exceeds the sleep threshold", .0.as_secs())]
    FloodWait(Duration),
    /// A transport-level error code (`-404`, `-429`, `-444`, ...).
    #[error("transport error {0}")]
    Transport(i32),
    /// The auth key exchange failed a check.
    #[error("handshake failed: {0}")]
    Handshake(#[from] authentication::Error),
    /// An encrypted message failed its checks: possible tampering.
    #[error("security check failed: {0}")]
    Security(String),
    /// `bad_msg_notification` with a code the session cannot recover from.
    #[error("bad message notification {0}")]
    BadMessage(i32),
    /// No usable endpoint or another configuration problem.
    #[error("configuration error: {0}")]
    Config(String),
    /// A CDN chunk did not match the hash the origin DC announced.
    #[error("CDN data at offset {offset} failed hash verification")]
    CdnHashMismatch { offset: i64 },
    /// The session task has stopped.
    #[error("session closed")]
    SessionClosed,
}

impl From<ferrogram_tl::deserialize::Error> for InvocationError {
    fn from(e: ferrogram_tl::deserialize::Error) -> Self { Self::Deserialize(e.to_string()) }
}

impl From<FramingError> for InvocationError {
    fn from(e: FramingError) -> Self {
        match e {
            FramingError::Transport(code) => Self::Transport(code),
            other => Self::Io(io::Error::new(io::ErrorKind::InvalidData, other)),
        }
    }
}

impl From<UnpackError> for InvocationError {
    fn from(e: UnpackError) -> Self { Self::Security(e.to_string()) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _ => false,
        }
    }

    /// The wait requested by a rate-limit error, whether it came back as an
    /// RPC error or was already surfaced as [`InvocationError::FloodWait`].
    pub fn flood_wait(&self) -> Option<Duration> {
        match self {
            Self::Rpc(e) => e.flood_wait(),
            Self::FloodWait(d) => Some(*d),
            _ => None,
        }
    }

    /// The DC to retry on for a `*_MIGRATE_X` error.
    pub fn migrate_dc(&self) -> Option<i32> {
        match self {
            Self::Rpc(e) => e.migrate_dc(),
            _ => None,
        }
    }

    /// Network conditions that a reconnect or a short pause may cure.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Timeout | Self::Dropped => true,
            Self::Transport(code) => !matches!(code, -404 | -444),
            Self::Rpc(e) => e.code == 500 || e.code == -503,
            _ => false,
        }
    }

    /// Rebuild an equivalent error; `io::Error` is not `Clone`.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Rpc(e) => Self::Rpc(e.clone()),
            Self::Io(e) => Self::Io(io::Error::new(e.kind(), e.to_string())),
            Self::Deserialize(s) => Self::Deserialize(s.clone()),
            Self::Dropped => Self::Dropped,
            Self::Timeout => Self::Timeout,
            Self::FloodWait(d) => Self::FloodWait(*d),
            Self::Transport(c) => Self::Transport(*c),
            Self::Handshake(e) => Self::Handshake(e.clone()),
            Self::Security(s) => Self::Security(s.clone()),
            Self::BadMessage(c) => Self::BadMessage(*c),
            Self::Config(s) => Self::Config(s.clone()),
            Self::CdnHashMismatch { offset } => Self::CdnHashMismatch { offset: *offset },
            Self::SessionClosed => Self::SessionClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_is_taken_from_the_end() {
        let e = RpcError::from_telegram(420, "FLOOD_WAIT_30");
        assert_eq!(e.name, "FLOOD_WAIT");
        assert_eq!(e.value, Some(30));
        assert_eq!(e.flood_wait(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn value_is_taken_from_the_middle() {
        let e = RpcError::from_telegram(400, "FILE_PART_3_MISSING");
        assert_eq!(e.name, "FILE_PART_MISSING");
        assert_eq!(e.value, Some(3));
    }

    #[test]
    fn names_without_numbers_are_kept() {
        let e = RpcError::from_telegram(400, "AUTH_BYTES_INVALID");
        assert_eq!(e.name, "AUTH_BYTES_INVALID");
        assert_eq!(e.value, None);
    }

    #[test]
    fn wildcards() {
        let e = RpcError::from_telegram(303, "PHONE_MIGRATE_4");
        assert!(e.is("PHONE_MIGRATE"));
        assert!(e.is("*_MIGRATE"));
        assert!(e.is("PHONE_*"));
        assert!(!e.is("FILE_MIGRATE"));
        assert_eq!(e.migrate_dc(), Some(4));
    }

    #[test]
    fn flood_wait_needs_420() {
        assert_eq!(RpcError::from_telegram(400, "FLOOD_WAIT_5").flood_wait(), None);
    }

    #[test]
    fn transient_classification() {
        assert!(InvocationError::Transport(-429).is_transient());
        assert!(!InvocationError::Transport(-404).is_transient());
        assert!(InvocationError::Timeout.is_transient());
        assert!(!InvocationError::Security("x".into()).is_transient());
        assert!(!InvocationError::Rpc(RpcError::from_telegram(400, "PEER_ID_INVALID")).is_transient());
    }

    #[test]
    fn handshake_failures_keep_their_kind() {
        let err = InvocationError::from(authentication::Error::UntrustedServer { fingerprints: vec![0x1234] });
        assert!(matches!(
            &err,
            InvocationError::Handshake(authentication::Error::UntrustedServer { fingerprints }) if fingerprints == &[0x1234]
        ));
        assert!(!err.is_transient());
        assert!(matches!(err.duplicate(), InvocationError::Handshake(authentication::Error::UntrustedServer { .. })));

        let err = InvocationError::from(authentication::Error::InvalidNonce);
        assert_eq!(err.to_string(), "handshake failed: nonce mismatch");
    }
}
