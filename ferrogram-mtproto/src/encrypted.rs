//! Encrypted MTProto 2.0 framing (post auth-key).
//!
//! Once you have a `Finished` from [`crate::authentication`], construct an
//! [`EncryptedSession`] and use it to frame every later message. The
//! session owns the per-connection counters (session id, message clock,
//! sequence numbers, salts, replay window) but does no I/O and no
//! encryption of its own: [`seal`] and [`open`] are free functions so the
//! caller can run them wherever CPU work belongs.

use std::sync::Arc;

use ferrogram_crypto::{AuthKey, DecryptError, RandomError, decrypt_data_v2, encrypt_data_v2, random_array};
use ferrogram_tl::Serializable;

use crate::message::{MessageClock, SeqNo, read_i32, read_i64};
use crate::replay::{Rejection, ReplayGuard};
use crate::salts::SaltSet;
use crate::service::ID_MSG_CONTAINER;

/// Largest number of messages packed into one container.
pub const MAX_CONTAINER_LEN: usize = 1020;
/// Largest container payload the server accepts.
pub const MAX_CONTAINER_BYTES: usize = 1024 * 1024 - 8;

const HEADER_LEN: usize = 8 + 8 + 8 + 4 + 4;

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Why an incoming encrypted frame was discarded.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum UnpackError {
    #[error("decryption failed: {0}")]
    Crypto(#[from] DecryptError),
    #[error("decrypted payload of {0} bytes is too short")]
    TooShort(usize),
    #[error("frame is for session {got}, not {expected}")]
    SessionMismatch { expected: i64, got: i64 },
    #[error("declared body length {declared} does not fit the {available} bytes available")]
    BadLength { declared: usize, available: usize },
    #[error("message rejected: {0}")]
    Replay(#[from] Rejection),
}

// ─── Messages ────────────────────────────────────────────────────────────────

/// A message that has been given its identifiers and can be (re)sent.
///
/// Resending the same value reuses its `msg_id` and `seq_no`.
#[derive(Clone, Debug, PartialEq)]
pub struct OutgoingMessage {
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

impl OutgoingMessage {
    pub fn is_content_related(&self) -> bool {
        self.seq_no & 1 == 1
    }
}

/// The plaintext for one wire message, ready for [`seal`].
#[derive(Clone, Debug)]
pub struct Packed {
    pub plaintext: Vec<u8>,
    /// The outer message id: the container's when several messages were packed.
    pub msg_id: i64,
    pub container: bool,
}

/// A decrypted and validated server message.
#[derive(Clone, Debug, PartialEq)]
pub struct DecryptedMessage {
    pub salt: i64,
    pub session_id: i64,
    pub msg_id: i64,
    pub seq_no: i32,
    pub body: Vec<u8>,
}

// ─── Session state ───────────────────────────────────────────────────────────

/// MTProto 2.0 encrypted session state for one connection.
#[derive(Debug)]
pub struct EncryptedSession {
    auth_key: Arc<AuthKey>,
    session_id: i64,
    clock: MessageClock,
    seq: SeqNo,
    salts: SaltSet,
    replay: ReplayGuard,
}

impl EncryptedSession {
    /// Start a session with a random id.
    pub fn new(auth_key: Arc<AuthKey>, first_salt: i64, time_offset: i32) -> Result<Self, RandomError> {
        let session_id = i64::from_le_bytes(random_array::<8>()?);
        Ok(Self::with_session_id(auth_key, session_id, first_salt, time_offset))
    }

    pub fn with_session_id(auth_key: Arc<AuthKey>, session_id: i64, first_salt: i64, time_offset: i32) -> Self {
        Self {
            auth_key,
            session_id,
            clock: MessageClock::new(time_offset),
            seq: SeqNo::default(),
            salts: SaltSet::new(first_salt),
            replay: ReplayGuard::new(),
        }
    }

    pub fn auth_key(&self) -> &Arc<AuthKey> { &self.auth_key }

    pub fn session_id(&self) -> i64 { self.session_id }

    pub fn time_offset(&self) -> i32 { self.clock.time_offset() }

    pub fn clock(&self) -> &MessageClock { &self.clock }

    pub fn salts(&self) -> &SaltSet { &self.salts }

    pub fn salts_mut(&mut self) -> &mut SaltSet { &mut self.salts }

    /// Approximate server unix time.
    pub fn server_now(&self) -> i32 {
        self.clock.server_now()
    }

    /// Give `body` a fresh message id and sequence number.
    pub fn new_message(&mut self, body: Vec<u8>, content_related: bool) -> OutgoingMessage {
        let msg_id = self.clock.next_msg_id();
        let seq_no = self.seq.next(content_related);
        OutgoingMessage { msg_id, seq_no, body }
    }

    /// Serialize `request` into a fresh content-related message.
    pub fn new_request<S: Serializable + ?Sized>(&mut self, request: &S) -> OutgoingMessage {
        self.new_message(request.to_bytes(), true)
    }

    /// Re-identify a message the server refused because of its id or seq_no.
    /// Returns the old id.
    pub fn reassign(&mut self, msg: &mut OutgoingMessage) -> i64 {
        let old = msg.msg_id;
        msg.msg_id = self.clock.next_msg_id();
        msg.seq_no = self.seq.next(msg.is_content_related());
        old
    }

    /// Adopt the server's clock from one of its message ids.
    pub fn sync_time(&mut self, server_msg_id: i64) -> i32 {
        self.clock.sync_with_server(server_msg_id)
    }

    /// Build the plaintext for `messages`, wrapping them in a container when
    /// there is more than one.
    pub fn pack(&mut self, messages: &[OutgoingMessage]) -> Packed {
        let salt = self.salts.select(self.server_now());
        match messages {
            [single] => Packed {
                plaintext: self.plaintext(salt, single.msg_id, single.seq_no, &single.body),
                msg_id: single.msg_id,
                container: false,
            },
            many => {
                let mut body = Vec::with_capacity(8 + many.iter().map(|m| 16 + m.body.len()).sum::<usize>());
                ID_MSG_CONTAINER.serialize(&mut body);
                (many.len() as i32).serialize(&mut body);
                for m in many {
                    m.msg_id.serialize(&mut body);
                    m.seq_no.serialize(&mut body);
                    (m.body.len() as i32).serialize(&mut body);
                    body.extend_from_slice(&m.body);
                }
                // The container id must follow the ids it carries.
                let msg_id = self.clock.next_msg_id();
                let seq_no = self.seq.next(false);
                Packed { plaintext: self.plaintext(salt, msg_id, seq_no, &body), msg_id, container: true }
            }
        }
    }

    fn plaintext(&self, salt: i64, msg_id: i64, seq_no: i32, body: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN + body.len());
        buf.extend(salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(msg_id.to_le_bytes());
        buf.extend(seq_no.to_le_bytes());
        buf.extend((body.len() as u32).to_le_bytes());
        buf.extend_from_slice(body);
        buf
    }

    /// Decrypt and validate in one step.
    pub fn unpack(&mut self, frame: &mut [u8]) -> Result<DecryptedMessage, UnpackError> {
        let msg = open(frame, &self.auth_key, self.session_id)?;
        self.accept(&msg)?;
        Ok(msg)
    }

    /// Run the replay checks on a message produced by [`open`].
    ///
    /// The first message of a session also sets the clock offset.
    pub fn accept(&mut self, msg: &DecryptedMessage) -> Result<(), Rejection> {
        if self.replay.is_empty() {
            let offset = self.clock.sync_with_server(msg.msg_id);
            log::debug!("clock synced from first server message, offset {offset}s");
        }
        let age = self.clock.age_of(msg.msg_id);
        self.replay.check(msg.msg_id, age)
    }

    /// True once too many frames in a row were discarded.
    pub fn should_restart(&self) -> bool {
        self.replay.should_restart()
    }

    /// Start a new server-side session on the same auth key.
    pub fn reset_session(&mut self) -> Result<(), RandomError> {
        self.session_id = i64::from_le_bytes(random_array::<8>()?);
        self.seq.reset();
        self.replay.clear();
        log::info!("new session id {:#018x}", self.session_id);
        Ok(())
    }
}

// ─── Crypto entry points ─────────────────────────────────────────────────────

/// Encrypt a plaintext built by [`EncryptedSession::pack`].
pub fn seal(plaintext: &[u8], auth_key: &AuthKey) -> Result<Vec<u8>, RandomError> {
    encrypt_data_v2(plaintext, auth_key)
}

/// Decrypt a server frame and check its header.
pub fn open(frame: &mut [u8], auth_key: &AuthKey, session_id: i64) -> Result<DecryptedMessage, UnpackError> {
    let plaintext = decrypt_data_v2(frame, auth_key)?;
    parse_plaintext(plaintext, Some(session_id))
}

/// Split a decrypted payload into header and body.
///
/// With `Some(session_id)` the frame must belong to that session.
pub fn parse_plaintext(plaintext: &[u8], session_id: Option<i64>) -> Result<DecryptedMessage, UnpackError> {
    if plaintext.len() < HEADER_LEN {
        return Err(UnpackError::TooShort(plaintext.len()));
    }
    let salt = read_i64(&plaintext[..8]);
    let sid = read_i64(&plaintext[8..16]);
    let msg_id = read_i64(&plaintext[16..24]);
    let seq_no = read_i32(&plaintext[24..28]);
    let body_len = read_i32(&plaintext[28..32]) as u32 as usize;

    if let Some(expected) = session_id {
        if sid != expected {
            return Err(UnpackError::SessionMismatch { expected, got: sid });
        }
    }
    let available = plaintext.len() - HEADER_LEN;
    if body_len > available || body_len % 4 != 0 {
        return Err(UnpackError::BadLength { declared: body_len, available });
    }

    Ok(DecryptedMessage {
        salt,
        session_id: sid,
        msg_id,
        seq_no,
        body: plaintext[HEADER_LEN..HEADER_LEN + body_len].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{Inbound, classify};

    fn key() -> Arc<AuthKey> {
        Arc::new(AuthKey::from_bytes(std::array::from_fn(|i| (i * 13 % 251) as u8)))
    }

    #[test]
    fn sequence_and_ids() {
        let mut s = EncryptedSession::with_session_id(key(), 1, 2, 0);
        let a = s.new_message(vec![0; 4], true);
        let b = s.new_message(vec![0; 4], false);
        let c = s.new_message(vec![0; 4], true);
        assert!(a.msg_id < b.msg_id && b.msg_id < c.msg_id);
        assert_eq!((a.seq_no, b.seq_no, c.seq_no), (1, 2, 3));
    }

    #[test]
    fn container_wraps_and_keeps_inner_ids() {
        let mut s = EncryptedSession::with_session_id(key(), 7, 2, 0);
        let a = s.new_message(vec![1, 1, 1, 1], true);
        let b = s.new_message(vec![2, 2, 2, 2], true);
        let packed = s.pack(&[a.clone(), b.clone()]);
        assert!(packed.container);
        assert!(packed.msg_id > b.msg_id);

        let msg = parse_plaintext(&packed.plaintext, Some(7)).unwrap();
        assert_eq!(msg.seq_no % 2, 0);
        match classify(&msg.body).unwrap() {
            Inbound::Container(inner) => {
                assert_eq!(inner.len(), 2);
                assert_eq!((inner[0].msg_id, inner[0].seq_no, &inner[0].body), (a.msg_id, a.seq_no, &a.body));
                assert_eq!(inner[1].msg_id, b.msg_id);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn reassign_moves_forward() {
        let mut s = EncryptedSession::with_session_id(key(), 1, 2, 0);
        let mut m = s.new_message(vec![0; 4], true);
        let old = s.reassign(&mut m);
        assert!(m.msg_id > old);
        assert_eq!(m.seq_no, 3);
    }

    #[test]
    fn rejects_foreign_session_and_bad_length() {
        let mut s = EncryptedSession::with_session_id(key(), 5, 2, 0);
        let m = s.new_message(vec![0; 8], true);
        let packed = s.pack(std::slice::from_ref(&m));
        assert_eq!(
            parse_plaintext(&packed.plaintext, Some(6)),
            Err(UnpackError::SessionMismatch { expected: 6, got: 5 })
        );

        let mut bad = packed.plaintext.clone();
        bad[28..32].copy_from_slice(&64u32.to_le_bytes());
        assert_eq!(parse_plaintext(&bad, None), Err(UnpackError::BadLength { declared: 64, available: 8 }));
    }

    #[test]
    fn reset_changes_session_and_sequence() {
        let mut s = EncryptedSession::with_session_id(key(), 5, 2, 0);
        s.new_message(vec![], true);
        s.reset_session().unwrap();
        assert_ne!(s.session_id(), 5);
        assert_eq!(s.new_message(vec![], true).seq_no, 1);
    }
}
