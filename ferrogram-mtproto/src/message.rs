//! Message identifiers, sequence numbers and plaintext framing.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Allocates strictly increasing message IDs from server-corrected time.
///
/// A message ID is `unix_time * 2^32` with the fractional second in the low
/// 32 bits and the two lowest bits cleared for client messages.
#[derive(Clone, Debug, Default)]
pub struct MessageClock {
    /// Seconds to add to local time to approximate server time.
    time_offset: i32,
    last_msg_id: i64,
}

impl MessageClock {
    pub fn new(time_offset: i32) -> Self {
        Self { time_offset, last_msg_id: 0 }
    }

    pub fn time_offset(&self) -> i32 { self.time_offset }

    /// Local unix time corrected by the offset.
    pub fn server_now(&self) -> i32 {
        (now().as_secs() as i64 + self.time_offset as i64) as i32
    }

    /// Allocate the next ID from the system clock.
    pub fn next_msg_id(&mut self) -> i64 {
        self.next_msg_id_at(now())
    }

    /// Allocate the next ID as if the local clock read `since_epoch`.
    pub fn next_msg_id_at(&mut self, since_epoch: Duration) -> i64 {
        let mut id = msg_id_for(since_epoch, self.time_offset);
        if id <= self.last_msg_id {
            id = self.last_msg_id + 4;
        }
        self.last_msg_id = id;
        id
    }

    /// Re-derive the offset from a server-issued message ID.
    ///
    /// Returns the new offset. IDs issued afterwards still never go backwards.
    pub fn sync_with_server(&mut self, server_msg_id: i64) -> i32 {
        self.sync_with_server_at(server_msg_id, now())
    }

    pub fn sync_with_server_at(&mut self, server_msg_id: i64, since_epoch: Duration) -> i32 {
        let server_secs = server_msg_id >> 32;
        self.time_offset = (server_secs - since_epoch.as_secs() as i64) as i32;
        self.time_offset
    }

    /// Seconds between `msg_id` and the current corrected time. Positive means
    /// the message claims to come from the future.
    pub fn age_of(&self, msg_id: i64) -> i64 {
        self.age_of_at(msg_id, now())
    }

    pub fn age_of_at(&self, msg_id: i64, since_epoch: Duration) -> i64 {
        let reference = msg_id_for(since_epoch, self.time_offset);
        (msg_id - reference) >> 32
    }
}

fn now() -> Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

fn msg_id_for(since_epoch: Duration, offset: i32) -> i64 {
    let secs = since_epoch.as_secs() as i64 + offset as i64;
    let frac = ((since_epoch.subsec_nanos() as u64) << 32) / 1_000_000_000;
    ((secs << 32) | frac as i64) & !3
}

/// Per-session sequence numbers.
///
/// Content-related messages take `2n + 1` and advance `n`; service messages
/// take `2n` and leave it untouched.
#[derive(Clone, Debug, Default)]
pub struct SeqNo {
    content_count: i32,
}

impl SeqNo {
    pub fn next(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.content_count * 2 + 1;
            self.content_count += 1;
            n
        } else {
            self.content_count * 2
        }
    }

    pub fn reset(&mut self) {
        self.content_count = 0;
    }
}

// ─── Plaintext messages ──────────────────────────────────────────────────────

/// Frame a plaintext message (used only during the auth key exchange):
///
/// ```text
/// auth_key_id:long  (0)
/// message_id:long
/// message_data_length:int
/// message_data:bytes
/// ```
pub fn plaintext(msg_id: i64, body: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + 8 + 4 + body.len());
    buf.extend(0i64.to_le_bytes());
    buf.extend(msg_id.to_le_bytes());
    buf.extend((body.len() as u32).to_le_bytes());
    buf.extend_from_slice(body);
    buf
}

/// Why a plaintext frame could not be read.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PlaintextError {
    #[error("plaintext frame of {0} bytes is too short")]
    TooShort(usize),
    #[error("plaintext frame carries auth_key_id {0}, expected 0")]
    NonZeroAuthKeyId(i64),
    #[error("declared length {declared} exceeds the {available} bytes available")]
    BadLength { declared: usize, available: usize },
}

/// Unwrap a plaintext frame, returning `(msg_id, body)`.
pub fn parse_plaintext(frame: &[u8]) -> Result<(i64, &[u8]), PlaintextError> {
    if frame.len() < 20 {
        return Err(PlaintextError::TooShort(frame.len()));
    }
    let auth_key_id = read_i64(&frame[..8]);
    if auth_key_id != 0 {
        return Err(PlaintextError::NonZeroAuthKeyId(auth_key_id));
    }
    let msg_id = read_i64(&frame[8..16]);
    let len = u32::from_le_bytes([frame[16], frame[17], frame[18], frame[19]]) as usize;
    let available = frame.len() - 20;
    if len > available {
        return Err(PlaintextError::BadLength { declared: len, available });
    }
    Ok((msg_id, &frame[20..20 + len]))
}

pub(crate) fn read_i64(b: &[u8]) -> i64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    i64::from_le_bytes(a)
}

pub(crate) fn read_i32(b: &[u8]) -> i32 {
    i32::from_le_bytes([b[0], b[1], b[2], b[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_monotonic_within_one_instant() {
        let mut c = MessageClock::new(0);
        let t = Duration::from_secs(1_700_000_000);
        let a = c.next_msg_id_at(t);
        let b = c.next_msg_id_at(t);
        assert_eq!(a & 3, 0);
        assert_eq!(b, a + 4);
    }

    #[test]
    fn ids_never_go_backwards_after_resync() {
        let mut c = MessageClock::new(0);
        let t = Duration::from_secs(1_700_000_000);
        let a = c.next_msg_id_at(t);
        // Server is 100s behind.
        c.sync_with_server_at((1_699_999_900i64) << 32, t);
        assert_eq!(c.time_offset(), -100);
        let b = c.next_msg_id_at(t);
        assert!(b > a);
    }

    #[test]
    fn offset_shifts_seconds() {
        let mut c = MessageClock::new(30);
        let id = c.next_msg_id_at(Duration::from_secs(1000));
        assert_eq!(id >> 32, 1030);
    }

    #[test]
    fn age_of_future_message() {
        let c = MessageClock::new(0);
        let t = Duration::from_secs(1_700_000_000);
        let future = (1_700_000_045i64) << 32;
        assert_eq!(c.age_of_at(future, t), 45);
    }

    #[test]
    fn seq_numbers() {
        let mut s = SeqNo::default();
        assert_eq!(s.next(false), 0);
        assert_eq!(s.next(true), 1);
        assert_eq!(s.next(true), 3);
        assert_eq!(s.next(false), 4);
        assert_eq!(s.next(true), 5);
    }

    #[test]
    fn plaintext_layout() {
        let wire = plaintext(0x1122, &[0xaa, 0xbb]);
        assert_eq!(wire.len(), 8 + 8 + 4 + 2);
        assert_eq!(&wire[..8], &[0u8; 8]);
        let (id, body) = parse_plaintext(&wire).unwrap();
        assert_eq!(id, 0x1122);
        assert_eq!(body, &[0xaa, 0xbb]);
    }

    #[test]
    fn plaintext_rejects_encrypted_frame() {
        let mut wire = plaintext(1, &[0; 4]);
        wire[0] = 1;
        assert_eq!(parse_plaintext(&wire), Err(PlaintextError::NonZeroAuthKeyId(1)));
    }
}
