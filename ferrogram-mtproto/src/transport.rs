//! Wire framings for the MTProto TCP transports.
//!
//! Each framing is a sans-IO state machine: bytes read from the socket are
//! handed to [`Framing::feed`], complete frames come out of
//! [`Framing::next_frame`], and [`Framing::encode`] wraps an outgoing
//! payload. Any byte stream (TCP, a proxy tunnel, an in-memory pipe) can
//! carry them.
//!
//! | framing          | per packet                                   |
//! |------------------|----------------------------------------------|
//! | [`Abridged`]     | `len/4` in 1 byte, or `0x7f` + 3 bytes       |
//! | [`Intermediate`] | 4-byte LE length                             |
//! | [`Full`]         | length, sequence number, payload, CRC-32     |
//! | [`Obfuscated`]   | one of the above under AES-256-CTR           |

use ferrogram_crypto::aes::Ctr256;
use ferrogram_crypto::{random_array, sha256};

/// Frames larger than this are treated as stream corruption.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub const ABRIDGED_TAG: [u8; 4] = [0xef, 0xef, 0xef, 0xef];
pub const INTERMEDIATE_TAG: [u8; 4] = [0xee, 0xee, 0xee, 0xee];

// ─── Errors ──────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    /// The server sent a bare negative int32 instead of a frame.
    #[error("transport error {0}")]
    Transport(i32),
    #[error("frame of {0} bytes exceeds the limit")]
    TooLarge(usize),
    #[error("frame of {0} bytes is too short")]
    TooShort(usize),
    #[error("frame checksum mismatch")]
    BadCrc,
    #[error("frame sequence number {got}, expected {expected}")]
    BadSeq { expected: u32, got: u32 },
    #[error("this framing cannot be obfuscated")]
    NotObfuscatable,
    #[error("proxy secret of {0} bytes, expected 16")]
    BadSecret(usize),
    #[error("system random number generator unavailable")]
    Random,
}

impl FramingError {
    /// `-404`: the server does not know our auth key. `-444`: invalid DC.
    /// Both mean the connection cannot be salvaged by reconnecting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FramingError::Transport(-404) | FramingError::Transport(-444))
    }
}

// ─── Framing trait ───────────────────────────────────────────────────────────

/// A packet framing over a reliable byte stream.
pub trait Framing: Send {
    /// Bytes to write once, right after the connection opens.
    fn init(&mut self) -> Vec<u8>;

    /// Append the framed `payload` to `out`.
    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>);

    /// Buffer bytes read from the stream.
    fn feed(&mut self, data: &[u8]);

    /// Take the next complete frame out of the buffered bytes.
    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError>;

    /// The protocol tag placed in an obfuscated header, if this framing can
    /// run inside one.
    fn obfuscation_tag(&self) -> Option<[u8; 4]> {
        None
    }
}

fn check_payload(frame: Vec<u8>) -> Result<Vec<u8>, FramingError> {
    if frame.len() == 4 {
        let code = i32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
        if code < 0 {
            return Err(FramingError::Transport(code));
        }
    }
    Ok(frame)
}

// ─── Abridged ────────────────────────────────────────────────────────────────

/// [MTProto Abridged] framing. Init byte `0xef`.
///
/// [MTProto Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
#[derive(Debug, Default)]
pub struct Abridged {
    buf: Vec<u8>,
}

impl Abridged {
    pub fn new() -> Self { Self::default() }
}

impl Framing for Abridged {
    fn init(&mut self) -> Vec<u8> { vec![0xef] }

    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let words = payload.len() / 4;
        if words < 0x7f {
            out.push(words as u8);
        } else {
            out.push(0x7f);
            out.extend_from_slice(&(words as u32).to_le_bytes()[..3]);
        }
        out.extend_from_slice(payload);
    }

    fn feed(&mut self, data: &[u8]) { self.buf.extend_from_slice(data); }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        let Some(&first) = self.buf.first() else { return Ok(None) };
        let (header, len) = if first & 0x7f < 0x7f {
            (1, (first & 0x7f) as usize * 4)
        } else {
            if self.buf.len() < 4 {
                return Ok(None);
            }
            (4, u32::from_le_bytes([self.buf[1], self.buf[2], self.buf[3], 0]) as usize * 4)
        };
        if len > MAX_FRAME_LEN {
            return Err(FramingError::TooLarge(len));
        }
        if self.buf.len() < header + len {
            return Ok(None);
        }
        let frame = self.buf[header..header + len].to_vec();
        self.buf.drain(..header + len);
        check_payload(frame).map(Some)
    }

    fn obfuscation_tag(&self) -> Option<[u8; 4]> { Some(ABRIDGED_TAG) }
}

// ─── Intermediate ────────────────────────────────────────────────────────────

/// [MTProto Intermediate] framing. Init bytes `0xeeeeeeee`.
///
/// [MTProto Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
#[derive(Debug, Default)]
pub struct Intermediate {
    buf: Vec<u8>,
}

impl Intermediate {
    pub fn new() -> Self { Self::default() }
}

impl Framing for Intermediate {
    fn init(&mut self) -> Vec<u8> { INTERMEDIATE_TAG.to_vec() }

    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
    }

    fn feed(&mut self, data: &[u8]) { self.buf.extend_from_slice(data); }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        // The top bit flags a quick-ack token, not part of the length.
        let len = (u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) & 0x7fff_ffff) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FramingError::TooLarge(len));
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.buf[4..4 + len].to_vec();
        self.buf.drain(..4 + len);
        check_payload(frame).map(Some)
    }

    fn obfuscation_tag(&self) -> Option<[u8; 4]> { Some(INTERMEDIATE_TAG) }
}

// ─── Full ────────────────────────────────────────────────────────────────────

/// [MTProto Full] framing: no init bytes, every packet carries its length,
/// a per-direction sequence number and a CRC-32 of everything before it.
///
/// [MTProto Full]: https://core.telegram.org/mtproto/mtproto-transports#full
#[derive(Debug, Default)]
pub struct Full {
    buf: Vec<u8>,
    send_seq: u32,
    recv_seq: u32,
}

impl Full {
    pub fn new() -> Self { Self::default() }
}

impl Framing for Full {
    fn init(&mut self) -> Vec<u8> { Vec::new() }

    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        out.extend_from_slice(&((payload.len() + 12) as u32).to_le_bytes());
        out.extend_from_slice(&self.send_seq.to_le_bytes());
        out.extend_from_slice(payload);
        let crc = crc32fast::hash(&out[start..]);
        out.extend_from_slice(&crc.to_le_bytes());
        self.send_seq = self.send_seq.wrapping_add(1);
    }

    fn feed(&mut self, data: &[u8]) { self.buf.extend_from_slice(data); }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FramingError::TooLarge(len));
        }
        if len < 12 {
            return Err(FramingError::TooShort(len));
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let packet: Vec<u8> = self.buf.drain(..len).collect();
        let crc = u32::from_le_bytes([packet[len - 4], packet[len - 3], packet[len - 2], packet[len - 1]]);
        if crc32fast::hash(&packet[..len - 4]) != crc {
            return Err(FramingError::BadCrc);
        }
        let seq = u32::from_le_bytes([packet[4], packet[5], packet[6], packet[7]]);
        if seq != self.recv_seq {
            return Err(FramingError::BadSeq { expected: self.recv_seq, got: seq });
        }
        self.recv_seq = self.recv_seq.wrapping_add(1);
        check_payload(packet[8..len - 4].to_vec()).map(Some)
    }
}

// ─── Obfuscated2 ─────────────────────────────────────────────────────────────

/// Obfuscated2: a random 64-byte header followed by the inner framing,
/// with both directions under AES-256-CTR.
///
/// The header carries the keys in the clear (bytes 8..56, reversed for the
/// receive direction); with a proxy secret each key is hashed together with
/// it. Bytes 56..64 are sent encrypted and hold the protocol tag and DC id.
pub struct Obfuscated<F: Framing> {
    inner: F,
    header: Option<[u8; 64]>,
    enc: Ctr256,
    dec: Ctr256,
}

impl<F: Framing> Obfuscated<F> {
    pub fn new(inner: F, dc_id: i16, secret: Option<&[u8]>) -> Result<Self, FramingError> {
        let random = random_array::<64>().map_err(|_| FramingError::Random)?;
        Self::with_random(inner, dc_id, secret, random)
    }

    /// Build from caller-supplied random bytes, regenerating the header from
    /// them until it passes the first-bytes rules.
    pub fn with_random(inner: F, dc_id: i16, secret: Option<&[u8]>, random: [u8; 64]) -> Result<Self, FramingError> {
        let tag = inner.obfuscation_tag().ok_or(FramingError::NotObfuscatable)?;
        if let Some(secret) = secret.filter(|s| s.len() != 16) {
            return Err(FramingError::BadSecret(secret.len()));
        }

        let mut header = random;
        while !header_is_acceptable(&header) {
            header = sha256_stretch(&header);
        }
        header[56..60].copy_from_slice(&tag);
        header[60..62].copy_from_slice(&dc_id.to_le_bytes());

        let (enc_key, enc_iv) = split_key_iv(&header[8..56], secret);
        let reversed: Vec<u8> = header[8..56].iter().rev().copied().collect();
        let (dec_key, dec_iv) = split_key_iv(&reversed, secret);

        let mut enc = Ctr256::new(&enc_key, &enc_iv);
        let mut encrypted = header;
        enc.apply(&mut encrypted);
        header[56..].copy_from_slice(&encrypted[56..]);

        Ok(Self { inner, header: Some(header), enc, dec: Ctr256::new(&dec_key, &dec_iv) })
    }
}

impl<F: Framing> Framing for Obfuscated<F> {
    fn init(&mut self) -> Vec<u8> {
        self.header.take().map(|h| h.to_vec()).unwrap_or_default()
    }

    fn encode(&mut self, payload: &[u8], out: &mut Vec<u8>) {
        let start = out.len();
        self.inner.encode(payload, out);
        self.enc.apply(&mut out[start..]);
    }

    fn feed(&mut self, data: &[u8]) {
        let mut plain = data.to_vec();
        self.dec.apply(&mut plain);
        self.inner.feed(&plain);
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        self.inner.next_frame()
    }
}

impl<F: Framing> std::fmt::Debug for Obfuscated<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obfuscated").field("header_sent", &self.header.is_none()).finish()
    }
}

fn header_is_acceptable(h: &[u8; 64]) -> bool {
    const FORBIDDEN: [[u8; 4]; 7] = [
        *b"HEAD",
        *b"POST",
        *b"GET ",
        *b"OPTI",
        [0xdd, 0xdd, 0xdd, 0xdd],
        [0xee, 0xee, 0xee, 0xee],
        [0x16, 0x03, 0x01, 0x02],
    ];
    h[0] != 0xef && !FORBIDDEN.iter().any(|f| h[..4] == f[..]) && h[4..8] != [0, 0, 0, 0]
}

fn sha256_stretch(h: &[u8; 64]) -> [u8; 64] {
    let a = sha256!(h, [0u8]);
    let b = sha256!(h, [1u8]);
    let mut out = [0u8; 64];
    out[..32].copy_from_slice(&a);
    out[32..].copy_from_slice(&b);
    out
}

fn split_key_iv(material: &[u8], secret: Option<&[u8]>) -> ([u8; 32], [u8; 16]) {
    let mut key = [0u8; 32];
    key.copy_from_slice(&material[..32]);
    if let Some(secret) = secret {
        key = sha256!(key, secret);
    }
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&material[32..48]);
    (key, iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pump<F: Framing>(f: &mut F, wire: &[u8]) -> Vec<Vec<u8>> {
        f.feed(wire);
        let mut out = Vec::new();
        while let Some(frame) = f.next_frame().unwrap() {
            out.push(frame);
        }
        out
    }

    #[test]
    fn abridged_long_header() {
        let payload = vec![7u8; 0x7f * 4 + 4];
        let mut tx = Abridged::new();
        let mut wire = Vec::new();
        tx.encode(&payload, &mut wire);
        assert_eq!(wire[0], 0x7f);
        assert_eq!(&wire[1..4], &[0x80, 0, 0]);
        assert_eq!(pump(&mut Abridged::new(), &wire), vec![payload]);
    }

    #[test]
    fn intermediate_partial_reads() {
        let mut tx = Intermediate::new();
        let mut wire = Vec::new();
        tx.encode(&[1, 2, 3, 4], &mut wire);
        tx.encode(&[5, 6, 7, 8, 9, 10, 11, 12], &mut wire);

        let mut rx = Intermediate::new();
        assert!(pump(&mut rx, &wire[..6]).is_empty());
        let frames = pump(&mut rx, &wire[6..]);
        assert_eq!(frames, vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8, 9, 10, 11, 12]]);
    }

    #[test]
    fn transport_error_frame() {
        let mut rx = Intermediate::new();
        rx.feed(&4u32.to_le_bytes());
        rx.feed(&(-404i32).to_le_bytes());
        let err = rx.next_frame().unwrap_err();
        assert_eq!(err, FramingError::Transport(-404));
        assert!(err.is_fatal());
        assert!(!FramingError::Transport(-429).is_fatal());
    }

    #[test]
    fn full_checks_crc_and_sequence() {
        let mut tx = Full::new();
        let mut wire = Vec::new();
        tx.encode(&[1, 2, 3, 4], &mut wire);
        tx.encode(&[5, 6, 7, 8], &mut wire);
        assert_eq!(pump(&mut Full::new(), &wire).len(), 2);

        let mut corrupted = wire.clone();
        corrupted[9] ^= 0xff;
        let mut rx = Full::new();
        rx.feed(&corrupted);
        assert_eq!(rx.next_frame(), Err(FramingError::BadCrc));

        // Second packet alone arrives with seq 1 where 0 is expected.
        let mut rx = Full::new();
        rx.feed(&wire[16..]);
        assert_eq!(rx.next_frame(), Err(FramingError::BadSeq { expected: 0, got: 1 }));
    }

    #[test]
    fn proxy_secret_must_be_sixteen_bytes() {
        let mut padded = vec![0xdd];
        padded.extend_from_slice(&[0x11; 16]);
        assert_eq!(
            Obfuscated::new(Intermediate::new(), 2, Some(&padded)).map(|_| ()),
            Err(FramingError::BadSecret(17))
        );
        assert!(Obfuscated::new(Intermediate::new(), 2, Some(&[0x11; 16])).is_ok());
    }

    #[test]
    fn full_is_not_obfuscatable() {
        assert_eq!(
            Obfuscated::new(Full::new(), 2, None).map(|_| ()),
            Err(FramingError::NotObfuscatable)
        );
    }

    /// Server side of an obfuscated stream, derived from the received header.
    fn server_ciphers(header: &[u8], secret: Option<&[u8]>) -> (Ctr256, Ctr256) {
        let (rx_key, rx_iv) = split_key_iv(&header[8..56], secret);
        let reversed: Vec<u8> = header[8..56].iter().rev().copied().collect();
        let (tx_key, tx_iv) = split_key_iv(&reversed, secret);
        (Ctr256::new(&rx_key, &rx_iv), Ctr256::new(&tx_key, &tx_iv))
    }

    #[test]
    fn obfuscated_header_and_round_trip() {
        let secret = [0x11u8; 16];
        let mut random = [0u8; 64];
        random[0] = 0xef; // forces regeneration
        let mut client = Obfuscated::with_random(Intermediate::new(), -2, Some(&secret), random).unwrap();
        let header = client.init();
        assert_eq!(header.len(), 64);
        assert_ne!(header[0], 0xef);
        assert!(client.init().is_empty());

        let (mut server_rx, mut server_tx) = server_ciphers(&header, Some(&secret));
        let mut decrypted_header = header.clone();
        server_rx.apply(&mut decrypted_header);
        assert_eq!(&decrypted_header[56..60], &INTERMEDIATE_TAG);
        assert_eq!(i16::from_le_bytes([decrypted_header[60], decrypted_header[61]]), -2);

        // client -> server
        let mut wire = Vec::new();
        client.encode(&[9, 8, 7, 6], &mut wire);
        server_rx.apply(&mut wire);
        assert_eq!(wire, [4, 0, 0, 0, 9, 8, 7, 6]);

        // server -> client, split across reads
        let mut reply = vec![8, 0, 0, 0, 1, 2, 3, 4, 5, 6, 7, 8];
        server_tx.apply(&mut reply);
        client.feed(&reply[..5]);
        assert_eq!(client.next_frame(), Ok(None));
        client.feed(&reply[5..]);
        assert_eq!(client.next_frame(), Ok(Some(vec![1, 2, 3, 4, 5, 6, 7, 8])));
    }
}
