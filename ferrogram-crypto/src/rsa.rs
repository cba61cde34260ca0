//! RSA public keys and the RSA_PAD scheme used by the auth key exchange.

use num_bigint::BigUint;

use crate::{aes, sha1, sha256};

/// An RSA public key (n, e).
#[derive(Clone, PartialEq, Eq)]
pub struct Key {
    n: BigUint,
    e: BigUint,
}

impl Key {
    /// Parse decimal `n` and `e` strings.
    pub fn new(n: &str, e: &str) -> Option<Self> {
        Some(Self {
            n: BigUint::parse_bytes(n.as_bytes(), 10)?,
            e: BigUint::parse_bytes(e.as_bytes(), 10)?,
        })
    }

    /// Build from big-endian modulus and exponent bytes.
    pub fn from_be_bytes(n: &[u8], e: &[u8]) -> Self {
        Self { n: BigUint::from_bytes_be(n), e: BigUint::from_bytes_be(e) }
    }

    /// The server-advertised fingerprint: the low 64 bits of
    /// `SHA1(tl_bytes(n) ‖ tl_bytes(e))`, read little-endian.
    pub fn fingerprint(&self) -> i64 {
        let n = tl_bytes(&self.n.to_bytes_be());
        let e = tl_bytes(&self.e.to_bytes_be());
        let sha = sha1!(&n, &e);
        let mut fp = [0u8; 8];
        fp.copy_from_slice(&sha[12..20]);
        i64::from_le_bytes(fp)
    }

    /// Size of the modulus in bits.
    pub fn bits(&self) -> u64 { self.n.bits() }
}

impl std::fmt::Debug for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rsa::Key(fingerprint={})", self.fingerprint())
    }
}

// TL `bytes` encoding, kept local so this crate stays free of the schema crate.
fn tl_bytes(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 8);
    if data.len() <= 253 {
        out.push(data.len() as u8);
    } else {
        out.push(0xfe);
        out.extend_from_slice(&(data.len() as u32).to_le_bytes()[..3]);
    }
    out.extend_from_slice(data);
    while out.len() % 4 != 0 {
        out.push(0);
    }
    out
}

fn increment(data: &mut [u8]) {
    for byte in data.iter_mut().rev() {
        let (n, overflow) = byte.overflowing_add(1);
        *byte = n;
        if !overflow {
            break;
        }
    }
}

/// Largest payload RSA_PAD accepts.
pub const MAX_PAYLOAD: usize = 144;

/// RSA-encrypt `data` using the MTProto RSA_PAD scheme.
///
/// `random_bytes` must be 224 bytes of secure random data. Returns `None`
/// when `data` exceeds [`MAX_PAYLOAD`] bytes.
pub fn encrypt_hashed(data: &[u8], key: &Key, random_bytes: &[u8; 224]) -> Option<Vec<u8>> {
    if data.len() > MAX_PAYLOAD {
        return None;
    }

    // data_with_padding: 192 bytes
    let mut data_with_padding = Vec::with_capacity(192);
    data_with_padding.extend_from_slice(data);
    data_with_padding.extend_from_slice(&random_bytes[..192 - data.len()]);

    let data_pad_reversed: Vec<u8> = data_with_padding.iter().copied().rev().collect();

    let mut temp_key = [0u8; 32];
    temp_key.copy_from_slice(&random_bytes[192..]);

    let key_aes_encrypted = loop {
        // data_with_hash = data_pad_reversed + SHA256(temp_key + data_with_padding)
        let mut data_with_hash = Vec::with_capacity(224);
        data_with_hash.extend_from_slice(&data_pad_reversed);
        data_with_hash.extend_from_slice(&sha256!(&temp_key, &data_with_padding));

        aes::ige_encrypt(&mut data_with_hash, &temp_key, &[0u8; 32]);

        // temp_key_xor = temp_key XOR SHA256(aes_encrypted)
        let hash = sha256!(&data_with_hash);
        let mut xored = temp_key;
        for (a, b) in xored.iter_mut().zip(hash.iter()) {
            *a ^= b;
        }

        let mut candidate = Vec::with_capacity(256);
        candidate.extend_from_slice(&xored);
        candidate.extend_from_slice(&data_with_hash);

        if BigUint::from_bytes_be(&candidate) < key.n {
            break candidate;
        }
        increment(&mut temp_key);
    };

    let payload = BigUint::from_bytes_be(&key_aes_encrypted);
    let encrypted = payload.modpow(&key.e, &key.n);
    let block = encrypted.to_bytes_be();
    let mut out = vec![0u8; 256usize.saturating_sub(block.len())];
    out.extend_from_slice(&block);
    Some(out)
}
