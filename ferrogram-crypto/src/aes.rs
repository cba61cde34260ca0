//! AES-256 in the two modes MTProto uses.
//!
//! IGE protects every encrypted message and the handshake payloads; CTR is
//! used by the obfuscated transport and by CDN file chunks.

use ::aes::Aes256;
use ::aes::cipher::generic_array::GenericArray;
use ::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};

type Block = GenericArray<u8, ::aes::cipher::consts::U16>;

/// Encrypt `buffer` in place with AES-256-IGE.
///
/// `iv` holds the initial previous-ciphertext block followed by the initial
/// previous-plaintext block. `buffer.len()` must be a multiple of 16; a
/// trailing partial block is left untouched.
pub fn ige_encrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let (mut prev_c, mut prev_p) = split_iv(iv);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut plain = [0u8; 16];
        plain.copy_from_slice(chunk);

        let mut block = Block::default();
        for i in 0..16 {
            block[i] = plain[i] ^ prev_c[i];
        }
        cipher.encrypt_block(&mut block);
        for i in 0..16 {
            chunk[i] = block[i] ^ prev_p[i];
        }

        prev_c.copy_from_slice(chunk);
        prev_p = plain;
    }
}

/// Decrypt `buffer` in place with AES-256-IGE. Inverse of [`ige_encrypt`].
pub fn ige_decrypt(buffer: &mut [u8], key: &[u8; 32], iv: &[u8; 32]) {
    let cipher = Aes256::new(GenericArray::from_slice(key));
    let (mut prev_c, mut prev_p) = split_iv(iv);

    for chunk in buffer.chunks_exact_mut(16) {
        let mut cipher_block = [0u8; 16];
        cipher_block.copy_from_slice(chunk);

        let mut block = Block::default();
        for i in 0..16 {
            block[i] = cipher_block[i] ^ prev_p[i];
        }
        cipher.decrypt_block(&mut block);
        for i in 0..16 {
            chunk[i] = block[i] ^ prev_c[i];
        }

        prev_p.copy_from_slice(chunk);
        prev_c = cipher_block;
    }
}

fn split_iv(iv: &[u8; 32]) -> ([u8; 16], [u8; 16]) {
    let mut a = [0u8; 16];
    let mut b = [0u8; 16];
    a.copy_from_slice(&iv[..16]);
    b.copy_from_slice(&iv[16..]);
    (a, b)
}

// ─── CTR ──────────────────────────────────────────────────────────────────────

/// A running AES-256-CTR keystream (128-bit big-endian counter).
///
/// Encryption and decryption are the same operation. The state advances
/// with every byte processed, so one instance must see a stream in order.
pub struct Ctr256 {
    inner: ctr::Ctr128BE<Aes256>,
}

impl Ctr256 {
    pub fn new(key: &[u8; 32], iv: &[u8; 16]) -> Self {
        Self {
            inner: ctr::Ctr128BE::<Aes256>::new(
                GenericArray::from_slice(key),
                GenericArray::from_slice(iv),
            ),
        }
    }

    /// XOR the next `data.len()` keystream bytes into `data`.
    pub fn apply(&mut self, data: &mut [u8]) {
        self.inner.apply_keystream(data);
    }
}

impl std::fmt::Debug for Ctr256 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Ctr256(..)")
    }
}

/// One-shot CTR transform of `data` starting from `iv`.
pub fn ctr_apply(data: &mut [u8], key: &[u8; 32], iv: &[u8; 16]) {
    Ctr256::new(key, iv).apply(data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ige_round_trip() {
        let key: [u8; 32] = std::array::from_fn(|i| i as u8);
        let iv: [u8; 32] = std::array::from_fn(|i| (i + 32) as u8);
        let mut data = [0u8; 32];
        ige_encrypt(&mut data, &key, &iv);
        assert_ne!(data, [0u8; 32]);
        ige_decrypt(&mut data, &key, &iv);
        assert_eq!(data, [0u8; 32]);
    }

    #[test]
    fn ige_blocks_chain() {
        let key = [7u8; 32];
        let iv = [9u8; 32];
        let mut a = [1u8; 32];
        let mut b = [1u8; 32];
        b[31] = 2;
        ige_encrypt(&mut a, &key, &iv);
        ige_encrypt(&mut b, &key, &iv);
        // First block identical, second differs.
        assert_eq!(a[..16], b[..16]);
        assert_ne!(a[16..], b[16..]);
    }

    #[test]
    fn ctr_streaming_matches_one_shot() {
        let key = [3u8; 32];
        let iv = [4u8; 16];
        let original: Vec<u8> = (0..100u8).collect();

        let mut whole = original.clone();
        ctr_apply(&mut whole, &key, &iv);

        let mut parts = original.clone();
        let mut ctr = Ctr256::new(&key, &iv);
        let (head, tail) = parts.split_at_mut(37);
        ctr.apply(head);
        ctr.apply(tail);
        assert_eq!(parts, whole);

        ctr_apply(&mut whole, &key, &iv);
        assert_eq!(whole, original);
    }
}
