//! Cryptographic primitives for MTProto.
//!
//! Provides:
//! - AES-256-IGE and AES-256-CTR
//! - SHA-1 / SHA-256 hash macros
//! - Pollard-rho PQ factorization
//! - RSA keys, fingerprints and the RSA_PAD scheme
//! - Diffie-Hellman parameter validation
//! - [`AuthKey`] and MTProto 2.0 message encryption / decryption, for either
//!   side of the connection
//! - DH nonce→key derivation

#![deny(unsafe_code)]

pub mod aes;
mod auth_key;
pub mod dh;
mod factorize;
pub mod rsa;
mod sha;

pub use auth_key::AuthKey;
pub use factorize::factorize;

#[doc(hidden)]
pub mod __private {
    pub use ::sha1;
    pub use ::sha2;
}

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors from [`decrypt_data_v2`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DecryptError {
    /// Ciphertext too short or not block-aligned.
    #[error("invalid ciphertext buffer length")]
    InvalidBuffer,
    /// The `auth_key_id` in the ciphertext does not match our key.
    #[error("auth_key_id mismatch")]
    AuthKeyMismatch,
    /// The `msg_key` in the ciphertext does not match our computed value.
    #[error("msg_key mismatch")]
    MessageKeyMismatch,
}

/// The operating system refused to provide random bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("system random number generator unavailable")]
pub struct RandomError;

/// Fill an array with secure random bytes.
pub fn random_array<const N: usize>() -> Result<[u8; N], RandomError> {
    let mut out = [0u8; N];
    getrandom::getrandom(&mut out).map_err(|_| RandomError)?;
    Ok(out)
}

// ─── MTProto 2.0 encrypt / decrypt ───────────────────────────────────────────

/// Which end of the connection produced a message.
///
/// MTProto 2.0 derives keys from different auth-key slices per direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

// 12..=1024 bytes of padding are allowed; this picks 17..=32 and keeps the
// total 16-byte aligned.
fn padding_len(len: usize) -> usize {
    16 + (16 - (len % 16))
}

/// Encrypt a client→server plaintext with MTProto 2.0.
///
/// Returns `key_id ‖ msg_key ‖ ciphertext`.
pub fn encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey) -> Result<Vec<u8>, RandomError> {
    encrypt_data_v2_as(plaintext, auth_key, Side::Client)
}

/// Encrypt a plaintext produced by `side`.
pub fn encrypt_data_v2_as(plaintext: &[u8], auth_key: &AuthKey, side: Side) -> Result<Vec<u8>, RandomError> {
    let rnd = random_array::<32>()?;
    Ok(do_encrypt_data_v2(plaintext, auth_key, side, &rnd))
}

pub(crate) fn do_encrypt_data_v2(plaintext: &[u8], auth_key: &AuthKey, side: Side, rnd: &[u8; 32]) -> Vec<u8> {
    let pad = padding_len(plaintext.len());
    let mut out = Vec::with_capacity(24 + plaintext.len() + pad);
    out.extend_from_slice(&auth_key.key_id);
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(plaintext);
    out.extend_from_slice(&rnd[..pad]);

    let x = side.x();
    let msg_key_large = sha256!(&auth_key.data[88 + x..88 + x + 32], &out[24..]);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&msg_key_large[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    aes::ige_encrypt(&mut out[24..], &key, &iv);
    out[8..24].copy_from_slice(&msg_key);
    out
}

/// Decrypt a server→client MTProto 2.0 ciphertext in place.
///
/// `buffer` must start with `key_id ‖ msg_key ‖ ciphertext`. On success
/// returns the plaintext (still carrying its random padding).
pub fn decrypt_data_v2<'a>(buffer: &'a mut [u8], auth_key: &AuthKey) -> Result<&'a mut [u8], DecryptError> {
    decrypt_data_v2_as(buffer, auth_key, Side::Server)
}

/// Decrypt a ciphertext produced by `sender`.
pub fn decrypt_data_v2_as<'a>(
    buffer: &'a mut [u8],
    auth_key: &AuthKey,
    sender: Side,
) -> Result<&'a mut [u8], DecryptError> {
    if buffer.len() < 24 || (buffer.len() - 24) % 16 != 0 {
        return Err(DecryptError::InvalidBuffer);
    }
    if auth_key.key_id != buffer[..8] {
        return Err(DecryptError::AuthKeyMismatch);
    }
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&buffer[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, sender);
    aes::ige_decrypt(&mut buffer[24..], &key, &iv);

    let x = sender.x();
    let our_key = sha256!(&auth_key.data[88 + x..88 + x + 32], &buffer[24..]);
    if msg_key != our_key[8..24] {
        return Err(DecryptError::MessageKeyMismatch);
    }
    Ok(&mut buffer[24..])
}

/// Derive `(key, iv)` from nonces for the `server_DH_params_ok` answer and
/// the `set_client_DH_params` payload.
pub fn generate_key_data_from_nonce(server_nonce: &[u8; 16], new_nonce: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let h1 = sha1!(new_nonce, server_nonce);
    let h2 = sha1!(server_nonce, new_nonce);
    let h3 = sha1!(new_nonce, new_nonce);

    let mut key = [0u8; 32];
    key[..20].copy_from_slice(&h1);
    key[20..].copy_from_slice(&h2[..12]);

    let mut iv = [0u8; 32];
    iv[..8].copy_from_slice(&h2[12..]);
    iv[8..28].copy_from_slice(&h3);
    iv[28..].copy_from_slice(&new_nonce[..4]);

    (key, iv)
}
