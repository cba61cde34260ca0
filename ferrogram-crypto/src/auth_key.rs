//! The 256-byte authorization key produced by the DH handshake.

use crate::sha1;

/// An MTProto authorization key plus its pre-computed identifiers.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
}

impl AuthKey {
    /// Construct from raw 256-byte DH output.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let sha = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id }
    }

    /// Build from a stored key of any length; only exactly 256 bytes is valid.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let data: [u8; 256] = data.try_into().ok()?;
        Some(Self::from_bytes(data))
    }

    /// Return the raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; 256] { self.data }

    /// The 8-byte key identifier (SHA-1(key)[12..20]).
    pub fn key_id(&self) -> [u8; 8] { self.key_id }

    /// The key identifier read as the little-endian `long` sent on the wire.
    pub fn fingerprint(&self) -> i64 { i64::from_le_bytes(self.key_id) }

    /// `auth_key_aux_hash`: the `retry_id` sent after a `dh_gen_retry`.
    pub fn aux_hash(&self) -> i64 { i64::from_le_bytes(self.aux_hash) }

    /// Compute the new-nonce hash needed for `dh_gen_ok/retry/fail` verification.
    pub fn calc_new_nonce_hash(&self, new_nonce: &[u8; 32], number: u8) -> [u8; 16] {
        let sha = sha1!(new_nonce, [number], self.aux_hash);
        let mut out = [0u8; 16];
        out.copy_from_slice(&sha[4..]);
        out
    }
}

impl std::fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={})", self.fingerprint())
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool { self.key_id == other.key_id }
}

impl Eq for AuthKey {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_slice_rejects_wrong_length() {
        assert!(AuthKey::from_slice(&[0u8; 255]).is_none());
        assert!(AuthKey::from_slice(&[0u8; 256]).is_some());
    }

    #[test]
    fn fingerprint_is_key_id() {
        let key = AuthKey::from_bytes([5u8; 256]);
        assert_eq!(key.fingerprint().to_le_bytes(), key.key_id());
    }
}
