//! Encrypted channels between two x-only pubkeys.
//!
//! NIP-44 v2 is the primary scheme (ECDH + HKDF + ChaCha20 + HMAC); NIP-04
//! is the legacy AES-CBC scheme kept for signers that predate NIP-44. The
//! two are never interchangeable: the NIP-04 key is the raw ECDH
//! x-coordinate while NIP-44 runs it through HKDF-Extract first.

pub mod nip04;
pub mod nip44;

use thiserror::Error;

use crate::types::{PublicKey, SecretKey};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("message empty")]
    MessageEmpty,

    #[error("message too long")]
    MessageTooLong,

    #[error("invalid MAC")]
    InvalidMac,

    #[error("invalid padding")]
    InvalidPadding,

    #[error("invalid payload")]
    InvalidPayload,

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("utf-8 error")]
    Utf8,

    #[error("random generation failed")]
    Random,
}

/// ECDH on secp256k1, returning the x-coordinate padded to 32 bytes.
///
/// Nostr pubkeys are x-only; the full point is recovered by trying the even
/// y-parity first, then the odd one.
pub(crate) fn ecdh_x(
    secret_key: &SecretKey,
    public_key: &PublicKey,
) -> Result<[u8; 32], CryptoError> {
    use k256::{ecdh::diffie_hellman, PublicKey as K256PublicKey, SecretKey as K256SecretKey};

    let k256_secret = K256SecretKey::from_slice(&secret_key.0)
        .map_err(|e| CryptoError::InvalidKey(format!("secret key: {e}")))?;

    let mut compressed = [0u8; 33];
    compressed[0] = 0x02;
    compressed[1..].copy_from_slice(&public_key.0);
    let k256_public = K256PublicKey::from_sec1_bytes(&compressed)
        .or_else(|_| {
            compressed[0] = 0x03;
            K256PublicKey::from_sec1_bytes(&compressed)
        })
        .map_err(|e| CryptoError::InvalidKey(format!("public key: {e}")))?;

    let shared = diffie_hellman(k256_secret.to_nonzero_scalar(), k256_public.as_affine());

    let mut x = [0u8; 32];
    x.copy_from_slice(shared.raw_secret_bytes());
    Ok(x)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keys;

    #[test]
    fn ecdh_is_symmetric() {
        let a = Keys::generate();
        let b = Keys::generate();
        let ab = ecdh_x(&a.secret_key, &b.public_key()).unwrap();
        let ba = ecdh_x(&b.secret_key, &a.public_key()).unwrap();
        assert_eq!(ab, ba);
    }
}
