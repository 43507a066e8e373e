//! NIP-04 encrypted direct messages (legacy).
//!
//! AES-256-CBC with PKCS#7 padding, IV carried after a `?iv=` separator.
//! The key is the raw ECDH x-coordinate, not hashed and not HKDF-derived;
//! this scheme and NIP-44 are selected by counterparty capability and are
//! never interchangeable.

use aes::Aes256;
use base64::engine::{general_purpose, Engine};
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use getrandom::getrandom;

use super::{ecdh_x, CryptoError};
use crate::types::{PublicKey, SecretKey};

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

fn generate_iv() -> Result<[u8; 16], CryptoError> {
    let mut iv = [0u8; 16];
    getrandom(&mut iv).map_err(|_| CryptoError::Random)?;
    Ok(iv)
}

pub fn encrypt(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    content: &str,
) -> Result<String, CryptoError> {
    encrypt_with_iv(secret_key, public_key, content, generate_iv()?)
}

pub fn encrypt_with_iv(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    content: &str,
    iv: [u8; 16],
) -> Result<String, CryptoError> {
    let key = ecdh_x(secret_key, public_key)?;
    let cipher = Aes256CbcEnc::new(&key.into(), &iv.into());
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(content.as_bytes());
    Ok(format!(
        "{}?iv={}",
        general_purpose::STANDARD.encode(ciphertext),
        general_purpose::STANDARD.encode(iv)
    ))
}

pub fn decrypt(
    secret_key: &SecretKey,
    public_key: &PublicKey,
    encrypted_content: &str,
) -> Result<String, CryptoError> {
    let (payload, iv) = encrypted_content
        .split_once("?iv=")
        .ok_or(CryptoError::InvalidPayload)?;

    let ciphertext = general_purpose::STANDARD
        .decode(payload)
        .map_err(|e| CryptoError::Decoding(e.to_string()))?;
    let iv = general_purpose::STANDARD
        .decode(iv)
        .map_err(|e| CryptoError::Decoding(e.to_string()))?;
    if iv.len() != 16 {
        return Err(CryptoError::InvalidPayload);
    }

    let key = ecdh_x(secret_key, public_key)?;
    let cipher = Aes256CbcDec::new(&key.into(), iv.as_slice().into());
    let plaintext = cipher
        .decrypt_padded_vec_mut::<Pkcs7>(&ciphertext)
        .map_err(|_| CryptoError::InvalidPadding)?;

    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Keys;

    #[test]
    fn round_trip_between_two_parties() {
        let a = Keys::generate();
        let b = Keys::generate();
        let payload = encrypt(&a.secret_key, &b.public_key(), "legacy hello").unwrap();
        assert!(payload.contains("?iv="));
        let plaintext = decrypt(&b.secret_key, &a.public_key(), &payload).unwrap();
        assert_eq!(plaintext, "legacy hello");
    }

    #[test]
    fn missing_iv_separator_is_rejected() {
        let a = Keys::generate();
        let b = Keys::generate();
        assert_eq!(
            decrypt(&a.secret_key, &b.public_key(), "bm90LWEtcGF5bG9hZA=="),
            Err(CryptoError::InvalidPayload)
        );
    }

    #[test]
    fn nip04_key_differs_from_nip44_conversation_key() {
        let a = Keys::generate();
        let b = Keys::generate();
        let raw_x = ecdh_x(&a.secret_key, &b.public_key()).unwrap();
        let conv = crate::crypto::nip44::ConversationKey::derive(&a.secret_key, &b.public_key())
            .unwrap();
        assert_ne!(&raw_x, conv.as_bytes());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let a = Keys::generate();
        let b = Keys::generate();
        let payload = encrypt(&a.secret_key, &b.public_key(), "a message long enough").unwrap();
        let (ct, iv) = payload.split_once("?iv=").unwrap();
        let mut raw = general_purpose::STANDARD.decode(ct).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let mangled = format!("{}?iv={}", general_purpose::STANDARD.encode(raw), iv);
        // CBC has no authentication; tampering surfaces as a padding error
        // or garbage plaintext, never silently as the original message.
        match decrypt(&b.secret_key, &a.public_key(), &mangled) {
            Ok(text) => assert_ne!(text, "a message long enough"),
            Err(_) => {}
        }
    }
}
