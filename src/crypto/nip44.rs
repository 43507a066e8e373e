//! NIP-44 (v2) encrypted payloads.
//!
//! <https://github.com/nostr-protocol/nips/blob/master/44.md>
//!
//! Wire form: `base64(0x02 ‖ nonce ‖ ciphertext ‖ mac)`. The MAC is
//! verified in constant time before any decryption happens.

use std::fmt;
use std::ops::Range;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chacha20::cipher::{KeyIvInit, StreamCipher};
use chacha20::ChaCha20;
use getrandom::getrandom;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use super::{ecdh_x, CryptoError};
use crate::types::{PublicKey, SecretKey};

const VERSION: u8 = 2;
const MESSAGE_KEYS_SIZE: usize = 76;
const CHACHA_KEY_SIZE: usize = 32;
const CHACHA_NONCE_SIZE: usize = 12;
const CHACHA_KEY_RANGE: Range<usize> = 0..CHACHA_KEY_SIZE;
const CHACHA_NONCE_RANGE: Range<usize> = CHACHA_KEY_SIZE..CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE;
const HMAC_KEY_RANGE: Range<usize> = CHACHA_KEY_SIZE + CHACHA_NONCE_SIZE..MESSAGE_KEYS_SIZE;

const MIN_PLAINTEXT_SIZE: usize = 1;
const MAX_PLAINTEXT_SIZE: usize = 65535;

// Decoded payload bounds: 1 + 32 + (2 + 32·k) + 32 for k ≥ 1.
const MIN_PAYLOAD_SIZE: usize = 99;
const MAX_PAYLOAD_SIZE: usize = 65603;

/// Per-pair symmetric key: `HKDF-Extract(salt="nip44-v2", ikm=ECDH_x)`.
/// Derived once per counterparty and cached inside the session.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ConversationKey([u8; 32]);

impl fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConversationKey(<sensitive>)")
    }
}

impl ConversationKey {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn derive(
        secret_key: &SecretKey,
        public_key: &PublicKey,
    ) -> Result<Self, CryptoError> {
        let shared_x = ecdh_x(secret_key, public_key)?;
        let (prk, _) = Hkdf::<Sha256>::extract(Some(b"nip44-v2"), &shared_x);
        let mut key = [0u8; 32];
        key.copy_from_slice(&prk);
        Ok(Self(key))
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != 32 {
            return Err(CryptoError::InvalidKey("conversation key length".into()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(slice);
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

struct MessageKeys {
    chacha_key: [u8; 32],
    chacha_nonce: [u8; 12],
    hmac_key: [u8; 32],
}

impl MessageKeys {
    /// HKDF-Expand(conversation_key, info=nonce, L=76) split 32‖12‖32.
    fn derive(conversation_key: &ConversationKey, nonce: &[u8; 32]) -> Result<Self, CryptoError> {
        let hk = Hkdf::<Sha256>::from_prk(conversation_key.as_bytes())
            .map_err(|_| CryptoError::InvalidKey("prk length".into()))?;

        let mut okm = [0u8; MESSAGE_KEYS_SIZE];
        hk.expand(nonce, &mut okm)
            .map_err(|_| CryptoError::InvalidKey("hkdf expand".into()))?;

        let mut keys = MessageKeys {
            chacha_key: [0u8; 32],
            chacha_nonce: [0u8; 12],
            hmac_key: [0u8; 32],
        };
        keys.chacha_key.copy_from_slice(&okm[CHACHA_KEY_RANGE]);
        keys.chacha_nonce.copy_from_slice(&okm[CHACHA_NONCE_RANGE]);
        keys.hmac_key.copy_from_slice(&okm[HMAC_KEY_RANGE]);
        Ok(keys)
    }
}

/// Padded length: 32 for short messages, then the next multiple of
/// `max(32, next_power_of_two(len)/8)`.
fn calc_padded_len(unpadded_len: usize) -> usize {
    if unpadded_len <= 32 {
        return 32;
    }
    let next_power = 1usize << ((unpadded_len - 1).ilog2() + 1);
    let chunk = if next_power <= 256 { 32 } else { next_power / 8 };
    chunk * ((unpadded_len - 1) / chunk + 1)
}

fn pad(plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let len = plaintext.len();
    if len < MIN_PLAINTEXT_SIZE {
        return Err(CryptoError::MessageEmpty);
    }
    if len > MAX_PLAINTEXT_SIZE {
        return Err(CryptoError::MessageTooLong);
    }

    let padded_len = calc_padded_len(len);
    let mut padded = Vec::with_capacity(2 + padded_len);
    padded.extend_from_slice(&(len as u16).to_be_bytes());
    padded.extend_from_slice(plaintext);
    padded.resize(2 + padded_len, 0);
    Ok(padded)
}

/// Plaintext length comes from the u16 prefix; bytes past `2 + u` are
/// discarded after the padded-length cross-check.
fn unpad(padded: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if padded.len() < 2 {
        return Err(CryptoError::InvalidPadding);
    }
    let unpadded_len = u16::from_be_bytes([padded[0], padded[1]]) as usize;
    if unpadded_len == 0 {
        return Err(CryptoError::MessageEmpty);
    }
    if padded.len() < 2 + unpadded_len || padded.len() != 2 + calc_padded_len(unpadded_len) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(padded[2..2 + unpadded_len].to_vec())
}

fn encrypt_with_nonce(
    conversation_key: &ConversationKey,
    plaintext: &[u8],
    nonce: &[u8; 32],
) -> Result<Vec<u8>, CryptoError> {
    let mut ciphertext = pad(plaintext)?;
    let keys = MessageKeys::derive(conversation_key, nonce)?;

    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut ciphertext);

    let mut mac = Hmac::<Sha256>::new_from_slice(&keys.hmac_key)
        .expect("HMAC accepts any key size");
    mac.update(nonce);
    mac.update(&ciphertext);
    let mac_bytes = mac.finalize().into_bytes();

    let mut payload = Vec::with_capacity(1 + 32 + ciphertext.len() + 32);
    payload.push(VERSION);
    payload.extend_from_slice(nonce);
    payload.extend_from_slice(&ciphertext);
    payload.extend_from_slice(&mac_bytes);
    Ok(payload)
}

fn decrypt_bytes(
    conversation_key: &ConversationKey,
    payload: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let len = payload.len();
    if !(MIN_PAYLOAD_SIZE..=MAX_PAYLOAD_SIZE).contains(&len) {
        return Err(CryptoError::InvalidPayload);
    }
    if payload[0] != VERSION {
        return Err(CryptoError::UnsupportedVersion(payload[0]));
    }

    let nonce: [u8; 32] = payload[1..33].try_into().expect("slice length checked");
    let ciphertext = &payload[33..len - 32];
    let mac = &payload[len - 32..];

    let keys = MessageKeys::derive(conversation_key, &nonce)?;

    let mut verifier = Hmac::<Sha256>::new_from_slice(&keys.hmac_key)
        .expect("HMAC accepts any key size");
    verifier.update(&nonce);
    verifier.update(ciphertext);
    // Constant-time comparison; decryption only happens after this passes.
    verifier
        .verify_slice(mac)
        .map_err(|_| CryptoError::InvalidMac)?;

    let mut padded = ciphertext.to_vec();
    let mut cipher = ChaCha20::new(&keys.chacha_key.into(), &keys.chacha_nonce.into());
    cipher.apply_keystream(&mut padded);

    unpad(&padded)
}

/// Encrypt a UTF-8 message; returns the base64 wire payload.
pub fn encrypt(plaintext: &str, conversation_key: &ConversationKey) -> Result<String, CryptoError> {
    let mut nonce = [0u8; 32];
    getrandom(&mut nonce).map_err(|_| CryptoError::Random)?;
    let payload = encrypt_with_nonce(conversation_key, plaintext.as_bytes(), &nonce)?;
    Ok(BASE64.encode(payload))
}

/// Decrypt a base64 wire payload.
///
/// Payloads starting with `#` are reserved future versions and fail with
/// [`CryptoError::UnsupportedVersion`], distinct from a MAC failure.
pub fn decrypt(payload: &str, conversation_key: &ConversationKey) -> Result<String, CryptoError> {
    if payload.starts_with('#') {
        return Err(CryptoError::UnsupportedVersion(0));
    }
    // Base64 bounds for a payload within the decoded limits.
    let plen = payload.len();
    if !(132..=87472).contains(&plen) {
        return Err(CryptoError::InvalidPayload);
    }
    let data = BASE64
        .decode(payload)
        .map_err(|e| CryptoError::Decoding(e.to_string()))?;
    let plaintext = decrypt_bytes(conversation_key, &data)?;
    String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
}
