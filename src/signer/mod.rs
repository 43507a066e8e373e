//! Remote signing over NIP-46.
//!
//! The gateway never holds user private keys: signing requests travel as
//! NIP-44-encrypted JSON-RPC bodies inside kind-24133 events to a remote
//! signer ("bunker") that holds the key.

pub mod identity;
pub mod nip46;
pub mod nwc;
pub mod session;
pub mod uri;

use thiserror::Error;

pub use identity::ServerIdentity;
pub use nip46::SignerService;
pub use session::{BunkerSession, PendingConnection, SessionState};

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid connection URI: {0}")]
    InvalidUri(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("codec error: {0}")]
    Codec(#[from] crate::types::TypesError),

    #[error("relay error: {0}")]
    Relay(#[from] crate::relays::RelayError),

    #[error("request timed out")]
    Timeout,

    #[error("signer rejected: {0}")]
    Rejected(String),

    #[error("rate limited")]
    RateLimited,

    #[error("session not found")]
    SessionNotFound,

    #[error("session not connected")]
    NotConnected,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
}
