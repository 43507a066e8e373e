//! Server-side hypermedia gateway to the Nostr protocol.
//!
//! Browsers speak plain HTML to this process; the process speaks the
//! relay wire protocol to a swarm of relays, merges and deduplicates what
//! comes back, and signs outbound events through a NIP-46 remote signer.
//!
//! Layering, leaves first: [`types`] (event codec, NIP-19), [`crypto`]
//! (NIP-44/NIP-04), [`cache`] (key/value plane and rate limiting),
//! [`relays`] (the pool), [`network`] (fan-out, aggregator, publisher),
//! [`signer`] (NIP-46 sessions), [`http`] (the browser surface).

pub mod cache;
pub mod config;
pub mod crypto;
pub mod http;
pub mod logging;
pub mod network;
pub mod relays;
pub mod signer;
pub mod types;
pub mod utils;
