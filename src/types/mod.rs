pub mod nip19;
pub mod nostr;

pub use nostr::*;
