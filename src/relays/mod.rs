//! Relay pool: persistent multiplexed WebSocket connections to Nostr
//! relays, shared by every subscriber in the process.

pub mod connection;
pub mod health;
pub mod mailbox;
pub mod pool;
pub mod types;
pub mod utils;

pub use health::{HealthRegistry, RelayHealth};
pub use mailbox::{mailbox, MailboxReceiver, MailboxSender};
pub use pool::RelayPool;
pub use types::{ClientMessage, OkResult, RelayConfig, RelayError, RelayMessage, SubscriptionUpdate};
