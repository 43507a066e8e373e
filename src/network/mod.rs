//! Query fan-out, the warm aggregator, and the publisher.

pub mod aggregator;
pub mod fetch;
pub mod publish;

pub use aggregator::Aggregator;
pub use fetch::Fetcher;
pub use publish::{PublishOutcome, Publisher};
