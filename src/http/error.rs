//! Centralised error sanitisation.
//!
//! Every message crossing the HTTP boundary maps to one of a fixed list;
//! the underlying error is logged with full context and never leaks.

use crate::cache::CacheError;
use crate::relays::RelayError;
use crate::signer::SignerError;
use crate::types::TypesError;

pub const MSG_TIMEOUT: &str = "Connection timed out";
pub const MSG_REFUSED: &str = "Request refused";
pub const MSG_RATE_LIMITED: &str = "Too many attempts. Please wait a minute.";
pub const MSG_INVALID: &str = "Invalid input format";
pub const MSG_NOT_CONNECTED: &str = "Not connected";
pub const MSG_FAILED: &str = "Operation failed";

/// Map an internal error onto the fixed outward vocabulary.
pub trait Sanitize {
    fn user_message(&self) -> &'static str;
}

impl Sanitize for SignerError {
    fn user_message(&self) -> &'static str {
        match self {
            SignerError::Timeout => MSG_TIMEOUT,
            SignerError::RateLimited => MSG_RATE_LIMITED,
            SignerError::InvalidUri(_) | SignerError::Codec(_) => MSG_INVALID,
            SignerError::Rejected(_) => MSG_REFUSED,
            SignerError::SessionNotFound | SignerError::NotConnected => MSG_NOT_CONNECTED,
            SignerError::Relay(relay) => relay.user_message(),
            _ => MSG_FAILED,
        }
    }
}

impl Sanitize for RelayError {
    fn user_message(&self) -> &'static str {
        match self {
            RelayError::Timeout => MSG_TIMEOUT,
            RelayError::InvalidUrl(_) | RelayError::InvalidMessage => MSG_INVALID,
            _ => MSG_FAILED,
        }
    }
}

impl Sanitize for TypesError {
    fn user_message(&self) -> &'static str {
        MSG_INVALID
    }
}

impl Sanitize for CacheError {
    fn user_message(&self) -> &'static str {
        MSG_FAILED
    }
}

/// Log the full error, hand back only the sanitised message.
pub fn sanitize<E: Sanitize + std::fmt::Display>(context: &str, error: E) -> &'static str {
    let message = error.user_message();
    tracing::warn!(%context, %error, outward = message, "request failed");
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signer_errors_map_to_the_fixed_list() {
        assert_eq!(SignerError::Timeout.user_message(), MSG_TIMEOUT);
        assert_eq!(SignerError::RateLimited.user_message(), MSG_RATE_LIMITED);
        assert_eq!(
            SignerError::InvalidUri("bunker://bad".into()).user_message(),
            MSG_INVALID
        );
        assert_eq!(
            SignerError::Rejected("user denied".into()).user_message(),
            MSG_REFUSED
        );
        assert_eq!(SignerError::SessionNotFound.user_message(), MSG_NOT_CONNECTED);
        assert_eq!(
            SignerError::UnexpectedResponse("weird".into()).user_message(),
            MSG_FAILED
        );
    }

    #[test]
    fn sanitized_messages_never_carry_internal_detail() {
        let message =
            SignerError::Rejected("secret internal state: key=abc123".into()).user_message();
        assert!(!message.contains("abc123"));
        assert!(!message.contains("key="));
    }

    #[test]
    fn relay_errors_map_to_the_fixed_list() {
        assert_eq!(RelayError::Timeout.user_message(), MSG_TIMEOUT);
        assert_eq!(
            RelayError::InvalidUrl("x".into()).user_message(),
            MSG_INVALID
        );
        assert_eq!(RelayError::ConnectionClosed.user_message(), MSG_FAILED);
        assert_eq!(RelayError::BackingOff.user_message(), MSG_FAILED);
    }
}
