//! Small shared helpers.

use crate::types::Timestamp;

/// Current Unix time in seconds.
pub fn now() -> Timestamp {
    chrono::Utc::now().timestamp()
}

/// Current Unix time in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `len` random bytes as lowercase hex (`2*len` characters).
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes).expect("system randomness available");
    hex::encode(bytes)
}

/// A short random subscription id.
pub fn random_sub_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_has_requested_length() {
        assert_eq!(random_hex(16).len(), 32);
        assert_ne!(random_hex(16), random_hex(16));
    }

    #[test]
    fn sub_ids_are_unique() {
        assert_ne!(random_sub_id(), random_sub_id());
        assert_eq!(random_sub_id().len(), 16);
    }
}
