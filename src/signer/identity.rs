//! The gateway's own long-lived keypair.
//!
//! In development the key persists as a 64-character hex string in
//! `.dev-keypair` (mode 0600) so restarts keep the same identity; in
//! production the key is ephemeral and cache-resident only.

use std::io;
use std::path::Path;

use crate::types::{Keys, SecretKey};

pub struct ServerIdentity {
    pub keys: Keys,
}

impl ServerIdentity {
    /// Ephemeral identity: fresh keypair, nothing touches disk.
    pub fn ephemeral() -> Self {
        Self {
            keys: Keys::generate(),
        }
    }

    /// Development identity: load `.dev-keypair`, or create it with mode
    /// 0600 on first run.
    pub fn load_or_create(path: &Path) -> io::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                let hex = contents.trim();
                let secret = SecretKey::from_hex(hex).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{}: {e}", path.display()),
                    )
                })?;
                let keys = Keys::new(secret).map_err(|e| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("{}: {e}", path.display()),
                    )
                })?;
                Ok(Self { keys })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let keys = Keys::generate();
                write_keypair_file(path, &keys.secret_key.to_hex())?;
                tracing::info!(path = %path.display(), "created development keypair");
                Ok(Self { keys })
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(unix)]
fn write_keypair_file(path: &Path, hex: &str) -> io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(hex.as_bytes())
}

#[cfg(not(unix))]
fn write_keypair_file(path: &Path, hex: &str) -> io::Result<()> {
    std::fs::write(path, hex)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_then_reloads_the_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".dev-keypair");

        let first = ServerIdentity::load_or_create(&path).unwrap();
        let second = ServerIdentity::load_or_create(&path).unwrap();
        assert_eq!(first.keys.public_key(), second.keys.public_key());

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().len(), 64);
    }

    #[cfg(unix)]
    #[test]
    fn keypair_file_is_owner_readable_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".dev-keypair");
        ServerIdentity::load_or_create(&path).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn corrupt_file_is_an_error_not_a_new_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".dev-keypair");
        std::fs::write(&path, "not hex at all").unwrap();
        assert!(ServerIdentity::load_or_create(&path).is_err());
    }

    #[test]
    fn ephemeral_identities_differ() {
        assert_ne!(
            ServerIdentity::ephemeral().keys.public_key(),
            ServerIdentity::ephemeral().keys.public_key()
        );
    }
}
