//! Credential verification

use std::collections::HashMap;
use std::path::PathBuf;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::config::FtpConfig;

/// Login name reported for anonymous sessions
pub const ANONYMOUS: &str = "anonymous";

/// A verified user and the jail root its sessions are confined to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Login name
    pub name: String,
    /// Real directory the session's `/` maps to
    pub root: PathBuf,
}

impl Identity {
    /// The identity every anonymous session gets.
    pub fn anonymous(root: impl Into<PathBuf>) -> Self {
        Self {
            name: ANONYMOUS.to_string(),
            root: root.into(),
        }
    }
}

/// Answers whether a user name and password belong together.
pub trait CredentialOracle: Send + Sync {
    /// Returns the identity for valid credentials, `None` otherwise.
    fn verify(&self, user: &str, password: &str) -> Option<Identity>;
}

/// Credential table built from the configured users.
#[derive(Debug, Clone, Default)]
pub struct UserTable {
    users: HashMap<String, ([u8; 32], PathBuf)>,
}

impl UserTable {
    /// Builds the table; entries with an undecodable digest are skipped.
    pub fn from_config(config: &FtpConfig) -> Self {
        let mut users = HashMap::new();
        for entry in &config.users {
            let mut digest = [0u8; 32];
            match hex::decode_to_slice(&entry.password_sha256, &mut digest) {
                Ok(()) => {
                    users.insert(entry.name.clone(), (digest, entry.root.clone()));
                }
                Err(e) => warn!(user = %entry.name, error = %e, "skipping user with bad digest"),
            }
        }
        Self { users }
    }

    /// Number of accounts.
    pub fn len(&self) -> usize {
        self.users.len()
    }

    /// True when no accounts are configured.
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl CredentialOracle for UserTable {
    fn verify(&self, user: &str, password: &str) -> Option<Identity> {
        let (expected, root) = self.users.get(user)?;
        let actual = Sha256::digest(password.as_bytes());
        if bool::from(actual.as_slice().ct_eq(expected)) {
            Some(Identity {
                name: user.to_string(),
                root: root.clone(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserEntry;

    fn table() -> UserTable {
        let mut config = FtpConfig::default();
        config.users = vec![
            UserEntry {
                name: "alice".to_string(),
                password_sha256: hex::encode(Sha256::digest(b"wonderland")),
                root: PathBuf::from("/home/alice"),
            },
            UserEntry {
                name: "broken".to_string(),
                password_sha256: "zz".repeat(32),
                root: PathBuf::from("/home/broken"),
            },
        ];
        UserTable::from_config(&config)
    }

    #[test]
    fn test_verify_good_password() {
        let identity = table().verify("alice", "wonderland").unwrap();
        assert_eq!(identity.name, "alice");
        assert_eq!(identity.root, PathBuf::from("/home/alice"));
    }

    #[test]
    fn test_verify_bad_password() {
        assert!(table().verify("alice", "looking-glass").is_none());
    }

    #[test]
    fn test_verify_unknown_user() {
        assert!(table().verify("bob", "wonderland").is_none());
    }

    #[test]
    fn test_bad_digest_skipped() {
        let table = table();
        assert_eq!(table.len(), 1);
        assert!(table.verify("broken", "").is_none());
    }

    #[test]
    fn test_anonymous_identity() {
        let identity = Identity::anonymous("/srv/ftp");
        assert_eq!(identity.name, ANONYMOUS);
        assert_eq!(identity.root, PathBuf::from("/srv/ftp"));
    }
}
