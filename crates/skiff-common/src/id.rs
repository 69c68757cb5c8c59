//! Container and network identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{SkiffError, SkiffResult};

/// Characters shown by `short()`.
pub const SHORT_LEN: usize = 12;

/// String-backed identifier plumbing shared by [`ContainerId`] and
/// [`NetworkId`]. Each type supplies `fn check(&str) -> SkiffResult<()>`.
macro_rules! string_id {
    ($name:ident) => {
        impl $name {
            /// Parse and validate an identifier.
            ///
            /// # Errors
            ///
            /// Returns an error if the identifier is malformed.
            pub fn new(id: impl Into<String>) -> SkiffResult<Self> {
                let id = id.into();
                Self::check(&id)?;
                Ok(Self(id))
            }

            /// The identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// The first 12 characters, for logs and listings.
            #[must_use]
            pub fn short(&self) -> &str {
                self.0.get(..SHORT_LEN).unwrap_or(&self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = SkiffError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// A container id as the runtime reports it: 1-64 characters of
/// `[A-Za-z0-9_-]`, starting with a letter or digit.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(String);

string_id!(ContainerId);

impl ContainerId {
    /// Maximum length of a container ID.
    pub const MAX_LENGTH: usize = 64;

    /// A random 12 hex character id.
    #[must_use]
    pub fn generate() -> Self {
        Self(hex::encode(&uuid::Uuid::new_v4().as_bytes()[..6]))
    }

    fn check(id: &str) -> SkiffResult<()> {
        let mut chars = id.chars();
        let valid = id.len() <= Self::MAX_LENGTH
            && chars.next().is_some_and(|c| c.is_ascii_alphanumeric())
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(SkiffError::InvalidContainerId { id: id.to_string() })
        }
    }
}

/// A network ID: 64 lowercase hex characters, like Docker's. Shorter
/// prefixes parse too, for lookups.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkId(String);

string_id!(NetworkId);

impl NetworkId {
    /// Length of a generated network ID.
    pub const LENGTH: usize = 64;

    /// Generate a new random network ID.
    #[must_use]
    pub fn generate() -> Self {
        let mut id = String::with_capacity(Self::LENGTH);
        id.push_str(&hex::encode(uuid::Uuid::new_v4().as_bytes()));
        id.push_str(&hex::encode(uuid::Uuid::new_v4().as_bytes()));
        Self(id)
    }

    fn check(id: &str) -> SkiffResult<()> {
        let valid = !id.is_empty()
            && id.len() <= Self::LENGTH
            && id.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
        if valid {
            Ok(())
        } else {
            Err(SkiffError::InvalidRequest {
                message: format!("invalid network id '{id}'"),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_syntax() {
        for ok in ["abc123", "my-container", "my_container", "Container-123_test"] {
            assert!(ContainerId::new(ok).is_ok(), "{ok}");
        }
        for bad in ["", "-invalid", "_invalid", "invalid!"] {
            assert!(ContainerId::new(bad).is_err(), "{bad}");
        }
        assert!(ContainerId::new("a".repeat(65)).is_err());
    }

    #[test]
    fn generated_ids() {
        let container = ContainerId::generate();
        assert_eq!(container.as_str().len(), 12);
        assert_ne!(container, ContainerId::generate());

        let network = NetworkId::generate();
        assert_eq!(network.as_str().len(), NetworkId::LENGTH);
        assert!(NetworkId::new(network.as_str()).is_ok());
        assert_eq!(network.short().len(), SHORT_LEN);
        assert_ne!(network, NetworkId::generate());
    }

    #[test]
    fn short_ids_are_not_truncated() {
        let id = ContainerId::new("web").unwrap();
        assert_eq!(id.short(), "web");
        assert_eq!(id.to_string(), "web");
        assert_eq!("web".parse::<ContainerId>().unwrap(), id);
    }

    proptest::proptest! {
        #[test]
        fn well_formed_container_ids_parse(id in "[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}") {
            let parsed = ContainerId::new(id.clone()).unwrap();
            proptest::prop_assert_eq!(parsed.as_str(), id.as_str());
            proptest::prop_assert!(parsed.short().len() <= SHORT_LEN);
        }
    }

    #[test]
    fn network_id_rejects_non_hex() {
        assert!(NetworkId::new("").is_err());
        assert!(NetworkId::new("bridge").is_err());
        assert!(NetworkId::new("ABCDEF").is_err());
        assert!(NetworkId::new("0".repeat(65)).is_err());
    }
}
