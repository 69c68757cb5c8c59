//! Kernel interface names for bridges, switch ports and container devices.
//!
//! Linux limits interface names to `IFNAMSIZ - 1` = 15 bytes, so names are
//! derived from a truncated SHA-256 of the owning identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use skiff_common::{SkiffError, SkiffResult};

/// Longest interface name the kernel accepts.
pub const MAX_IFNAME_LEN: usize = 15;

/// Prefix of helper-side switch ports.
pub const PORT_PREFIX: &str = "tp";

/// Hex characters of the hash used in switch port names.
pub const PORT_HASH_LEN: usize = 12;

/// How bridge names are derived from network ids.
///
/// With `hash_len` hex characters the chance that any two of `n` live
/// bridges share a first-choice name is about `n² / 2^(4·hash_len + 1)`;
/// see [`BridgeNaming::collision_probability`]. The helper resolves the
/// remaining collisions with [`BridgeNaming::candidate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeNaming {
    /// Literal prefix (default `br-`).
    pub prefix: String,
    /// Number of hex characters taken from the hash (default 12).
    pub hash_len: usize,
}

impl Default for BridgeNaming {
    fn default() -> Self {
        Self {
            prefix: "br-".to_string(),
            hash_len: 12,
        }
    }
}

impl BridgeNaming {
    /// Create a naming scheme.
    ///
    /// # Errors
    ///
    /// Returns an error if the resulting names could exceed 15 bytes or
    /// carry too little entropy.
    pub fn new(prefix: impl Into<String>, hash_len: usize) -> SkiffResult<Self> {
        let naming = Self {
            prefix: prefix.into(),
            hash_len,
        };
        naming.validate()?;
        Ok(naming)
    }

    /// Check the length limits.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] if the scheme is unusable.
    pub fn validate(&self) -> SkiffResult<()> {
        if self.hash_len < 6 || self.hash_len > 64 {
            return Err(SkiffError::Config {
                message: format!("bridge hash length {} outside 6..=64", self.hash_len),
            });
        }
        if self.prefix.len() + self.hash_len > MAX_IFNAME_LEN {
            return Err(SkiffError::Config {
                message: format!(
                    "bridge names '{}' + {} hex chars exceed {MAX_IFNAME_LEN} bytes",
                    self.prefix, self.hash_len
                ),
            });
        }
        if !self
            .prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(SkiffError::Config {
                message: format!("bridge prefix '{}' is not a valid interface name", self.prefix),
            });
        }
        Ok(())
    }

    /// First-choice bridge name for a network.
    #[must_use]
    pub fn bridge_name(&self, network_id: &str) -> String {
        self.candidate(network_id, 0)
    }

    /// The `salt`-th candidate name; salt 0 is [`Self::bridge_name`].
    #[must_use]
    pub fn candidate(&self, network_id: &str, salt: u32) -> String {
        let digest = if salt == 0 {
            Sha256::digest(network_id.as_bytes())
        } else {
            Sha256::digest(format!("{network_id}#{salt}").as_bytes())
        };
        let hash = hex::encode(digest);
        format!("{}{}", self.prefix, &hash[..self.hash_len])
    }

    /// Approximate probability that `live` bridges include a first-choice
    /// name collision.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
    pub fn collision_probability(&self, live: u64) -> f64 {
        let space = 2f64.powi((self.hash_len * 4) as i32);
        let pairs = (live as f64) * (live.saturating_sub(1) as f64) / 2.0;
        (pairs / space).min(1.0)
    }
}

/// Helper-side switch port name for an attachment (14 bytes).
#[must_use]
pub fn port_name(container_id: &str, network_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(container_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(network_id.as_bytes());
    let hash = hex::encode(hasher.finalize());
    format!("{PORT_PREFIX}{}", &hash[..PORT_HASH_LEN])
}

/// Device name of the `index`-th interface inside a container VM.
#[must_use]
pub fn device_name(index: u32) -> String {
    format!("eth{index}")
}

/// Parse an `ethN` device name back into its index.
#[must_use]
pub fn device_index(name: &str) -> Option<u32> {
    name.strip_prefix("eth")?.parse().ok()
}
