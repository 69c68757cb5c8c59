//! # skiff-common
//!
//! Shared types for the Skiff network subsystem.
//!
//! This crate provides functionality used by the daemon, the helper and the
//! in-VM agent:
//! - The error taxonomy and its HTTP/retry classification
//! - Container and network identifiers
//! - Standard filesystem paths

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;

pub use error::{SkiffError, SkiffResult};
pub use id::{ContainerId, NetworkId};
pub use paths::SkiffPaths;
