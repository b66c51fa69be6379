//! Replio Common - Shared types and utilities
//!
//! This crate provides common types, error definitions, the checksum
//! engine, and per-bucket configuration used across all replio components.

pub mod checksum;
pub mod config;
pub mod error;
pub mod types;

pub use checksum::{Cksum, CksumHash, CksumType};
pub use config::{Bprops, BucketRegistry, MdWritePolicy, MirrorConf};
pub use error::{Error, Result};
pub use types::*;
