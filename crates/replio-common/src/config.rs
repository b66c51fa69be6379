//! Per-bucket properties and the local bucket registry
//!
//! The cluster-wide bucket catalog is an external collaborator; the
//! `BucketRegistry` here is its local contract: it owns bucket identities
//! (backend ids included) and their properties on this node.

use crate::checksum::CksumType;
use crate::error::{Error, Result};
use crate::types::Bck;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// N-way mirroring configuration
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MirrorConf {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_copies")]
    pub copies: u32,
}

fn default_copies() -> u32 {
    2
}

impl Default for MirrorConf {
    fn default() -> Self {
        Self { enabled: false, copies: default_copies() }
    }
}

/// When replica metadata gets flushed to disk
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MdWritePolicy {
    /// Persist synchronously with the metadata mutation
    #[default]
    Immediate,
    /// Mark dirty; flushed by a later persist
    Delayed,
}

impl MdWritePolicy {
    #[must_use]
    pub fn is_immediate(&self) -> bool {
        matches!(self, Self::Immediate)
    }
}

/// Bucket properties
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Bprops {
    #[serde(default)]
    pub mirror: MirrorConf,
    #[serde(default)]
    pub md_write: MdWritePolicy,
    #[serde(default)]
    pub cksum_ty: CksumType,
}

/// Local registry of buckets known to this node
#[derive(Default)]
pub struct BucketRegistry {
    buckets: RwLock<HashMap<String, (Bck, Arc<Bprops>)>>,
    next_bid: AtomicU64,
}

impl BucketRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self { buckets: RwLock::new(HashMap::new()), next_bid: AtomicU64::new(1) }
    }

    /// Register a bucket, assigning it a fresh backend id.
    /// Re-adding an existing name replaces its properties but keeps the bid.
    pub fn add(&self, name: &str, props: Bprops) -> Bck {
        let mut buckets = self.buckets.write();
        let bck = match buckets.get(name) {
            Some((bck, _)) => bck.clone(),
            None => {
                let mut bck = Bck::new(name);
                bck.bid = self.next_bid.fetch_add(1, Ordering::Relaxed);
                bck
            }
        };
        buckets.insert(name.to_string(), (bck.clone(), Arc::new(props)));
        bck
    }

    pub fn remove(&self, name: &str) {
        self.buckets.write().remove(name);
    }

    /// Look up a bucket by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<(Bck, Arc<Bprops>)> {
        self.buckets.read().get(name).cloned()
    }

    /// Properties for a known bucket identity
    pub fn props(&self, bck: &Bck) -> Result<Arc<Bprops>> {
        match self.buckets.read().get(&bck.name) {
            Some((known, props)) if known.equal(bck, true, true) => Ok(Arc::clone(props)),
            _ => Err(Error::BucketNotFound(bck.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_add_get() {
        let reg = BucketRegistry::new();
        let bck = reg.add("data", Bprops::default());
        assert_ne!(bck.bid, 0);

        let (found, props) = reg.get("data").unwrap();
        assert_eq!(found, bck);
        assert!(!props.mirror.enabled);

        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn test_readd_keeps_bid() {
        let reg = BucketRegistry::new();
        let bck = reg.add("data", Bprops::default());
        let props = Bprops {
            mirror: MirrorConf { enabled: true, copies: 3 },
            ..Default::default()
        };
        let again = reg.add("data", props);
        assert_eq!(bck.bid, again.bid);
        assert_eq!(reg.props(&bck).unwrap().mirror.copies, 3);
    }

    #[test]
    fn test_props_checks_identity() {
        let reg = BucketRegistry::new();
        let bck = reg.add("data", Bprops::default());
        assert!(reg.props(&bck).is_ok());

        let stale = Bck { bid: bck.bid + 100, ..bck };
        assert!(matches!(reg.props(&stale), Err(Error::BucketNotFound(_))));
    }

    #[test]
    fn test_write_policy() {
        assert!(MdWritePolicy::Immediate.is_immediate());
        assert!(!MdWritePolicy::Delayed.is_immediate());
    }
}
