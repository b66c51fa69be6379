//! Core type definitions for replio
//!
//! Bucket identity, canonical object naming, and the request/response
//! messages exchanged with the async bucket-task dispatcher.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Bucket provider: objects owned by this cluster
pub const PROVIDER_LOCAL: &str = "local";
/// Bucket provider: objects backed by a remote backend
pub const PROVIDER_REMOTE: &str = "remote";

/// Dispatcher actions
pub const ACT_LIST_OBJECTS: &str = "list-objects";
pub const ACT_SUMMARY_BUCKET: &str = "summary-bucket";

/// Task-action query parameter values
pub const TASK_START: &str = "start";
pub const TASK_STATUS: &str = "status";
pub const TASK_RESULT: &str = "result";

/// Default page size for list-objects
pub const DEFAULT_PAGE_SIZE: usize = 1000;

fn default_provider() -> String {
    PROVIDER_LOCAL.to_string()
}

/// Bucket identity: name, provider, and the backend id (`bid`) assigned
/// by the bucket catalog. A zero bid means "not yet resolved".
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bck {
    pub name: String,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub bid: u64,
}

impl Bck {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: PROVIDER_LOCAL.to_string(),
            bid: 0,
        }
    }

    /// Compare two bucket identities.
    ///
    /// Names always compare; `same_backend` additionally requires matching
    /// providers, and `must_same_bid` requires matching backend ids when
    /// both sides have one assigned.
    #[must_use]
    pub fn equal(&self, other: &Bck, must_same_bid: bool, same_backend: bool) -> bool {
        if self.name != other.name {
            return false;
        }
        if same_backend && self.provider != other.provider {
            return false;
        }
        if must_same_bid && self.bid != 0 && other.bid != 0 && self.bid != other.bid {
            return false;
        }
        true
    }

    /// Canonical object key: the `uname` used for locking and HRW
    #[must_use]
    pub fn make_uname(&self, objname: &str) -> String {
        format!("{}/{}/{}", self.provider, self.name, objname)
    }
}

impl fmt::Display for Bck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.name)
    }
}

/// Selection message for bucket tasks (list, summary), addressed by UUID
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SelectMsg {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub page_size: usize,
}

impl SelectMsg {
    /// Effective page size (zero means default)
    #[must_use]
    pub fn limit(&self) -> usize {
        if self.page_size == 0 {
            DEFAULT_PAGE_SIZE
        } else {
            self.page_size
        }
    }
}

/// One entry of a bucket listing
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketEntry {
    pub name: String,
    pub size: u64,
}

/// Result of a list-objects task
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BucketList {
    pub uuid: String,
    pub entries: Vec<BucketEntry>,
}

/// Result of a bucket summary task
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct BucketSummary {
    pub name: String,
    pub provider: String,
    pub objects: u64,
    pub size: u64,
}

/// Generic action envelope carried in dispatcher request bodies
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionMsg {
    pub action: String,
    #[serde(default)]
    pub value: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bck_equal() {
        let a = Bck { name: "b".into(), provider: PROVIDER_LOCAL.into(), bid: 7 };
        let b = Bck { name: "b".into(), provider: PROVIDER_LOCAL.into(), bid: 7 };
        assert!(a.equal(&b, true, true));

        let unresolved = Bck::new("b");
        assert!(a.equal(&unresolved, true, true)); // zero bid passes

        let other_bid = Bck { bid: 8, ..b.clone() };
        assert!(!a.equal(&other_bid, true, true));
        assert!(a.equal(&other_bid, false, true));

        let remote = Bck { provider: PROVIDER_REMOTE.into(), ..b.clone() };
        assert!(!a.equal(&remote, false, true));
        assert!(a.equal(&remote, false, false));

        assert!(!a.equal(&Bck::new("c"), false, false));
    }

    #[test]
    fn test_uname() {
        let bck = Bck::new("data");
        assert_eq!(bck.make_uname("dir/obj"), "local/data/dir/obj");
    }

    #[test]
    fn test_select_msg_limit() {
        let msg = SelectMsg::default();
        assert_eq!(msg.limit(), DEFAULT_PAGE_SIZE);
        let msg = SelectMsg { page_size: 10, ..Default::default() };
        assert_eq!(msg.limit(), 10);
    }
}
