//! The stored key/value item.

use std::sync::Arc;
use std::time::SystemTime;

/// A key/value pair plus optional expiration, shared between the keys
/// tree, the expires tree, and every index container as `Arc<Item>`.
///
/// Items are immutable once inserted; replacement is delete-then-insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Item {
    /// The binary key.
    pub key: Vec<u8>,
    /// The binary value.
    pub value: Vec<u8>,
    /// The absolute instant the item expires, if it has a TTL.
    pub expires_at: Option<SystemTime>,
}

impl Item {
    pub fn new(key: Vec<u8>, value: Vec<u8>, expires_at: Option<SystemTime>) -> Arc<Self> {
        Arc::new(Self {
            key,
            value,
            expires_at,
        })
    }

    /// A keyless stand-in used as a range pivot in value-ordered trees.
    /// The empty key sorts before every real key with an equal value.
    pub fn pivot(value: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            key: Vec::new(),
            value,
            expires_at: None,
        })
    }

    /// Whether the item's expiration instant has been reached.
    ///
    /// Always false for items without a TTL. The comparison is inclusive
    /// so a zero TTL yields an item that is born expired.
    pub fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => SystemTime::now() >= at,
            None => false,
        }
    }
}
