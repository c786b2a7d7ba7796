//! `OrderedIndex`: the operation contract shared by every index a harness
//! can drive.
//!
//! [`ArtTree`] implements it, and so does [`LockedBTreeMap`], a
//! `RwLock<BTreeMap>` baseline with the same semantics that tests use as an
//! oracle and benchmarks as a reference point.

use std::collections::BTreeMap;
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::ArtError;
use crate::tree::{ArtTree, InsertOutcome, RemoveOutcome, ScanResult, UpdateOutcome};

/// An ordered, concurrent map from byte strings to byte strings.
pub trait OrderedIndex: Send + Sync {
    /// Short name for reports.
    fn name(&self) -> &'static str;

    /// Value of a live record.
    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>>;

    /// Insert if no live record exists.
    ///
    /// # Errors
    /// Implementation-specific resource failures.
    fn insert(&self, key: &[u8], value: &[u8]) -> Result<InsertOutcome, ArtError>;

    /// Replace the value of a live record.
    ///
    /// # Errors
    /// Implementation-specific resource failures.
    fn update(&self, key: &[u8], value: &[u8]) -> Result<UpdateOutcome, ArtError>;

    /// Remove a live record.
    ///
    /// # Errors
    /// Implementation-specific resource failures.
    fn remove(&self, key: &[u8]) -> Result<RemoveOutcome, ArtError>;

    /// Up to `max` live records in `[start, end)`, ascending.
    fn scan(&self, start: &[u8], end: &[u8], max: usize) -> ScanResult;
}

impl OrderedIndex for ArtTree {
    fn name(&self) -> &'static str {
        "nvart"
    }

    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        Self::lookup(self, key)
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<InsertOutcome, ArtError> {
        Self::insert(self, key, value)
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<UpdateOutcome, ArtError> {
        Self::update(self, key, value)
    }

    fn remove(&self, key: &[u8]) -> Result<RemoveOutcome, ArtError> {
        Self::remove(self, key)
    }

    fn scan(&self, start: &[u8], end: &[u8], max: usize) -> ScanResult {
        Self::scan(self, start, end, max)
    }
}

// ============================================================================
//  LockedBTreeMap
// ============================================================================

/// Volatile baseline: a `BTreeMap` behind a reader-writer lock.
#[derive(Debug, Default)]
pub struct LockedBTreeMap {
    map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl LockedBTreeMap {
    /// Empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// True if no record is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl OrderedIndex for LockedBTreeMap {
    fn name(&self) -> &'static str {
        "btreemap"
    }

    fn lookup(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().get(key).cloned()
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<InsertOutcome, ArtError> {
        let mut map = self.map.write();
        if map.contains_key(key) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        map.insert(key.to_vec(), value.to_vec());
        Ok(InsertOutcome::Inserted)
    }

    fn update(&self, key: &[u8], value: &[u8]) -> Result<UpdateOutcome, ArtError> {
        Ok(match self.map.write().get_mut(key) {
            Some(slot) => {
                *slot = value.to_vec();
                UpdateOutcome::Updated
            }
            None => UpdateOutcome::NotFound,
        })
    }

    fn remove(&self, key: &[u8]) -> Result<RemoveOutcome, ArtError> {
        Ok(match self.map.write().remove(key) {
            Some(_) => RemoveOutcome::Removed,
            None => RemoveOutcome::NotFound,
        })
    }

    fn scan(&self, start: &[u8], end: &[u8], max: usize) -> ScanResult {
        if start >= end {
            return ScanResult::default();
        }

        let map = self.map.read();
        let range = map.range::<[u8], _>((Bound::Included(start), Bound::Excluded(end)));
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        let mut continuation: Option<Vec<u8>> = None;
        for (key, value) in range {
            if entries.len() == max {
                continuation = Some(key.clone());
                break;
            }
            entries.push((key.clone(), value.clone()));
        }
        ScanResult {
            entries,
            continuation,
        }
    }
}
