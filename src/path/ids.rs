//! Path identifier allocation
//!
//! An identifier doubles as packet mark, HTB class minor and monitor series
//! key. Availability is always recomputed from the persisted path list:
//! an identifier is free exactly when no record carries it, so there is no
//! free list to keep in sync.

use std::collections::HashSet;
use std::ops::RangeInclusive;

use super::model::PathRecord;
use crate::error::{Error, Result};
use crate::store::PathList;

#[derive(Debug, Clone)]
pub struct IdAllocator {
    range: RangeInclusive<u32>,
}

impl IdAllocator {
    pub fn new(range: RangeInclusive<u32>) -> Self {
        Self { range }
    }

    pub fn range(&self) -> RangeInclusive<u32> {
        self.range.clone()
    }

    /// Smallest identifier not used by the persisted list.
    ///
    /// Call with the identifier lock held, or two callers can get the same value.
    pub fn acquire_id(&self, list: &PathList) -> Result<u32> {
        self.first_free(&list.load())
    }

    pub fn first_free(&self, records: &[PathRecord]) -> Result<u32> {
        let used: HashSet<u32> = records.iter().map(|r| r.id).collect();

        self.range
            .clone()
            .find(|id| !used.contains(id))
            .ok_or(Error::NoIdentifierAvailable {
                min: *self.range.start(),
                max: *self.range.end(),
            })
    }

    /// Identifiers return to the pool when their record leaves the list.
    pub fn release_id(&self, _id: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::model::{PathSettings, Selector};

    fn record(id: u32) -> PathRecord {
        let mut r = PathRecord::new(Selector::default(), PathSettings::Model("m".into()));
        r.id = id;
        r
    }

    #[test]
    fn test_smallest_free_identifier() {
        let alloc = IdAllocator::new(10..=13);
        assert_eq!(alloc.first_free(&[]).unwrap(), 10);
        assert_eq!(alloc.first_free(&[record(10), record(12)]).unwrap(), 11);
        assert_eq!(alloc.first_free(&[record(11), record(10)]).unwrap(), 12);
        // Out-of-range ids do not matter
        assert_eq!(alloc.first_free(&[record(99)]).unwrap(), 10);
    }

    #[test]
    fn test_exhausted_range() {
        let alloc = IdAllocator::new(10..=12);
        let full = [record(10), record(11), record(12)];
        assert!(matches!(
            alloc.first_free(&full),
            Err(Error::NoIdentifierAvailable { min: 10, max: 12 })
        ));

        // Removing a record frees its identifier without any release call
        alloc.release_id(11);
        assert_eq!(alloc.first_free(&full[..1]).unwrap(), 11);
    }

    #[test]
    fn test_reads_persisted_list() {
        let dir = tempfile::tempdir().unwrap();
        let list = PathList::new(dir.path().join("paths.yaml"));
        let alloc = IdAllocator::new(9527..=9558);

        assert_eq!(alloc.acquire_id(&list).unwrap(), 9527);
        list.save(&[record(9527), record(9528)]).unwrap();
        assert_eq!(alloc.acquire_id(&list).unwrap(), 9529);
    }
}
