// =============================================================================
// dedup.rs - ONE FILING, ONE ROW
// =============================================================================
//
// The accession number (접수번호) is the only identity a KIND filing has.
// Column F of the disclosure list sheet is the source of truth; at the start
// of a run we read it once, seed this index, and every candidate row has to
// get past `check_and_insert` before it is appended.
//
// A plain HashSet behind a parking_lot RwLock. The sheet rarely holds more
// than a few thousand filings, and the set must be exact: a false positive
// would silently drop a filing forever.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::RwLock;
use portable_atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Exact set of accession numbers already persisted (or accepted this run).
pub struct AccessionIndex {
    seen: RwLock<HashSet<String>>,
    pub stats: Arc<DedupStats>,
}

/// Counters for the end-of-run summary.
pub struct DedupStats {
    pub checks: AtomicU64,
    pub unique: AtomicU64,
    pub duplicates: AtomicU64,
    pub seeded: AtomicU64,
}

impl DedupStats {
    fn new() -> Self {
        Self {
            checks: AtomicU64::new(0),
            unique: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            seeded: AtomicU64::new(0),
        }
    }
}

impl AccessionIndex {
    pub fn new() -> Self {
        Self {
            seen: RwLock::new(HashSet::new()),
            stats: Arc::new(DedupStats::new()),
        }
    }

    /// Seed from existing sheet values. Blank cells and the header are
    /// skipped by the caller; whitespace is trimmed here.
    pub fn seed<I, S>(&self, existing: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = self.seen.write();
        let before = seen.len();
        for key in existing {
            let key = key.as_ref().trim();
            if !key.is_empty() {
                seen.insert(key.to_string());
            }
        }
        let added = (seen.len() - before) as u64;
        self.stats.seeded.fetch_add(added, Ordering::Relaxed);
        info!(seeded = added, total = seen.len(), "Accession index seeded from sheet");
    }

    /// Returns `true` if the accession number is NEW and records it.
    pub fn check_and_insert(&self, acptno: &str) -> bool {
        self.stats.checks.fetch_add(1, Ordering::Relaxed);

        let key = acptno.trim();
        if key.is_empty() {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let inserted = self.seen.write().insert(key.to_string());
        if inserted {
            self.stats.unique.fetch_add(1, Ordering::Relaxed);
        } else {
            self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(acptno = key, "Already in the list sheet, skipping");
        }
        inserted
    }

    pub fn contains(&self, acptno: &str) -> bool {
        self.seen.read().contains(acptno.trim())
    }

    pub fn len(&self) -> usize {
        self.seen.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.read().is_empty()
    }

    pub fn snapshot(&self) -> DedupSnapshot {
        DedupSnapshot {
            total_checks: self.stats.checks.load(Ordering::Relaxed),
            unique_items: self.stats.unique.load(Ordering::Relaxed),
            duplicates_caught: self.stats.duplicates.load(Ordering::Relaxed),
            seeded_from_sheet: self.stats.seeded.load(Ordering::Relaxed),
            index_size: self.len(),
        }
    }
}

impl Default for AccessionIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DedupSnapshot {
    pub total_checks: u64,
    pub unique_items: u64,
    pub duplicates_caught: u64,
    pub seeded_from_sheet: u64,
    pub index_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_accession_is_accepted_once() {
        let index = AccessionIndex::new();
        assert!(index.check_and_insert("20251226000082"));
        assert!(!index.check_and_insert("20251226000082"));
        assert!(!index.check_and_insert(" 20251226000082 "));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_seeded_values_are_duplicates() {
        let index = AccessionIndex::new();
        index.seed(["20251226000082", "", "  ", "20251224000011"]);
        assert_eq!(index.len(), 2);
        assert!(!index.check_and_insert("20251224000011"));
        assert!(index.check_and_insert("20251227000003"));

        let snap = index.snapshot();
        assert_eq!(snap.seeded_from_sheet, 2);
        assert_eq!(snap.unique_items, 1);
        assert_eq!(snap.duplicates_caught, 1);
    }

    #[test]
    fn test_blank_accession_is_never_accepted() {
        let index = AccessionIndex::new();
        assert!(!index.check_and_insert(""));
        assert!(index.is_empty());
    }
}
