use std::collections::HashSet;
use std::hash::Hash;

/// Two values with no inherent order, stored smallest first.
///
/// `UnorderedPair::new(a, b) == UnorderedPair::new(b, a)` for all `a`, `b`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnorderedPair<T> {
    low: T,
    high: T,
}

impl<T: Ord> UnorderedPair<T> {
    /// Build the canonical pair for `a` and `b`.
    pub fn new(a: T, b: T) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }
}

/// Append-only set of identity pairs that must never be matched again.
#[derive(Debug)]
pub struct BlockLedger<T> {
    records: HashSet<UnorderedPair<T>>,
}

impl<T: Ord + Hash + Clone> BlockLedger<T> {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self {
            records: HashSet::new(),
        }
    }

    /// Record a block between `a` and `b`. Returns `false` if it already existed.
    pub fn block(&mut self, a: &T, b: &T) -> bool {
        self.records.insert(UnorderedPair::new(a.clone(), b.clone()))
    }

    /// Whether `a` and `b` have a block record, in either direction.
    #[must_use]
    pub fn is_blocked(&self, a: &T, b: &T) -> bool {
        self.records
            .contains(&UnorderedPair::new(a.clone(), b.clone()))
    }

    /// Number of block records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

impl<T: Ord + Hash + Clone> Default for BlockLedger<T> {
    fn default() -> Self {
        Self::new()
    }
}
