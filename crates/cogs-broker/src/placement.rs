//! Device placement decisions

/// Strategy for choosing which free devices satisfy a claim
pub trait PlacementStrategy: Send + Sync {
    /// Pick `count` devices out of `free` (ascending device numbers)
    ///
    /// Returns `None` when the request cannot be satisfied.
    fn place(&self, count: usize, free: &[u32]) -> Option<Vec<u32>>;

    /// Get the strategy name
    fn name(&self) -> &'static str;
}

/// Default placement strategy: lowest device numbers first
pub struct LowestNumberFirst;

impl PlacementStrategy for LowestNumberFirst {
    fn place(&self, count: usize, free: &[u32]) -> Option<Vec<u32>> {
        if count == 0 || free.len() < count {
            return None;
        }

        let mut numbers = free.to_vec();
        numbers.sort_unstable();
        numbers.truncate(count);
        Some(numbers)
    }

    fn name(&self) -> &'static str {
        "lowest-number-first"
    }
}
