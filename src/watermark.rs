//! Per-container aggregation watermark
//!
//! The highest epoch up to which a container's stripes have been fully
//! aggregated. Advanced only after a traversal that processed every stripe
//! without error, so a failed or aborted pass leaves the window open and
//! the next run retries the same stripes.

use dashmap::DashMap;

use crate::layout::{ContainerId, Epoch};

/// Process-wide registry of last-aggregated epochs, keyed by container.
#[derive(Debug, Default)]
pub struct WatermarkRegistry {
    marks: DashMap<ContainerId, Epoch>,
}

impl WatermarkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last fully aggregated epoch for a container, if any pass completed.
    pub fn last_aggregated(&self, container: ContainerId) -> Option<Epoch> {
        self.marks.get(&container).map(|e| *e)
    }

    /// Advance the watermark; never moves backwards.
    pub fn advance(&self, container: ContainerId, epoch: Epoch) {
        self.marks
            .entry(container)
            .and_modify(|e| *e = (*e).max(epoch))
            .or_insert(epoch);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_monotonic() {
        let reg = WatermarkRegistry::new();
        let cont = ContainerId(7);
        assert_eq!(reg.last_aggregated(cont), None);

        reg.advance(cont, 10);
        assert_eq!(reg.last_aggregated(cont), Some(10));

        reg.advance(cont, 5);
        assert_eq!(reg.last_aggregated(cont), Some(10));

        reg.advance(cont, 12);
        assert_eq!(reg.last_aggregated(cont), Some(12));
    }
}
