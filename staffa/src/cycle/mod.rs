//! The computation cycle boundary.
//!
//! A cycle evaluates everything a view outputs and returns a full snapshot.
//! The scheduler never looks inside a cycle: it only needs to re-run it on
//! demand, and a single failed run must leave the cycle usable for the next
//! trigger.

use std::sync::Arc;

use anyhow::Result;
use time::OffsetDateTime;

use crate::input::hestia::Hestia;
use crate::result::{CycleId, OutputKey, ResultModel};

pub trait ComputationCycle: Send + Sync + 'static {
    /// The output keys this cycle computes values for.
    fn output_keys(&self) -> Vec<OutputKey>;

    /// Evaluates the dependency graph once and returns the full snapshot.
    fn run(&self, cycle_id: CycleId) -> Result<ResultModel>;
}

/// Cycle that snapshots the last known value of every symbol in a [Hestia]
/// table. Used by the bundled server and throughout the tests.
pub struct SnapshotCycle {
    source: Arc<Hestia>,
}

impl SnapshotCycle {
    pub fn new(source: Arc<Hestia>) -> Self {
        Self { source }
    }
}

impl ComputationCycle for SnapshotCycle {
    fn output_keys(&self) -> Vec<OutputKey> {
        self.source.symbols()
    }

    fn run(&self, cycle_id: CycleId) -> Result<ResultModel> {
        let values = self.source.snapshot();
        let computed_at = OffsetDateTime::now_utc().unix_timestamp();
        Ok(ResultModel::new(cycle_id, computed_at, values))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{ComputationCycle, SnapshotCycle};
    use crate::input::hestia::Hestia;

    #[test]
    fn snapshot_cycle_reflects_the_source() {
        let source = Arc::new(Hestia::new());
        source.set("p1", 1.0);
        source.set("p2", 2.0);

        let cycle = SnapshotCycle::new(source.clone());
        let result = cycle.run(0).unwrap();
        assert_eq!(result.get("p1"), Some(1.0));
        assert_eq!(result.get("p2"), Some(2.0));

        source.set("p1", 3.0);
        let result = cycle.run(1).unwrap();
        assert_eq!(result.get("p1"), Some(3.0));
        assert_eq!(result.cycle_id, 1);
    }
}
