//! Ordered acquire/release bookkeeping for remote resources.
//!
//! An acquisition chain moves through its stages in strict order and may die
//! at any of them. The ledger records which stages actually succeeded so that
//! teardown releases exactly those, in exact reverse order, each at most once.
//! Releasing a handle that was never valid is as much a bug as leaking one
//! that was.

/// Per-stage success flags for one acquisition chain.
#[derive(Debug, Default)]
pub struct StageLedger {
    stages: Vec<(&'static str, bool)>,
}

impl StageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of an acquisition stage, in acquisition order.
    pub fn record(&mut self, stage: &'static str, acquired: bool) {
        self.stages.push((stage, acquired));
    }

    /// Whether a stage was recorded as acquired (and not yet released).
    pub fn acquired(&self, stage: &str) -> bool {
        self.stages
            .iter()
            .any(|(name, ok)| *name == stage && *ok)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Visit the acquired stages in reverse acquisition order, clearing each
    /// flag as it is visited so a second teardown pass releases nothing.
    pub fn release_in_reverse(&mut self, mut release: impl FnMut(&'static str)) {
        for (name, ok) in self.stages.iter_mut().rev() {
            if std::mem::take(ok) {
                release(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn releases_only_acquired_stages_in_reverse() {
        let mut ledger = StageLedger::new();
        ledger.record("init", true);
        ledger.record("reserve", true);
        ledger.record("start", false);

        let mut released = Vec::new();
        ledger.release_in_reverse(|stage| released.push(stage));
        assert_eq!(released, vec!["reserve", "init"]);
    }

    #[test]
    fn failed_stage_two_releases_stage_one_only() {
        let mut ledger = StageLedger::new();
        ledger.record("init", true);
        ledger.record("reserve", false);

        let mut released = Vec::new();
        ledger.release_in_reverse(|stage| released.push(stage));
        assert_eq!(released, vec!["init"]);
    }

    #[test]
    fn release_runs_at_most_once() {
        let mut ledger = StageLedger::new();
        ledger.record("init", true);

        let mut count = 0;
        ledger.release_in_reverse(|_| count += 1);
        ledger.release_in_reverse(|_| count += 1);
        assert_eq!(count, 1);
    }

    #[test]
    fn acquired_reflects_recorded_flags() {
        let mut ledger = StageLedger::new();
        assert!(ledger.is_empty());
        ledger.record("init", true);
        ledger.record("reserve", false);
        assert!(ledger.acquired("init"));
        assert!(!ledger.acquired("reserve"));
        assert!(!ledger.acquired("start"));
        assert_eq!(ledger.len(), 2);
    }
}
