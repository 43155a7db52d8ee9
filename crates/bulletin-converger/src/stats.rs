//! Per-pass counters.

use std::ops::AddAssign;

/// What one convergence pass (or a whole tick) did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvergeStats {
    pub tasks_failed: usize,
    pub tasks_kicked: usize,
    pub tasks_demoted: usize,
    pub tasks_expired: usize,
    pub lrps_demoted: usize,
    pub start_auctions_requested: usize,
    pub stop_auctions_requested: usize,
    pub stop_requests_sent: usize,
    pub actuals_deleted: usize,
    pub auctions_kicked: usize,
    pub auctions_expired: usize,
    pub evacuating_removed: usize,
    pub malformed_deleted: usize,
    /// Writes skipped because another actor changed the record first.
    pub conflicts: usize,
    /// Writes or cell requests that failed and will be retried next tick.
    pub failures: usize,
}

impl ConvergeStats {
    /// Total records written or deleted.
    pub fn writes(&self) -> usize {
        self.tasks_failed
            + self.tasks_kicked
            + self.tasks_demoted
            + self.tasks_expired
            + self.lrps_demoted
            + self.start_auctions_requested
            + self.stop_auctions_requested
            + self.actuals_deleted
            + self.auctions_kicked
            + self.auctions_expired
            + self.evacuating_removed
            + self.malformed_deleted
    }
}

impl AddAssign for ConvergeStats {
    fn add_assign(&mut self, other: Self) {
        self.tasks_failed += other.tasks_failed;
        self.tasks_kicked += other.tasks_kicked;
        self.tasks_demoted += other.tasks_demoted;
        self.tasks_expired += other.tasks_expired;
        self.lrps_demoted += other.lrps_demoted;
        self.start_auctions_requested += other.start_auctions_requested;
        self.stop_auctions_requested += other.stop_auctions_requested;
        self.stop_requests_sent += other.stop_requests_sent;
        self.actuals_deleted += other.actuals_deleted;
        self.auctions_kicked += other.auctions_kicked;
        self.auctions_expired += other.auctions_expired;
        self.evacuating_removed += other.evacuating_removed;
        self.malformed_deleted += other.malformed_deleted;
        self.conflicts += other.conflicts;
        self.failures += other.failures;
    }
}
