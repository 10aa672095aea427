use std::sync::Arc;

use parking_lot::Mutex;

use crate::package::PackageVersion;

/// Process-wide counters for firewall decisions.
///
/// Writers take the exclusive lock per record; [`StatsCollector::snapshot`]
/// copies everything out so readers never alias the guarded state.
#[derive(Debug, Clone, Default)]
pub struct StatsCollector {
    inner: Arc<Mutex<StatsInner>>,
}

#[derive(Debug, Default)]
struct StatsInner {
    allowed: u64,
    blocked: u64,
    confirmed: u64,
    declined: u64,
    blocked_packages: Vec<PackageVersion>,
}

/// Copied-out view of the collector state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub allowed: u64,
    pub blocked: u64,
    pub confirmed: u64,
    pub declined: u64,
    pub blocked_packages: Vec<PackageVersion>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allowed(&self) {
        self.inner.lock().allowed += 1;
    }

    pub fn record_blocked(&self, pkg: PackageVersion) {
        let mut inner = self.inner.lock();
        inner.blocked += 1;
        inner.blocked_packages.push(pkg);
    }

    pub fn record_confirmed(&self) {
        self.inner.lock().confirmed += 1;
    }

    pub fn record_declined(&self, pkg: PackageVersion) {
        let mut inner = self.inner.lock();
        inner.declined += 1;
        inner.blocked_packages.push(pkg);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        StatsSnapshot {
            allowed: inner.allowed,
            blocked: inner.blocked,
            confirmed: inner.confirmed,
            declined: inner.declined,
            blocked_packages: inner.blocked_packages.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::Ecosystem;

    #[test]
    fn test_snapshot_copies_state() {
        let stats = StatsCollector::new();
        stats.record_allowed();
        stats.record_allowed();
        stats.record_blocked(PackageVersion::new(Ecosystem::Npm, "evil", "1.0.0"));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.allowed, 2);
        assert_eq!(snapshot.blocked, 1);
        assert_eq!(snapshot.blocked_packages.len(), 1);

        // mutating after the snapshot does not alias into it
        stats.record_declined(PackageVersion::new(Ecosystem::PyPi, "worse", "2.0.0"));
        assert_eq!(snapshot.blocked_packages.len(), 1);
        assert_eq!(stats.snapshot().blocked_packages.len(), 2);
    }
}
