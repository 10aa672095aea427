use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::package::{Ecosystem, PackageVersion};

use super::{Action, AnalysisResult};

/// Process-wide cache of analysis results, shared between the guard pipeline
/// and all proxy interceptors.
///
/// Values are immutable once stored; readers receive the same [`Arc`] that a
/// later [`AnalysisCache::statistics`] enumeration observes. The cache is
/// unbounded and carries no TTL, its lifetime is the process.
#[derive(Debug, Clone, Default)]
pub struct AnalysisCache {
    inner: Arc<RwLock<HashMap<String, Arc<AnalysisResult>>>>,
}

/// Copy-out view over the cache contents.
#[derive(Debug, Clone, Default)]
pub struct CacheStatistics {
    pub total: usize,
    pub allowed: usize,
    pub confirm: usize,
    pub blocked: usize,
    pub entries: Vec<Arc<AnalysisResult>>,
}

impl AnalysisCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(ecosystem: &Ecosystem, name: &str, version: &str) -> String {
        format!("{ecosystem}:{name}:{version}")
    }

    pub fn get(&self, pkg: &PackageVersion) -> Option<Arc<AnalysisResult>> {
        self.get_coordinate(pkg.ecosystem(), pkg.name(), pkg.version())
    }

    pub fn get_coordinate(
        &self,
        ecosystem: &Ecosystem,
        name: &str,
        version: &str,
    ) -> Option<Arc<AnalysisResult>> {
        self.inner
            .read()
            .get(&Self::key(ecosystem, name, version))
            .cloned()
    }

    /// Store a result under its package coordinate, replacing any prior entry.
    pub fn set(&self, result: Arc<AnalysisResult>) {
        let key = result.package.cache_key();
        self.inner.write().insert(key, result);
    }

    pub fn has(&self, pkg: &PackageVersion) -> bool {
        self.inner.read().contains_key(&pkg.cache_key())
    }

    pub fn delete(&self, pkg: &PackageVersion) -> bool {
        self.inner.write().remove(&pkg.cache_key()).is_some()
    }

    pub fn clear(&self) {
        self.inner.write().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn statistics(&self) -> CacheStatistics {
        let guard = self.inner.read();
        let mut stats = CacheStatistics {
            total: guard.len(),
            ..Default::default()
        };
        for entry in guard.values() {
            match entry.action {
                Action::Allow => stats.allowed += 1,
                Action::Confirm => stats.confirm += 1,
                Action::Block => stats.blocked += 1,
                Action::Unknown => {}
            }
            stats.entries.push(entry.clone());
        }
        stats
    }
}
