//! Per-category unit catalogs.

use once_cell::sync::OnceCell;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info};

use super::error::{EngineError, EngineResult};
use super::types::Category;
use super::unit::PolicyUnit;

/// The ordered units of one category, built on first access.
///
/// Concurrent first accesses block on the single builder and then all see
/// the same list. A failed build is not cached; the next access retries.
pub struct Catalog {
    category: Category,
    units: OnceCell<Vec<Arc<PolicyUnit>>>,
}

impl Catalog {
    pub fn new(category: Category) -> Self {
        Self {
            category,
            units: OnceCell::new(),
        }
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn is_built(&self) -> bool {
        self.units.get().is_some()
    }

    pub fn get_or_build(
        &self,
        build: impl FnOnce() -> EngineResult<Vec<PolicyUnit>>,
    ) -> EngineResult<&[Arc<PolicyUnit>]> {
        self.units
            .get_or_try_init(|| {
                debug!("Building {} catalog", self.category);
                let units = build()?;
                let mut seen = HashSet::with_capacity(units.len());
                for unit in &units {
                    if !seen.insert(unit.id()) {
                        return Err(EngineError::DuplicateUnit(unit.id()));
                    }
                }
                info!("{} catalog ready with {} units", self.category, units.len());
                Ok(units.into_iter().map(Arc::new).collect())
            })
            .map(Vec::as_slice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::strategy::{NoOp, Unverifiable};
    use std::sync::Barrier;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn unit(name: &str) -> PolicyUnit {
        PolicyUnit::builder(Category::LockScreen, name)
            .apply(NoOp)
            .verify(Unverifiable)
            .remove(NoOp)
            .build()
    }

    #[test]
    fn builds_once_and_keeps_order() {
        let catalog = Catalog::new(Category::LockScreen);
        let builds = AtomicUsize::new(0);
        let build = || {
            builds.fetch_add(1, Ordering::SeqCst);
            Ok(vec![unit("B"), unit("A")])
        };

        let first: Vec<String> = catalog
            .get_or_build(build)
            .unwrap()
            .iter()
            .map(|u| u.name().to_string())
            .collect();
        assert_eq!(first, vec!["B", "A"]);

        catalog.get_or_build(|| Ok(vec![unit("C")])).unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(catalog.get_or_build(|| Ok(Vec::new())).unwrap().len(), 2);
    }

    #[test]
    fn duplicate_ids_fail_the_build() {
        let catalog = Catalog::new(Category::LockScreen);
        let err = catalog
            .get_or_build(|| Ok(vec![unit("A"), unit("A")]))
            .unwrap_err();
        assert!(matches!(err, EngineError::DuplicateUnit(_)));
        assert!(!catalog.is_built());

        // Failed builds are retried
        assert_eq!(catalog.get_or_build(|| Ok(vec![unit("A")])).unwrap().len(), 1);
    }

    #[test]
    fn concurrent_first_access_builds_once() {
        let catalog = Arc::new(Catalog::new(Category::LockScreen));
        let builds = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = catalog.clone();
                let builds = builds.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    catalog
                        .get_or_build(|| {
                            builds.fetch_add(1, Ordering::SeqCst);
                            thread::sleep(std::time::Duration::from_millis(20));
                            Ok(vec![unit("A"), unit("B")])
                        })
                        .unwrap()
                        .iter()
                        .map(|u| u.id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}
