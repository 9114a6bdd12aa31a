//! The engine context: accessors, registries and every category catalog.
//!
//! One context per process (or per test). Nothing in the engine is global;
//! code that needs a registry or a catalog reaches it through here.

use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::accessor::HostServices;
use super::catalog::Catalog;
use super::definitions::DefinitionLoader;
use super::error::{EngineError, EngineResult};
use super::filter::UnitFilter;
use super::registry::{DependencyRegistry, SpecializedStrategyRegistry};
use super::status::StatusBoard;
use super::types::{Category, ComplianceStatus, ExecutionTiming, PolicyKey, UnitOperation};
use super::unit::{PolicyUnit, VerifyOutcome};
use super::wmi::WmiVerification;

/// Matches the quick-search box: a handful of results, not a listing.
pub const DEFAULT_SEARCH_LIMIT: usize = 8;

/// What a category source may touch while its catalog is being built.
pub struct BuildScope<'a> {
    pub host: &'a HostServices,
    pub specialized: &'a SpecializedStrategyRegistry,
    pub dependencies: &'a DependencyRegistry,
}

/// Category-specific code: registrations plus hand-authored units.
///
/// `register` runs before any unit of the category is created and may run
/// again after a failed build, so it must be idempotent.
pub trait CategorySource: Send + Sync {
    fn category(&self) -> Category;

    fn register(&self, _scope: &BuildScope<'_>) -> EngineResult<()> {
        Ok(())
    }

    fn hand_authored(&self, _host: &HostServices) -> EngineResult<Vec<PolicyUnit>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Re-verify after a successful apply instead of assuming Applied
    pub verify_after_apply: bool,
}

pub struct EngineContext {
    host: HostServices,
    specialized: SpecializedStrategyRegistry,
    dependencies: DependencyRegistry,
    loader: DefinitionLoader,
    sources: HashMap<Category, Vec<Arc<dyn CategorySource>>>,
    catalogs: BTreeMap<Category, Catalog>,
    wmi_registered: OnceCell<()>,
    status: StatusBoard,
    options: EngineOptions,
}

impl EngineContext {
    pub fn new(host: HostServices, loader: DefinitionLoader) -> Self {
        Self {
            host,
            specialized: SpecializedStrategyRegistry::new(),
            dependencies: DependencyRegistry::new(),
            loader,
            sources: HashMap::new(),
            catalogs: Category::ALL.into_iter().map(|c| (c, Catalog::new(c))).collect(),
            wmi_registered: OnceCell::new(),
            status: StatusBoard::new(),
            options: EngineOptions::default(),
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_source(mut self, source: Arc<dyn CategorySource>) -> Self {
        self.sources.entry(source.category()).or_default().push(source);
        self
    }

    pub fn with_sources(self, sources: impl IntoIterator<Item = Arc<dyn CategorySource>>) -> Self {
        sources.into_iter().fold(self, |ctx, source| ctx.with_source(source))
    }

    pub fn host(&self) -> &HostServices {
        &self.host
    }

    pub fn specialized(&self) -> &SpecializedStrategyRegistry {
        &self.specialized
    }

    pub fn dependencies(&self) -> &DependencyRegistry {
        &self.dependencies
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Units of one category, building the catalog on first access.
    pub fn catalog(&self, category: Category) -> EngineResult<&[Arc<PolicyUnit>]> {
        let catalog = self
            .catalogs
            .get(&category)
            .ok_or_else(|| EngineError::Definition(format!("no catalog for {}", category)))?;
        catalog.get_or_build(|| self.build_category(category))
    }

    fn build_category(&self, category: Category) -> EngineResult<Vec<PolicyUnit>> {
        self.register_wmi_verifications()?;

        let sources = self.sources.get(&category).map(Vec::as_slice).unwrap_or_default();
        let scope = BuildScope {
            host: &self.host,
            specialized: &self.specialized,
            dependencies: &self.dependencies,
        };
        for source in sources {
            source.register(&scope)?;
        }

        let mut units = Vec::new();
        for definition in self.loader.load(category)? {
            units.push(PolicyUnit::from_definition(
                &definition,
                self.host.accessor.clone(),
            )?);
        }
        let declarative = units.len();
        for source in sources {
            units.extend(source.hand_authored(&self.host)?);
        }
        debug!(
            "{}: {} declarative, {} hand-authored units",
            category,
            declarative,
            units.len() - declarative
        );
        Ok(units)
    }

    fn register_wmi_verifications(&self) -> EngineResult<()> {
        self.wmi_registered
            .get_or_try_init(|| {
                let definitions = self.loader.load_wmi_verifications()?;
                for definition in &definitions {
                    self.specialized.register_verification(
                        definition.key(),
                        Arc::new(WmiVerification::new(self.host.clone(), definition.clone())),
                    );
                }
                info!("Registered {} WMI-backed verifications", definitions.len());
                Ok(())
            })
            .map(|_| ())
    }

    /// Every unit across all categories, in category order.
    pub fn all_units(&self) -> EngineResult<Vec<Arc<PolicyUnit>>> {
        self.select(&UnitFilter::all())
    }

    /// Units matching `filter`, in category order. Only the categories the
    /// filter names are built.
    pub fn select(&self, filter: &UnitFilter) -> EngineResult<Vec<Arc<PolicyUnit>>> {
        let mut out = Vec::new();
        for category in filter.scoped_categories() {
            out.extend(
                self.catalog(category)?
                    .iter()
                    .filter(|u| filter.matches(u))
                    .cloned(),
            );
        }
        Ok(out)
    }

    pub fn find(&self, id: Uuid) -> EngineResult<Arc<PolicyUnit>> {
        self.all_units()?
            .into_iter()
            .find(|u| u.id() == id)
            .ok_or_else(|| EngineError::UnknownUnit(id.to_string()))
    }

    /// Resolve a unit by id or by exact (case-insensitive) name.
    pub fn lookup(&self, needle: &str) -> EngineResult<Arc<PolicyUnit>> {
        if let Ok(id) = Uuid::parse_str(needle.trim()) {
            return self.find(id);
        }
        let mut matches: Vec<_> = self
            .all_units()?
            .into_iter()
            .filter(|u| u.name().eq_ignore_ascii_case(needle.trim()))
            .collect();
        match matches.len() {
            0 => Err(EngineError::UnknownUnit(needle.to_string())),
            1 => Ok(matches.remove(0)),
            n => Err(EngineError::UnknownUnit(format!(
                "'{}' is ambiguous ({} units share that name, use the id)",
                needle, n
            ))),
        }
    }

    /// Quick search across every catalog.
    pub fn search(&self, query: &str, limit: usize) -> EngineResult<Vec<Arc<PolicyUnit>>> {
        Ok(self
            .all_units()?
            .into_iter()
            .filter(|u| u.matches_query(query))
            .take(limit)
            .collect())
    }

    pub fn find_by_key(&self, key: &PolicyKey) -> EngineResult<Option<Arc<PolicyUnit>>> {
        Ok(self
            .all_units()?
            .into_iter()
            .find(|u| u.policy_key() == Some(key)))
    }

    /// Units that must accompany `unit` for an operation at `timing`,
    /// excluding the keys in `skip`. Dependents with no unit in any
    /// catalog are dropped.
    pub fn dependency_units(
        &self,
        unit: &PolicyUnit,
        operation: UnitOperation,
        timing: ExecutionTiming,
        skip: &HashSet<PolicyKey>,
    ) -> EngineResult<Vec<Arc<PolicyUnit>>> {
        let Some(key) = unit.policy_key() else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for dependent in self.dependencies.resolve(key, operation, timing, skip) {
            match self.find_by_key(&dependent)? {
                Some(dep) => out.push(dep),
                None => debug!("No unit manages dependent policy {}", dependent),
            }
        }
        Ok(out)
    }

    pub fn apply_unit(&self, unit: &PolicyUnit) -> EngineResult<ComplianceStatus> {
        match unit.apply(&self.specialized) {
            Ok(()) => {
                let status = if self.options.verify_after_apply {
                    unit.verify(&self.specialized).status
                } else {
                    ComplianceStatus::Applied
                };
                self.status.set(unit.id(), status);
                Ok(status)
            }
            Err(e) => {
                self.status.set(unit.id(), ComplianceStatus::Undetermined);
                Err(e)
            }
        }
    }

    pub fn verify_unit(&self, unit: &PolicyUnit) -> VerifyOutcome {
        let outcome = unit.verify(&self.specialized);
        self.status.set(unit.id(), outcome.status);
        outcome
    }

    pub fn remove_unit(&self, unit: &PolicyUnit) -> EngineResult<ComplianceStatus> {
        match unit.remove(&self.specialized) {
            Ok(()) => {
                self.status.set(unit.id(), ComplianceStatus::NotApplied);
                Ok(ComplianceStatus::NotApplied)
            }
            Err(e) => {
                self.status.set(unit.id(), ComplianceStatus::Undetermined);
                Err(e)
            }
        }
    }
}
