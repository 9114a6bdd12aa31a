use uuid::Uuid;

use super::types::{Category, DeviceIntent};
use super::unit::PolicyUnit;

/// Selection criteria for listing units and scoping bulk runs. Empty
/// criteria match everything; set criteria are combined with AND.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    pub categories: Vec<Category>,
    pub intent: Option<DeviceIntent>,
    pub query: Option<String>,
    pub ids: Vec<Uuid>,
}

impl UnitFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn category(mut self, category: Category) -> Self {
        self.categories.push(category);
        self
    }

    pub fn intent(mut self, intent: DeviceIntent) -> Self {
        self.intent = Some(intent);
        self
    }

    pub fn query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn id(mut self, id: Uuid) -> Self {
        self.ids.push(id);
        self
    }

    /// Categories whose catalogs need building to evaluate this filter.
    pub fn scoped_categories(&self) -> Vec<Category> {
        if self.categories.is_empty() {
            Category::ALL.to_vec()
        } else {
            Category::ALL
                .into_iter()
                .filter(|c| self.categories.contains(c))
                .collect()
        }
    }

    pub fn matches(&self, unit: &PolicyUnit) -> bool {
        if !self.categories.is_empty() && !self.categories.contains(&unit.category()) {
            return false;
        }
        if !self.ids.is_empty() && !self.ids.contains(&unit.id()) {
            return false;
        }
        if let Some(intent) = self.intent
            && !unit.matches_intent(intent)
        {
            return false;
        }
        match &self.query {
            Some(q) => unit.matches_query(q),
            None => true,
        }
    }
}
