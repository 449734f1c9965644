//! Category and code lookup for new resources
//!
//! Workflows never build codings from free text: every category and code a caller names is
//! resolved through a [`CodeResolver`], which rejects anything it does not know.

use crate::error::{Error, Result};
use crate::fhir::system;
use serde::Deserialize;
use std::collections::HashMap;
use tandem_models::Coding;

pub trait CodeResolver: Send + Sync {
    /// Coding for an SDOH category such as `housing-instability`.
    fn resolve_category(&self, category: &str) -> Result<Coding>;

    /// Coding for `code` in `system`, restricted to what `category` allows on `resource_type`.
    fn resolve_code(
        &self,
        category: &str,
        resource_type: &str,
        system: &str,
        code: &str,
    ) -> Result<Coding>;
}

type CodeKey = (String, String, String, String);

/// Resolver over a fixed mapping table.
#[derive(Debug, Clone, Default)]
pub struct StaticCodeResolver {
    categories: HashMap<String, Coding>,
    codes: HashMap<CodeKey, Coding>,
}

impl StaticCodeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_category(mut self, category: &str, display: &str) -> Self {
        self.categories.insert(
            category.to_string(),
            Coding::new(system::SDOH_CATEGORY, category).with_display(display),
        );
        self
    }

    pub fn with_code(
        mut self,
        category: &str,
        resource_type: &str,
        system: &str,
        code: &str,
        display: &str,
    ) -> Self {
        self.codes.insert(
            (
                category.to_string(),
                resource_type.to_string(),
                system.to_string(),
                code.to_string(),
            ),
            Coding::new(system, code).with_display(display),
        );
        self
    }

    /// Load a mapping file.
    ///
    /// ```json
    /// { "housing-instability": {
    ///     "display": "Housing Instability",
    ///     "codes": { "Condition": { "http://snomed.info/sct": [
    ///         { "code": "1156191002", "display": "Housing instability (finding)" } ] } } } }
    /// ```
    pub fn from_json_str(raw: &str) -> serde_json::Result<Self> {
        let file: HashMap<String, CategoryMapping> = serde_json::from_str(raw)?;
        let mut resolver = Self::new();
        for (category, mapping) in file {
            resolver = resolver.with_category(&category, &mapping.display);
            for (resource_type, systems) in mapping.codes {
                for (system, codes) in systems {
                    for entry in codes {
                        resolver = resolver.with_code(
                            &category,
                            &resource_type,
                            &system,
                            &entry.code,
                            &entry.display,
                        );
                    }
                }
            }
        }
        Ok(resolver)
    }

    /// The SDOH categories the exchange ships with.
    pub fn sdoh_defaults() -> Self {
        Self::new()
            .with_category("housing-instability", "Housing Instability")
            .with_code(
                "housing-instability",
                "Condition",
                system::ICD_10,
                "Z59.0",
                "Homelessness",
            )
            .with_code(
                "housing-instability",
                "Condition",
                system::SNOMED,
                "1156191002",
                "Housing instability (finding)",
            )
            .with_category("food-insecurity", "Food Insecurity")
            .with_code(
                "food-insecurity",
                "Condition",
                system::ICD_10,
                "Z59.4",
                "Lack of adequate food and safe drinking water",
            )
            .with_code(
                "food-insecurity",
                "Condition",
                system::SNOMED,
                "733423003",
                "Food insecurity (finding)",
            )
            .with_category("transportation-insecurity", "Transportation Insecurity")
            .with_code(
                "transportation-insecurity",
                "Condition",
                system::ICD_10,
                "Z59.82",
                "Transportation insecurity",
            )
            .with_code(
                "transportation-insecurity",
                "Condition",
                system::SNOMED,
                "713458007",
                "Lack of access to transportation (finding)",
            )
    }
}

#[derive(Debug, Deserialize)]
struct CategoryMapping {
    display: String,
    #[serde(default)]
    codes: HashMap<String, HashMap<String, Vec<CodeMapping>>>,
}

#[derive(Debug, Deserialize)]
struct CodeMapping {
    code: String,
    display: String,
}

impl CodeResolver for StaticCodeResolver {
    fn resolve_category(&self, category: &str) -> Result<Coding> {
        self.categories
            .get(category)
            .cloned()
            .ok_or_else(|| Error::UnknownCategory(category.to_string()))
    }

    fn resolve_code(
        &self,
        category: &str,
        resource_type: &str,
        system: &str,
        code: &str,
    ) -> Result<Coding> {
        let key = (
            category.to_string(),
            resource_type.to_string(),
            system.to_string(),
            code.to_string(),
        );
        self.codes.get(&key).cloned().ok_or_else(|| Error::UnknownCode {
            category: category.to_string(),
            resource_type: resource_type.to_string(),
            system: system.to_string(),
            code: code.to_string(),
        })
    }
}
