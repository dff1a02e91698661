//! Objective-aware normalization of nested insights rows into flat rows.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

pub mod flatten;
pub mod resolver;

pub use flatten::Flattener;
pub use resolver::{ResolvedResult, ResultResolver};

pub const CRATE_NAME: &str = "adsync-normalize";

const BUILTIN_RULES: &str = include_str!("../rules/normalization.yaml");
const SUPPORTED_RULES_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum RulesError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {origin}: {source}")]
    Parse {
        origin: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid rules in {origin}: {message}")]
    Invalid { origin: String, message: String },
}

/// Array field projected into one column per entry: `{prefix}{action_type}{suffix}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectionRule {
    pub field: String,
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub suffix: String,
}

impl ProjectionRule {
    pub fn column_for(&self, normalized_type: &str) -> String {
        format!("{}{}{}", self.prefix, normalized_type, self.suffix)
    }
}

/// Versionable tables that drive result resolution and flattening.
#[derive(Debug, Clone, Deserialize)]
pub struct NormalizationRules {
    pub version: u32,
    #[serde(default)]
    pub awareness_objectives: Vec<String>,
    #[serde(default)]
    pub objective_results: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub purchase_value_columns: Vec<String>,
    #[serde(default)]
    pub projections: Vec<ProjectionRule>,
    #[serde(default)]
    pub collapse_fields: BTreeMap<String, String>,
}

impl NormalizationRules {
    /// Rules shipped with the crate.
    pub fn builtin() -> Result<Self, RulesError> {
        Self::from_yaml_str(BUILTIN_RULES, "builtin normalization rules")
    }

    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self, RulesError> {
        let rules: Self = serde_yaml::from_str(text).map_err(|source| RulesError::Parse {
            origin: origin.to_string(),
            source,
        })?;
        rules.validate(origin)?;
        Ok(rules)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RulesError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    /// `rules/normalization.yaml` under the workspace root when present, builtin rules otherwise.
    pub fn from_workspace_root(root: &Path) -> Result<Self, RulesError> {
        let path = root.join("rules").join("normalization.yaml");
        if path.exists() {
            Self::load(path)
        } else {
            Self::builtin()
        }
    }

    fn validate(&self, origin: &str) -> Result<(), RulesError> {
        let invalid = |message: String| RulesError::Invalid {
            origin: origin.to_string(),
            message,
        };
        if self.version != SUPPORTED_RULES_VERSION {
            return Err(invalid(format!(
                "unsupported version {} (expected {SUPPORTED_RULES_VERSION})",
                self.version
            )));
        }
        if let Some(rule) = self.projections.iter().find(|p| p.field.trim().is_empty()) {
            return Err(invalid(format!("projection with empty field: {rule:?}")));
        }
        if let Some((field, _)) = self
            .collapse_fields
            .iter()
            .find(|(field, target)| field.trim().is_empty() || target.trim().is_empty())
        {
            return Err(invalid(format!("collapse field {field:?} has an empty name or target")));
        }
        Ok(())
    }

    pub fn is_awareness(&self, objective: &str) -> bool {
        self.awareness_objectives.iter().any(|o| o == objective)
    }

    /// Candidate action types for an objective; empty for unknown objectives.
    pub fn candidates(&self, objective: &str) -> &[String] {
        self.objective_results
            .get(objective)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn projection_for(&self, field: &str) -> Option<&ProjectionRule> {
        self.projections.iter().find(|p| p.field == field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_rules_parse_and_cover_sales() {
        let rules = NormalizationRules::builtin().unwrap();
        assert_eq!(rules.candidates("OUTCOME_SALES")[0], "omni_purchase");
        assert!(rules.candidates("NOT_AN_OBJECTIVE").is_empty());
        assert!(rules.is_awareness("REACH"));
        assert_eq!(rules.purchase_value_columns.len(), 12);
        assert_eq!(
            rules.projection_for("cost_per_action_type").unwrap().column_for("link_click"),
            "cost_per_link_click"
        );
        assert_eq!(
            rules.collapse_fields.get("catalog_segment_value_omni_purchase_roas").map(String::as_str),
            Some("catalog_segment_omni_purchase_roas")
        );
    }

    #[test]
    fn rules_reject_unknown_versions() {
        let err = NormalizationRules::from_yaml_str("version: 7\n", "inline").unwrap_err();
        assert!(matches!(err, RulesError::Invalid { .. }));
    }

    #[test]
    fn override_rules_extend_objectives_without_code_changes() {
        let rules = NormalizationRules::from_yaml_str(
            "version: 1\nobjective_results:\n  OUTCOME_SALES: [custom_purchase]\n",
            "inline",
        )
        .unwrap();
        assert_eq!(rules.candidates("OUTCOME_SALES"), ["custom_purchase".to_string()]);
        assert!(rules.projections.is_empty());
    }

    #[test]
    fn missing_workspace_rules_fall_back_to_builtin() {
        let rules = NormalizationRules::from_workspace_root(Path::new("/definitely/not/here")).unwrap();
        assert!(!rules.objective_results.is_empty());
    }
}
