//! Picks the single authoritative "result" metric for a row.

use adsync_core::{normalize_column_name, ActionEntry, FlatRow, NativeResult};

use crate::NormalizationRules;

const REACH_INDICATOR: &str = "reach";

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedResult {
    pub result: f64,
    pub indicator: Option<String>,
    pub value: f64,
}

impl ResolvedResult {
    fn zero() -> Self {
        Self {
            result: 0.0,
            indicator: None,
            value: 0.0,
        }
    }
}

pub struct ResultResolver<'r> {
    rules: &'r NormalizationRules,
}

impl<'r> ResultResolver<'r> {
    pub fn new(rules: &'r NormalizationRules) -> Self {
        Self { rules }
    }

    /// Never fails. `values` is the already-projected row, used to look up
    /// `<type>_catalog_value` before `<type>_value`.
    pub fn resolve(
        &self,
        objective: Option<&str>,
        actions: &[ActionEntry],
        reach: Option<f64>,
        native: &[NativeResult],
        values: &FlatRow,
    ) -> ResolvedResult {
        if let Some(first) = native.first() {
            return resolve_native(first, values);
        }

        let Some(objective) = objective else {
            return ResolvedResult::zero();
        };

        if self.rules.is_awareness(objective) {
            return ResolvedResult {
                result: finite_or_zero(reach.unwrap_or(0.0)),
                indicator: Some(REACH_INDICATOR.to_string()),
                value: 0.0,
            };
        }

        for candidate in self.rules.candidates(objective) {
            if let Some(entry) = actions.iter().find(|a| &a.action_type == candidate) {
                return ResolvedResult {
                    result: finite_or_zero(entry.value),
                    indicator: Some(format!("actions:{candidate}")),
                    value: lookup_value(values, candidate),
                };
            }
        }

        ResolvedResult::zero()
    }
}

fn resolve_native(first: &NativeResult, values: &FlatRow) -> ResolvedResult {
    // An entry without values is unusable as a whole.
    let Some(result) = first.value else {
        return ResolvedResult::zero();
    };
    let value = first
        .action_type()
        .map(|action_type| lookup_value(values, action_type))
        .unwrap_or(0.0);
    ResolvedResult {
        result: finite_or_zero(result),
        indicator: first.indicator.clone(),
        value,
    }
}

fn lookup_value(values: &FlatRow, action_type: &str) -> f64 {
    let column = normalize_column_name(action_type);
    let catalog = format!("{column}_catalog_value");
    if values.has_value(&catalog) {
        return values.number(&catalog);
    }
    values.number(&format!("{column}_value"))
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> NormalizationRules {
        NormalizationRules::builtin().unwrap()
    }

    #[test]
    fn sales_without_purchase_is_zero_not_clicks() {
        let rules = rules();
        let resolved = ResultResolver::new(&rules).resolve(
            Some("OUTCOME_SALES"),
            &[ActionEntry::new("link_click", 50.0)],
            None,
            &[],
            &FlatRow::new(),
        );
        assert_eq!(resolved.result, 0.0);
        assert_eq!(resolved.indicator, None);
    }

    #[test]
    fn sales_picks_first_candidate_present() {
        let rules = rules();
        let mut values = FlatRow::new();
        values.insert("omni_purchase_value", "120");
        let resolved = ResultResolver::new(&rules).resolve(
            Some("OUTCOME_SALES"),
            &[
                ActionEntry::new("omni_purchase", 3.0),
                ActionEntry::new("link_click", 50.0),
            ],
            None,
            &[],
            &values,
        );
        assert_eq!(resolved.result, 3.0);
        assert_eq!(resolved.indicator.as_deref(), Some("actions:omni_purchase"));
        assert_eq!(resolved.value, 120.0);
    }

    #[test]
    fn native_result_prefers_catalog_value() {
        let rules = rules();
        let mut values = FlatRow::new();
        values.insert("omni_purchase_catalog_value", "140");
        values.insert("omni_purchase_value", "90");
        let native = [NativeResult::new(Some("actions:omni_purchase"), Some(7.0))];
        let resolved = ResultResolver::new(&rules).resolve(
            Some("OUTCOME_TRAFFIC"),
            &[ActionEntry::new("link_click", 50.0)],
            None,
            &native,
            &values,
        );
        assert_eq!(resolved.result, 7.0);
        assert_eq!(resolved.indicator.as_deref(), Some("actions:omni_purchase"));
        assert_eq!(resolved.value, 140.0);

        values.remove("omni_purchase_catalog_value");
        let resolved = ResultResolver::new(&rules).resolve(None, &[], None, &native, &values);
        assert_eq!(resolved.value, 90.0);
    }

    #[test]
    fn native_indicator_with_dotted_type_maps_to_column() {
        let rules = rules();
        let mut values = FlatRow::new();
        values.insert("offsite_conversion_fb_pixel_purchase_value", 55.0);
        let native = [NativeResult::new(
            Some("actions:offsite_conversion.fb_pixel_purchase"),
            Some(2.0),
        )];
        let resolved = ResultResolver::new(&rules).resolve(None, &[], None, &native, &values);
        assert_eq!(resolved.value, 55.0);
    }

    #[test]
    fn awareness_ignores_actions() {
        let rules = rules();
        let resolver = ResultResolver::new(&rules);
        let actions = [ActionEntry::new("omni_purchase", 9.0)];
        let resolved = resolver.resolve(Some("REACH"), &actions, Some(1200.0), &[], &FlatRow::new());
        assert_eq!(resolved.result, 1200.0);
        assert_eq!(resolved.indicator.as_deref(), Some("reach"));

        let missing = resolver.resolve(Some("OUTCOME_AWARENESS"), &actions, None, &[], &FlatRow::new());
        assert_eq!(missing.result, 0.0);
    }

    #[test]
    fn unknown_objective_and_malformed_native_are_zero() {
        let rules = rules();
        let resolver = ResultResolver::new(&rules);
        let actions = [ActionEntry::new("link_click", 50.0)];
        assert_eq!(
            resolver.resolve(Some("SOMETHING_NEW"), &actions, None, &[], &FlatRow::new()),
            ResolvedResult::zero()
        );
        let malformed = [NativeResult::new(Some("actions:omni_purchase"), None)];
        assert_eq!(
            resolver.resolve(Some("OUTCOME_SALES"), &actions, None, &malformed, &FlatRow::new()),
            ResolvedResult::zero()
        );
    }
}
