//! One nested insights row in, one flat row out.

use adsync_core::{
    coerce_number, normalize_column_name, ActionEntry, FlatRow, NativeResult, RawInsightRow, Scalar,
};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::{NormalizationRules, ResultResolver};

const RESULTS_FIELD: &str = "results";
const COST_PER_RESULT_FIELD: &str = "cost_per_result";

pub struct Flattener {
    rules: NormalizationRules,
}

impl Flattener {
    pub fn new(rules: NormalizationRules) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &NormalizationRules {
        &self.rules
    }

    pub fn flatten_all<I>(&self, rows: I) -> Vec<FlatRow>
    where
        I: IntoIterator<Item = RawInsightRow>,
    {
        rows.into_iter().map(|row| self.flatten(&row)).collect()
    }

    /// Total: malformed entries contribute zero and never abort the row.
    pub fn flatten(&self, raw: &RawInsightRow) -> FlatRow {
        let mut row = FlatRow::new();

        for (field, value) in raw.fields() {
            if self.is_structured(field) {
                continue;
            }
            row.insert(normalize_column_name(field), Scalar::from_json(value));
        }

        let mut skipped = 0usize;
        for rule in &self.rules.projections {
            let Some(entries) = raw.get(&rule.field).and_then(JsonValue::as_array) else {
                continue;
            };
            for entry in entries {
                match ActionEntry::from_json(entry) {
                    Some(action) => {
                        let column = rule.column_for(&normalize_column_name(&action.action_type));
                        row.insert(column, action.value);
                    }
                    None => skipped += 1,
                }
            }
        }

        for (field, target) in &self.rules.collapse_fields {
            let Some(value) = raw.get(field) else {
                continue;
            };
            let collapsed = match value {
                // Last entry wins when the provider repeats the array.
                JsonValue::Array(entries) => match entries.last() {
                    Some(last) => last.get("value").map(coerce_number).unwrap_or(0.0),
                    None => continue,
                },
                JsonValue::Null => continue,
                other => coerce_number(other),
            };
            row.insert(normalize_column_name(target), collapsed);
        }

        row.insert(
            "cost_per_result_value",
            NativeResult::list_from_json(raw.get(COST_PER_RESULT_FIELD))
                .first()
                .and_then(|entry| entry.value)
                .unwrap_or(0.0),
        );

        let actions = ActionEntry::list_from_json(raw.get("actions"));
        let native = NativeResult::list_from_json(raw.get(RESULTS_FIELD));
        let reach = raw.get("reach").map(coerce_number);
        let resolved = ResultResolver::new(&self.rules).resolve(
            raw.str_field("objective"),
            &actions,
            reach,
            &native,
            &row,
        );
        row.insert("result", resolved.result);
        row.insert(
            "result_indicator",
            resolved.indicator.map(Scalar::Text).unwrap_or(Scalar::Absent),
        );
        row.insert("result_value", resolved.value);

        let total_purchase_value = self.total_purchase_value(&row);
        let spend = row.number("spend");
        let calculated_roas = if spend > 0.0 && total_purchase_value > 0.0 {
            total_purchase_value / spend
        } else {
            0.0
        };
        row.insert("total_purchase_value", total_purchase_value);
        row.insert("calculated_roas", calculated_roas);

        if skipped > 0 {
            debug!(
                ad_id = raw.str_field("ad_id").unwrap_or_default(),
                skipped, "ignored action entries without an action_type"
            );
        }
        row
    }

    /// Sum of the configured purchase-value columns; negative or non-numeric cells count as zero.
    pub fn total_purchase_value(&self, row: &FlatRow) -> f64 {
        self.rules
            .purchase_value_columns
            .iter()
            .map(|column| row.number(column).max(0.0))
            .sum()
    }

    fn is_structured(&self, field: &str) -> bool {
        field == RESULTS_FIELD
            || field == COST_PER_RESULT_FIELD
            || self.rules.projection_for(field).is_some()
            || self.rules.collapse_fields.contains_key(field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn flattener() -> Flattener {
        Flattener::new(NormalizationRules::builtin().unwrap())
    }

    fn raw(value: JsonValue) -> RawInsightRow {
        RawInsightRow::from_value(value).unwrap()
    }

    #[test]
    fn projects_every_array_with_its_suffix() {
        let row = flattener().flatten(&raw(json!({
            "ad_id": "9",
            "spend": "10",
            "actions": [{"action_type": "offsite_conversion.fb_pixel_purchase", "value": "4"}],
            "action_values": [{"action_type": "omni_purchase", "value": "80"}],
            "catalog_segment_actions": [{"action_type": "omni_purchase", "value": "2"}],
            "catalog_segment_value": [{"action_type": "omni_purchase", "value": "60"}],
            "cost_per_action_type": [{"action_type": "link_click", "value": "0.25"}],
            "purchase_roas": [{"action_type": "omni_purchase", "value": "1.5"}, {"action_type": "omni_purchase", "value": "2.5"}],
            "catalog_segment_value_omni_purchase_roas": [{"action_type": "omni_purchase", "value": "6"}],
            "cost_per_result": [{"indicator": "actions:link_click", "values": [{"value": "0.5"}]}]
        })));

        assert_eq!(row.number("offsite_conversion_fb_pixel_purchase"), 4.0);
        assert_eq!(row.number("omni_purchase_value"), 80.0);
        assert_eq!(row.number("omni_purchase_catalog"), 2.0);
        assert_eq!(row.number("omni_purchase_catalog_value"), 60.0);
        assert_eq!(row.number("cost_per_link_click"), 0.25);
        assert_eq!(row.number("purchase_roas"), 2.5);
        assert_eq!(row.number("catalog_segment_omni_purchase_roas"), 6.0);
        assert_eq!(row.number("cost_per_result_value"), 0.5);
        for gone in ["actions", "action_values", "cost_per_action_type", "results", "cost_per_result"] {
            assert!(row.get(gone).is_none(), "{gone} should be removed");
        }
        assert_eq!(row.number("total_purchase_value"), 140.0);
        assert_eq!(row.number("calculated_roas"), 14.0);
    }

    #[test]
    fn scenario_native_result_uses_catalog_value() {
        let row = flattener().flatten(&raw(json!({
            "objective": "OUTCOME_SALES",
            "results": [{"indicator": "actions:omni_purchase", "values": [{"value": "7"}]}],
            "omni_purchase_catalog_value": "140",
            "omni_purchase_value": "90"
        })));
        assert_eq!(row.number("result"), 7.0);
        assert_eq!(row.text("result_indicator"), Some("actions:omni_purchase"));
        assert_eq!(row.number("result_value"), 140.0);
    }

    #[test]
    fn scenario_sales_objective_table() {
        let flattener = flattener();
        let clicks_only = flattener.flatten(&raw(json!({
            "objective": "OUTCOME_SALES",
            "actions": [{"action_type": "link_click", "value": "50"}]
        })));
        assert_eq!(clicks_only.number("result"), 0.0);
        assert!(clicks_only.get("result_indicator").is_some());
        assert!(!clicks_only.has_value("result_indicator"));

        let with_purchase = flattener.flatten(&raw(json!({
            "objective": "OUTCOME_SALES",
            "actions": [
                {"action_type": "omni_purchase", "value": "3"},
                {"action_type": "link_click", "value": "50"}
            ]
        })));
        assert_eq!(with_purchase.number("result"), 3.0);
        assert_eq!(with_purchase.number("link_click"), 50.0);
    }

    #[test]
    fn awareness_rows_report_reach() {
        let row = flattener().flatten(&raw(json!({
            "objective": "OUTCOME_AWARENESS",
            "reach": "5000",
            "actions": [{"action_type": "omni_purchase", "value": "3"}]
        })));
        assert_eq!(row.number("result"), 5000.0);
        assert_eq!(row.text("result_indicator"), Some("reach"));
    }

    #[test]
    fn malformed_entries_degrade_to_zero() {
        let row = flattener().flatten(&raw(json!({
            "objective": "OUTCOME_SALES",
            "spend": "oops",
            "actions": [{"value": "9"}, "junk", {"action_type": "omni_purchase", "value": "NaN"}],
            "action_values": [{"action_type": "omni_purchase", "value": "-20"}],
            "results": [{"indicator": "actions:omni_purchase"}],
            "purchase_roas": []
        })));
        assert_eq!(row.number("omni_purchase"), 0.0);
        assert_eq!(row.number("result"), 0.0);
        assert_eq!(row.number("result_value"), 0.0);
        assert_eq!(row.number("total_purchase_value"), 0.0);
        assert_eq!(row.number("calculated_roas"), 0.0);
        assert!(row.get("purchase_roas").is_none());
    }

    #[test]
    fn unknown_arrays_become_json_text_and_names_are_safe() {
        let row = flattener().flatten(&raw(json!({
            "video_play_actions": [{"action_type": "video_view", "value": "3"}],
            "weird.name": "x",
            "account_id": "act_1"
        })));
        assert_eq!(
            row.text("video_play_actions"),
            Some(r#"[{"action_type":"video_view","value":"3"}]"#)
        );
        assert_eq!(row.text("weird_name"), Some("x"));
        assert_eq!(row.text("account_id"), Some("act_1"));
    }

    #[test]
    fn no_revenue_means_no_roas() {
        let row = flattener().flatten(&raw(json!({"spend": "25"})));
        assert_eq!(row.number("total_purchase_value"), 0.0);
        assert_eq!(row.number("calculated_roas"), 0.0);
        assert_eq!(row.number("cost_per_result_value"), 0.0);
    }
}
