//! Post-flatten data quality checks.

use std::collections::BTreeMap;

use adsync_core::FlatRow;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PurchaseColumnStats {
    pub rows: usize,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QualitySummary {
    pub rows: usize,
    pub nonzero_result_rows: usize,
    pub total_result: f64,
    pub rows_with_purchase_value: usize,
    pub total_purchase_value: f64,
    pub roas_rows: usize,
    pub average_roas: f64,
    pub max_roas: f64,
    pub total_spend: f64,
    pub rows_with_spend: usize,
    pub objectives: Vec<String>,
    pub result_by_objective: BTreeMap<String, f64>,
    pub spend_by_breakdown: BTreeMap<String, f64>,
    pub purchase_columns: BTreeMap<String, PurchaseColumnStats>,
    /// Result total equals the link-click total: clicks are probably being reported as results.
    pub result_matches_link_clicks: bool,
}

impl QualitySummary {
    pub fn from_rows(rows: &[FlatRow], breakdowns: &[String], purchase_columns: &[String]) -> Self {
        let mut summary = Self {
            rows: rows.len(),
            ..Default::default()
        };
        let mut roas_sum = 0.0;
        let mut link_clicks: Option<f64> = None;

        for row in rows {
            let result = row.number("result");
            if result != 0.0 {
                summary.nonzero_result_rows += 1;
            }
            summary.total_result += result;

            let purchase = row.number("total_purchase_value");
            if purchase > 0.0 {
                summary.rows_with_purchase_value += 1;
            }
            summary.total_purchase_value += purchase;

            let roas = row.number("calculated_roas");
            if roas > 0.0 {
                summary.roas_rows += 1;
                roas_sum += roas;
                summary.max_roas = summary.max_roas.max(roas);
            }

            let spend = row.number("spend");
            if spend > 0.0 {
                summary.rows_with_spend += 1;
            }
            summary.total_spend += spend;

            if row.get("link_click").is_some() {
                *link_clicks.get_or_insert(0.0) += row.number("link_click");
            }

            let objective = row.text("objective").unwrap_or("UNKNOWN").to_string();
            *summary.result_by_objective.entry(objective).or_default() += result;

            if !breakdowns.is_empty() {
                let key = breakdowns
                    .iter()
                    .map(|b| row.get(b).and_then(|v| v.render()).unwrap_or_else(|| "-".to_string()))
                    .collect::<Vec<_>>()
                    .join("/");
                *summary.spend_by_breakdown.entry(key).or_default() += spend;
            }

            for column in purchase_columns {
                let value = row.number(column);
                if value > 0.0 {
                    let stats = summary.purchase_columns.entry(column.clone()).or_default();
                    stats.rows += 1;
                    stats.total += value;
                }
            }
        }

        summary.objectives = summary.result_by_objective.keys().cloned().collect();
        if summary.roas_rows > 0 {
            summary.average_roas = roas_sum / summary.roas_rows as f64;
        }
        summary.result_matches_link_clicks = link_clicks
            .is_some_and(|clicks| clicks > 0.0 && (summary.total_result - clicks).abs() < 0.01);
        summary
    }

    pub fn log(&self, table: &str) {
        info!(
            table,
            rows = self.rows,
            nonzero_results = self.nonzero_result_rows,
            total_result = self.total_result,
            purchase_rows = self.rows_with_purchase_value,
            total_purchase_value = self.total_purchase_value,
            roas_rows = self.roas_rows,
            average_roas = self.average_roas,
            max_roas = self.max_roas,
            total_spend = self.total_spend,
            objectives = ?self.objectives,
            "data quality summary"
        );
        if self.result_matches_link_clicks {
            warn!(table, total_result = self.total_result, "result total equals link_click total; results may be counting clicks");
        }
    }
}
