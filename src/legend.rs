//! CONL run report: legend, join counts and fetch outcome for one map
//!
//! Written next to the GeoJSON so a map can be re-rendered or audited without
//! re-running the join.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::classify::{feature_values, NO_DATA_COLOR};
use crate::normalize::format_number;
use crate::pipeline::{MapRequest, MapResult};

/// Trait for types that can be serialized to CONL
pub trait ToConl {
    fn to_conl(&self) -> String;
}

/// Escape a string value if needed for CONL
fn escape_value(s: &str) -> String {
    if s.is_empty()
        || s.starts_with(' ')
        || s.ends_with(' ')
        || s.starts_with('"')
        || s.contains(';')
        || s.contains('=')
        || s.contains('\n')
        || s.contains('\r')
    {
        let escaped = s
            .replace('\\', "\\\\")
            .replace('"', "\\\"")
            .replace('\n', "\\n")
            .replace('\r', "\\r")
            .replace('\t', "\\t");
        format!("\"{}\"", escaped)
    } else {
        s.to_string()
    }
}

/// Borrowed view over a finished run
pub struct RunReport<'a> {
    pub generated: DateTime<Utc>,
    pub csv_file: &'a str,
    pub request: &'a MapRequest,
    pub result: &'a MapResult,
}

impl ToConl for RunReport<'_> {
    fn to_conl(&self) -> String {
        let request = self.request;
        let result = self.result;
        let mut lines = Vec::new();

        lines.push(format!(
            "generated = {}",
            self.generated.to_rfc3339_opts(SecondsFormat::Secs, true)
        ));
        lines.push(format!("csv = {}", escape_value(self.csv_file)));
        lines.push(format!("level = {}", request.level.as_str()));
        lines.push(format!("join_column = {}", escape_value(&request.join_column)));
        lines.push(format!("data_column = {}", escape_value(&request.data_column)));
        lines.push(format!("scope = {}", escape_value(&result.scope.describe())));

        if result.zip_cleaned > 0 {
            lines.push(format!("zip_values_cleaned = {}", result.zip_cleaned));
        }
        if let Some(mode) = result.aggregation {
            lines.push(format!("aggregation = {}", mode.as_str()));
            lines.push(format!("duplicate_keys = {}", result.duplicate_keys));
        }

        // Join
        lines.push("join".to_string());
        lines.push(format!("  matched = {}", result.join.matched));
        lines.push(format!("  unmatched = {}", result.join.unmatched));
        if result.join.matched_by_name > 0 {
            lines.push(format!("  matched_by_name = {}", result.join.matched_by_name));
        }
        if result.join.unparseable_values > 0 {
            lines.push(format!("  unparseable_values = {}", result.join.unparseable_values));
            lines.push(format!("  missing_values = {}", request.missing_values.as_str()));
        }

        if !result.fetch_failures.is_empty() {
            lines.push("fetch_failures".to_string());
            for failure in &result.fetch_failures {
                lines.push(format!(
                    "  {} = {}",
                    failure.state,
                    escape_value(&failure.error.to_string())
                ));
            }
        }

        if let Some(stats) = &result.stats {
            lines.push("stats".to_string());
            lines.push(format!("  count = {}", stats.count));
            lines.push(format!("  min = {}", format_number(stats.min)));
            lines.push(format!("  max = {}", format_number(stats.max)));
            lines.push(format!("  mean = {:.2}", stats.mean));
        }

        // Legend
        let c = &result.classification;
        lines.push("legend".to_string());
        lines.push(format!("  method = {}", c.method.as_str()));
        lines.push(format!("  scheme = {}", c.scheme.as_str()));
        if !c.breaks.is_empty() {
            lines.push("  breaks".to_string());
            for b in &c.breaks {
                lines.push(format!("    = {}", format_number(*b)));
            }
        }
        lines.push("  classes".to_string());
        let counts = c.class_counts(&feature_values(&result.merged));
        for ((label, color), count) in c.legend_entries().into_iter().zip(counts) {
            lines.push("    =".to_string());
            lines.push(format!("      label = {}", escape_value(&label)));
            lines.push(format!("      color = {}", color));
            lines.push(format!("      features = {}", count));
        }
        lines.push(format!("  no_data_color = {}", NO_DATA_COLOR));

        lines.join("\n") + "\n"
    }
}
