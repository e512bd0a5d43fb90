//! Collapse CSV rows that share a join key into one record

use std::collections::HashMap;
use tracing::info;

use crate::csv_input::CsvRow;
use crate::normalize::{format_number, grouping_key, parse_number};
use crate::types::{AggregationPolicy, GeographyLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregationMode {
    Sum,
    Count,
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMode::Sum => "sum",
            AggregationMode::Count => "count",
        }
    }
}

/// One record per distinct join key, in first-seen order
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationResult {
    pub records: Vec<CsvRow>,
    /// None when every key was already unique
    pub mode: Option<AggregationMode>,
    pub duplicate_keys: usize,
}

fn join_key(row: &CsvRow, join_column: &str, level: GeographyLevel) -> String {
    row.get(join_column)
        .map(|v| grouping_key(v, level))
        .unwrap_or_default()
}

/// Group rows by the normalized join key; each group keeps its first row's key
pub fn aggregate(
    rows: &[CsvRow],
    level: GeographyLevel,
    join_column: &str,
    data_column: &str,
    policy: AggregationPolicy,
) -> AggregationResult {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&CsvRow>> = HashMap::new();
    for row in rows {
        let key = join_key(row, join_column, level);
        groups
            .entry(key.clone())
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(row);
    }

    let duplicate_keys = groups.values().filter(|g| g.len() > 1).count();
    if duplicate_keys == 0 {
        return AggregationResult {
            records: rows.to_vec(),
            mode: None,
            duplicate_keys,
        };
    }

    let mode = match policy {
        AggregationPolicy::Sum => AggregationMode::Sum,
        AggregationPolicy::Count => AggregationMode::Count,
        AggregationPolicy::Auto => {
            let all_numeric = rows.iter().all(|r| {
                r.get(data_column)
                    .and_then(|v| parse_number(v))
                    .is_some()
            });
            if all_numeric {
                AggregationMode::Sum
            } else {
                AggregationMode::Count
            }
        }
    };

    let records = order
        .iter()
        .map(|key| {
            let group = &groups[key];
            let mut record = group[0].clone();
            let value = match mode {
                AggregationMode::Sum => {
                    let sum: f64 = group
                        .iter()
                        .filter_map(|r| r.get(data_column).and_then(|v| parse_number(v)))
                        .sum();
                    format_number(sum)
                }
                AggregationMode::Count => group.len().to_string(),
            };
            record.insert(data_column.to_string(), value);
            record
        })
        .collect::<Vec<_>>();

    info!(
        rows = rows.len(),
        keys = records.len(),
        duplicate_keys,
        mode = mode.as_str(),
        "aggregated duplicate join keys"
    );

    AggregationResult {
        records,
        mode: Some(mode),
        duplicate_keys,
    }
}
