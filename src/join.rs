//! Match boundary features to CSV records
//!
//! Each feature is matched to at most one record. Identifier fields are tried
//! in the level's priority order and each field's value through its
//! normalization variants; the first hit wins. County boundaries fall back to a
//! cleaned-name lookup when no identifier matches.

use geojson::{Feature, FeatureCollection, JsonObject};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::csv_input::CsvRow;
use crate::error::JoinError;
use crate::normalize::{county_name_keys, id_variants, parse_number, property_key};
use crate::types::{GeographyLevel, MissingValuePolicy};

/// Property added to every merged feature
pub const VALUE_PROPERTY: &str = "choropleth_value";

const COUNTY_NAME_FIELDS: &[&str] = &["NAME", "COUNTY", "COUNTYNAME", "COUNTY_NAME", "NAMELSAD"];
const SAMPLE_CSV_KEYS: usize = 3;
const SAMPLE_UNMATCHED: usize = 5;

#[derive(Debug, Clone)]
pub struct JoinOptions<'a> {
    pub level: GeographyLevel,
    pub join_column: &'a str,
    pub data_column: &'a str,
    pub missing_values: MissingValuePolicy,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinReport {
    pub matched: usize,
    pub unmatched: usize,
    /// Matches that came from the county-name fallback
    pub matched_by_name: usize,
    /// Matched records whose data value did not parse as a number
    pub unparseable_values: usize,
    pub sample_unmatched: Vec<String>,
}

impl JoinReport {
    pub fn total(&self) -> usize {
        self.matched + self.unmatched
    }
}

#[derive(Debug, Clone)]
pub struct JoinOutput {
    pub merged: FeatureCollection,
    pub report: JoinReport,
}

/// Lookup tables for one join run
struct CsvLookup<'r> {
    by_id: HashMap<String, &'r CsvRow>,
    by_name: HashMap<String, &'r CsvRow>,
    sample_keys: Vec<String>,
}

impl<'r> CsvLookup<'r> {
    fn build(records: &'r [CsvRow], join_column: &str, level: GeographyLevel) -> Self {
        let mut by_id = HashMap::new();
        let mut by_name = HashMap::new();
        let mut sample_keys = Vec::new();

        let keyed: Vec<(String, &CsvRow)> = records
            .iter()
            .filter_map(|r| {
                let key = r.get(join_column)?.trim().to_string();
                (!key.is_empty()).then_some((key, r))
            })
            .collect();

        for (key, row) in &keyed {
            if sample_keys.len() < SAMPLE_CSV_KEYS && !sample_keys.contains(key) {
                sample_keys.push(key.clone());
            }
            by_id.insert(key.clone(), *row);

            if level == GeographyLevel::County && parse_number(key).is_none() {
                for name_key in county_name_keys(key) {
                    by_name.insert(name_key, *row);
                }
            }
        }

        // Variant keys never shadow a literal key
        for (key, row) in &keyed {
            for variant in id_variants(key, level) {
                by_id.entry(variant).or_insert(*row);
            }
        }

        Self {
            by_id,
            by_name,
            sample_keys,
        }
    }

    fn match_id(&self, props: &JsonObject, level: GeographyLevel) -> Option<&'r CsvRow> {
        for field in level.id_fields() {
            let Some(id) = props.get(*field).and_then(property_key) else {
                continue;
            };
            for variant in id_variants(&id, level) {
                if let Some(row) = self.by_id.get(&variant) {
                    return Some(*row);
                }
            }
        }
        None
    }

    fn match_name(&self, props: &JsonObject) -> Option<&'r CsvRow> {
        if self.by_name.is_empty() {
            return None;
        }
        for field in COUNTY_NAME_FIELDS {
            let Some(Value::String(name)) = props.get(*field) else {
                continue;
            };
            for key in county_name_keys(name) {
                if let Some(row) = self.by_name.get(&key) {
                    debug!(name = %key, "matched county by name");
                    return Some(*row);
                }
            }
        }
        None
    }
}

fn describe_ids(props: &JsonObject, level: GeographyLevel) -> String {
    level
        .id_fields()
        .iter()
        .filter_map(|f| props.get(*f).and_then(property_key).map(|v| format!("{}={}", f, v)))
        .collect::<Vec<_>>()
        .join(", ")
}

fn merge_feature(
    feature: &Feature,
    record: &CsvRow,
    options: &JoinOptions<'_>,
    report: &mut JoinReport,
) -> Feature {
    let mut properties = feature.properties.clone().unwrap_or_default();
    for (k, v) in record {
        properties.insert(k.clone(), Value::String(v.clone()));
    }

    let raw = record.get(options.data_column).map(String::as_str).unwrap_or("");
    let value = match parse_number(raw) {
        Some(v) => serde_json::json!(v),
        None => {
            report.unparseable_values += 1;
            match options.missing_values {
                MissingValuePolicy::Zero => serde_json::json!(0.0),
                MissingValuePolicy::NoData => Value::Null,
            }
        }
    };
    properties.insert(VALUE_PROPERTY.to_string(), value);

    Feature {
        bbox: feature.bbox.clone(),
        geometry: feature.geometry.clone(),
        id: feature.id.clone(),
        properties: Some(properties),
        foreign_members: feature.foreign_members.clone(),
    }
}

/// Join CSV records (already aggregated to unique keys) onto boundary features
pub fn join(
    boundaries: &FeatureCollection,
    records: &[CsvRow],
    options: &JoinOptions<'_>,
) -> Result<JoinOutput, JoinError> {
    let lookup = CsvLookup::build(records, options.join_column, options.level);
    debug!(
        keys = lookup.by_id.len(),
        names = lookup.by_name.len(),
        sample = ?lookup.sample_keys,
        "built CSV lookup"
    );

    let mut report = JoinReport::default();
    let mut features = Vec::new();

    for feature in &boundaries.features {
        let empty = JsonObject::new();
        let props = feature.properties.as_ref().unwrap_or(&empty);

        let mut record = lookup.match_id(props, options.level);
        if record.is_none() && options.level == GeographyLevel::County {
            record = lookup.match_name(props);
            if record.is_some() {
                report.matched_by_name += 1;
            }
        }

        match record {
            Some(record) => {
                features.push(merge_feature(feature, record, options, &mut report));
                report.matched += 1;
            }
            None => {
                report.unmatched += 1;
                if report.sample_unmatched.len() < SAMPLE_UNMATCHED {
                    let ids = describe_ids(props, options.level);
                    if !ids.is_empty() {
                        report.sample_unmatched.push(ids);
                    }
                }
            }
        }
    }

    info!(
        matched = report.matched,
        unmatched = report.unmatched,
        by_name = report.matched_by_name,
        "joined CSV to {} boundaries",
        options.level
    );

    if report.matched == 0 {
        return Err(JoinError {
            level: options.level,
            join_column: options.join_column.to_string(),
            sample_csv_keys: lookup.sample_keys,
            sample_boundary_ids: report.sample_unmatched,
        });
    }

    if report.unparseable_values > 0 {
        warn!(
            count = report.unparseable_values,
            column = options.data_column,
            policy = options.missing_values.as_str(),
            "matched records with non-numeric data values"
        );
    }

    Ok(JoinOutput {
        merged: FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        },
        report,
    })
}
