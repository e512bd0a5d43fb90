//! CSV loading and column inspection

use regex::Regex;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::InputError;
use crate::normalize::{normalize_zip, parse_number};
use crate::types::GeographyLevel;

/// One CSV record, column name to raw string value
pub type CsvRow = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<CsvRow>,
}

impl CsvTable {
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, InputError> {
        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(reader);

        let headers: Vec<String> = rdr
            .headers()?
            .iter()
            .enumerate()
            .map(|(i, h)| {
                if i == 0 {
                    h.trim_start_matches('\u{feff}').to_string()
                } else {
                    h.to_string()
                }
            })
            .collect();

        let mut rows = Vec::new();
        for record in rdr.records() {
            let record = record?;
            let row: CsvRow = headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.clone(), record.get(i).unwrap_or("").to_string()))
                .collect();
            rows.push(row);
        }

        debug!(columns = headers.len(), rows = rows.len(), "parsed CSV");
        Ok(Self { headers, rows })
    }

    pub fn from_path(path: &Path) -> Result<Self, InputError> {
        let file = File::open(path).map_err(|e| InputError::Csv(csv::Error::from(e)))?;
        Self::from_reader(file)
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.headers.iter().any(|h| h == column)
    }

    pub fn require_column(&self, column: &str) -> Result<(), InputError> {
        if self.has_column(column) {
            Ok(())
        } else {
            Err(InputError::UnknownColumn {
                column: column.to_string(),
                available: self.headers.join(", "),
            })
        }
    }

    /// Raw values of one column, in row order
    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.rows
            .iter()
            .map(move |r| r.get(column).map(String::as_str).unwrap_or(""))
    }

    /// Rewrite a ZIP join column in place (padding, ZIP+4, spreadsheet artifacts)
    pub fn normalize_zip_column(&mut self, column: &str) -> usize {
        let mut changed = 0;
        for row in &mut self.rows {
            if let Some(value) = row.get_mut(column) {
                let zip = normalize_zip(value);
                if zip != *value {
                    *value = zip;
                    changed += 1;
                }
            }
        }
        changed
    }

    /// Columns whose non-empty values all parse as numbers
    pub fn numeric_columns(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|h| {
                let mut seen = false;
                for v in self.column_values(h) {
                    if v.trim().is_empty() {
                        continue;
                    }
                    if parse_number(v).is_none() {
                        return false;
                    }
                    seen = true;
                }
                seen
            })
            .cloned()
            .collect()
    }
}

/// A header that looks like a geographic join key
#[derive(Debug, Clone, PartialEq)]
pub struct JoinSuggestion {
    pub column: String,
    pub level: GeographyLevel,
    pub kind: &'static str,
    pub confidence: f32,
}

struct HeaderPattern {
    kind: &'static str,
    level: GeographyLevel,
    confidence: f32,
    pattern: &'static str,
}

const HEADER_PATTERNS: &[HeaderPattern] = &[
    HeaderPattern {
        kind: "ZIP code",
        level: GeographyLevel::Zip,
        confidence: 0.95,
        pattern: r"(?i)^(zip|zipcode|zip_code|postal|zcta|zcta5)$",
    },
    HeaderPattern {
        kind: "county FIPS",
        level: GeographyLevel::County,
        confidence: 0.9,
        pattern: r"(?i)^(fips|geoid|county_fips|cnty_fips|fips_code)$",
    },
    HeaderPattern {
        kind: "county name",
        level: GeographyLevel::County,
        confidence: 0.9,
        pattern: r"(?i)^(county|county_name|cnty|cnty_name)$",
    },
    HeaderPattern {
        kind: "census tract",
        level: GeographyLevel::Tract,
        confidence: 0.85,
        pattern: r"(?i)^(tract|tractce|census_tract|tract_id)$",
    },
    HeaderPattern {
        kind: "place",
        level: GeographyLevel::Place,
        confidence: 0.7,
        pattern: r"(?i)^(place|city|place_name|city_name|municipality|placefp|place_fips)$",
    },
];

fn header_patterns() -> &'static [(Regex, &'static HeaderPattern)] {
    static COMPILED: OnceLock<Vec<(Regex, &'static HeaderPattern)>> = OnceLock::new();
    COMPILED.get_or_init(|| {
        HEADER_PATTERNS
            .iter()
            .map(|p| (Regex::new(p.pattern).expect("static regex"), p))
            .collect()
    })
}

/// Suggest join columns from header names, best first
pub fn suggest_join_columns(table: &CsvTable) -> Vec<JoinSuggestion> {
    let mut suggestions = Vec::new();
    for header in &table.headers {
        for (re, p) in header_patterns() {
            if re.is_match(header.trim()) {
                suggestions.push(JoinSuggestion {
                    column: header.clone(),
                    level: p.level,
                    kind: p.kind,
                    confidence: p.confidence,
                });
            }
        }
    }
    suggestions.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    suggestions
}
