//! Infer which states a CSV covers from its join column

use std::collections::BTreeSet;
use tracing::debug;

use crate::normalize::{normalize_zip, zero_pad};
use crate::states::{self, UsState};
use crate::types::GeographyLevel;

/// Default cap on how many per-state fetches a detected set may fan out to
pub const MAX_DETECTED_STATES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum StateDetection {
    /// Distinct states found, ordered by FIPS code
    Narrowed(Vec<&'static UsState>),
    /// No states, or more than the cap; the caller fetches nationwide instead
    CannotNarrow { distinct: usize },
}

/// State FIPS prefix implied by a numeric FIPS-style identifier's length
fn state_fips_from_code(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() || !v.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let fips = match v.len() {
        // county
        4 | 5 => zero_pad(v, 5)[..2].to_string(),
        // place
        7 => v[..2].to_string(),
        // tract or county subdivision
        10 | 11 => v[..2].to_string(),
        _ => return None,
    };
    ("01"..="72").contains(&fips.as_str()).then_some(fips)
}

/// Distinct state FIPS codes seen in a join column
pub fn detect_state_fips<'a>(
    values: impl IntoIterator<Item = &'a str>,
    level: GeographyLevel,
) -> BTreeSet<String> {
    let mut found = BTreeSet::new();
    for value in values {
        let fips = if level == GeographyLevel::Zip {
            states::by_zip(&normalize_zip(value)).map(|s| s.fips.to_string())
        } else {
            state_fips_from_code(value)
        };
        if let Some(fips) = fips {
            found.insert(fips);
        }
    }
    found
}

/// Detect states and decide whether the fetch can be narrowed to them
pub fn detect_states<'a>(
    values: impl IntoIterator<Item = &'a str>,
    level: GeographyLevel,
    max_states: usize,
) -> StateDetection {
    let fips = detect_state_fips(values, level);
    debug!(level = %level, states = ?fips, "detected state FIPS codes");

    // 03, 07, 14 etc. are in range but unassigned
    let known: Vec<&'static UsState> = fips.iter().filter_map(|f| states::by_fips(f)).collect();

    if known.is_empty() || known.len() > max_states {
        StateDetection::CannotNarrow {
            distinct: known.len(),
        }
    } else {
        StateDetection::Narrowed(known)
    }
}
