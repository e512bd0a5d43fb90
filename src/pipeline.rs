//! One mapping run from a parsed CSV to a classified FeatureCollection
//!
//! Each stage takes its inputs and returns a new value; nothing from a previous
//! run is kept around.

use geojson::FeatureCollection;
use tracing::{info, warn};

use crate::aggregate::{aggregate, AggregationMode};
use crate::classify::{check_class_count, classify, feature_values, value_stats, Classification, ValueStats};
use crate::csv_input::CsvTable;
use crate::detect::{detect_states, StateDetection, MAX_DETECTED_STATES};
use crate::error::{FetchError, InputError, MapError};
use crate::fetch::{BoundaryFetcher, StateFailure};
use crate::join::{join, JoinOptions, JoinReport};
use crate::normalize::parse_number;
use crate::states::{self, UsState};
use crate::types::{AggregationPolicy, ClassMethod, ColorScheme, GeographyLevel, MissingValuePolicy};

#[derive(Debug, Clone)]
pub struct MapRequest {
    pub level: GeographyLevel,
    pub join_column: String,
    pub data_column: String,
    /// USPS code, FIPS code or name; None fetches nationwide or by detected states
    pub state: Option<String>,
    pub class_count: usize,
    pub method: ClassMethod,
    pub scheme: ColorScheme,
    pub aggregation: AggregationPolicy,
    pub missing_values: MissingValuePolicy,
    pub max_detected_states: usize,
}

impl MapRequest {
    pub fn new(level: GeographyLevel, join_column: &str, data_column: &str) -> Self {
        Self {
            level,
            join_column: join_column.to_string(),
            data_column: data_column.to_string(),
            state: None,
            class_count: crate::classify::DEFAULT_CLASS_COUNT,
            method: ClassMethod::default(),
            scheme: ColorScheme::default(),
            aggregation: AggregationPolicy::default(),
            missing_values: MissingValuePolicy::default(),
            max_detected_states: MAX_DETECTED_STATES,
        }
    }
}

/// Which boundaries were requested
#[derive(Debug, Clone, PartialEq)]
pub enum FetchScope {
    Nationwide,
    State(&'static str),
    /// States inferred from the join column that yielded features
    Detected(Vec<&'static str>),
}

impl FetchScope {
    pub fn describe(&self) -> String {
        match self {
            FetchScope::Nationwide => "nationwide".to_string(),
            FetchScope::State(abbr) => abbr.to_string(),
            FetchScope::Detected(abbrs) => format!("detected: {}", abbrs.join(", ")),
        }
    }
}

#[derive(Debug)]
pub struct MapResult {
    /// Matched features only, each carrying `choropleth_value`
    pub merged: FeatureCollection,
    pub classification: Classification,
    pub join: JoinReport,
    pub aggregation: Option<AggregationMode>,
    pub duplicate_keys: usize,
    pub scope: FetchScope,
    /// Per-state failures of a detected-states fetch; never fatal on their own
    pub fetch_failures: Vec<StateFailure>,
    pub stats: Option<ValueStats>,
    pub zip_cleaned: usize,
}

/// County join values that look like names rather than FIPS codes
fn looks_like_county_names(table: &CsvTable, join_column: &str) -> bool {
    table
        .column_values(join_column)
        .next()
        .map(str::trim)
        .is_some_and(|v| parse_number(v).is_none() && v.chars().count() > 5)
}

/// Check selections against the CSV before anything is fetched
pub fn validate(table: &CsvTable, request: &MapRequest) -> Result<Option<&'static UsState>, InputError> {
    if request.join_column.trim().is_empty() {
        return Err(InputError::MissingField("join column"));
    }
    if request.data_column.trim().is_empty() {
        return Err(InputError::MissingField("data column"));
    }
    table.require_column(&request.join_column)?;
    table.require_column(&request.data_column)?;
    if table.rows.is_empty() {
        return Err(InputError::EmptyCsv);
    }

    let state = match request.state.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(states::resolve(s).ok_or_else(|| InputError::UnknownState(s.to_string()))?),
        None => None,
    };

    if request.level == GeographyLevel::County
        && state.is_none()
        && looks_like_county_names(table, &request.join_column)
    {
        return Err(InputError::CountyNamesNeedState);
    }

    Ok(state)
}

struct Fetched {
    boundaries: FeatureCollection,
    scope: FetchScope,
    failures: Vec<StateFailure>,
}

fn fetch_boundaries(
    table: &CsvTable,
    request: &MapRequest,
    state: Option<&'static UsState>,
    fetcher: &BoundaryFetcher<'_>,
) -> Result<Fetched, FetchError> {
    let level = request.level;

    if let Some(state) = state {
        return Ok(Fetched {
            boundaries: fetcher.fetch(level, Some(state))?,
            scope: FetchScope::State(state.abbr),
            failures: Vec::new(),
        });
    }

    let mut failures = Vec::new();
    if level == GeographyLevel::Zip || level.narrows_by_detected_states() {
        let values = table.column_values(&request.join_column);
        match detect_states(values, level, request.max_detected_states) {
            StateDetection::Narrowed(detected) => {
                let abbrs: Vec<&'static str> = detected.iter().map(|s| s.abbr).collect();
                info!("Detected {} states from the join column: {}", abbrs.len(), abbrs.join(", "));

                if level == GeographyLevel::Zip {
                    match fetcher.fetch_zip(&detected) {
                        Ok(boundaries) => {
                            return Ok(Fetched {
                                boundaries,
                                scope: FetchScope::Detected(abbrs),
                                failures,
                            })
                        }
                        Err(FetchError::Empty { .. }) => {
                            warn!("no ZIP boundaries in the detected states, keeping all");
                        }
                        Err(e) => return Err(e),
                    }
                } else {
                    let fold = fetcher.fetch_states(level, &detected);
                    if !fold.collection.features.is_empty() {
                        info!(
                            "Loaded {} {} features from {} states",
                            fold.collection.features.len(),
                            level,
                            fold.fetched.len()
                        );
                        return Ok(Fetched {
                            boundaries: fold.collection,
                            scope: FetchScope::Detected(fold.fetched),
                            failures: fold.failures,
                        });
                    }
                    warn!("no detected state yielded {} boundaries, fetching nationwide", level);
                    failures = fold.failures;
                }
            }
            StateDetection::CannotNarrow { distinct } => {
                info!(distinct, "cannot narrow the fetch by state, fetching nationwide");
            }
        }
    }

    Ok(Fetched {
        boundaries: fetcher.fetch(level, None)?,
        scope: FetchScope::Nationwide,
        failures,
    })
}

/// Validate, fetch boundaries, aggregate duplicates, join and classify
pub fn process(
    mut table: CsvTable,
    request: &MapRequest,
    fetcher: &BoundaryFetcher<'_>,
) -> Result<MapResult, MapError> {
    let state = validate(&table, request)?;
    check_class_count(request.class_count, request.scheme)?;

    let zip_cleaned = if request.level == GeographyLevel::Zip {
        let n = table.normalize_zip_column(&request.join_column);
        if n > 0 {
            info!("Normalized {} ZIP values in '{}'", n, request.join_column);
        }
        n
    } else {
        0
    };

    let fetched = fetch_boundaries(&table, request, state, fetcher)?;
    info!(
        "Fetched {} {} boundaries ({})",
        fetched.boundaries.features.len(),
        request.level,
        fetched.scope.describe()
    );

    let aggregated = aggregate(
        &table.rows,
        request.level,
        &request.join_column,
        &request.data_column,
        request.aggregation,
    );

    let options = JoinOptions {
        level: request.level,
        join_column: &request.join_column,
        data_column: &request.data_column,
        missing_values: request.missing_values,
    };
    let joined = join(&fetched.boundaries, &aggregated.records, &options)?;

    let values = feature_values(&joined.merged);
    let classification = classify(&values, request.class_count, request.method, request.scheme)?;
    let stats = value_stats(&values);

    Ok(MapResult {
        merged: joined.merged,
        classification,
        join: joined.report,
        aggregation: aggregated.mode,
        duplicate_keys: aggregated.duplicate_keys,
        scope: fetched.scope,
        fetch_failures: fetched.failures,
        stats,
        zip_cleaned,
    })
}
