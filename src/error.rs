//! Error taxonomy for a mapping run

use thiserror::Error;

use crate::types::GeographyLevel;

/// Problems with the user's selections, reported before any fetch
#[derive(Error, Debug)]
pub enum InputError {
    #[error("Please select all required fields (missing {0})")]
    MissingField(&'static str),

    #[error("Column '{column}' not found in CSV (available: {available})")]
    UnknownColumn { column: String, available: String },

    #[error("CSV has no data rows")]
    EmptyCsv,

    #[error(
        "State selection is REQUIRED when using county names to avoid ambiguity \
         (e.g., multiple Washington Counties exist)"
    )]
    CountyNamesNeedState,

    #[error("Unknown state '{0}'")]
    UnknownState(String),

    #[error("Failed to read CSV: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Request to {url} failed: {message}")]
    Network { url: String, message: String },

    #[error("HTTP {status} from {url}")]
    Status { url: String, status: u16 },

    #[error("Invalid boundary service URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Invalid JSON response from {source_name}: {message}")]
    Json { source_name: String, message: String },

    #[error("{source_name} reported an error: {message}")]
    Service { source_name: String, message: String },

    #[error("{source_name} returned no {level} features")]
    Empty {
        source_name: String,
        level: GeographyLevel,
    },

    #[error(
        "Unable to fetch {level} boundaries{scope}: primary ({primary}) and fallback ({fallback}) both failed"
    )]
    Exhausted {
        level: GeographyLevel,
        scope: String,
        primary: Box<FetchError>,
        fallback: Box<FetchError>,
    },
}

/// Zero boundaries matched the CSV; carries everything needed to diagnose the mismatch
#[derive(Error, Debug)]
#[error(
    "No matches found between your CSV and the {level} boundaries.\n\
     Your CSV column \"{join_column}\" contains values like: {}\n\
     Sample boundary identifiers: {}\n\
     Expected format for {level}: {}",
    .sample_csv_keys.join(", "),
    .sample_boundary_ids.join("; "),
    .level.expected_format()
)]
pub struct JoinError {
    pub level: GeographyLevel,
    pub join_column: String,
    pub sample_csv_keys: Vec<String>,
    pub sample_boundary_ids: Vec<String>,
}

#[derive(Error, Debug)]
pub enum ClassifyError {
    #[error("Class count must be between 1 and {max} for the {scheme} palette, got {requested}")]
    ClassCount {
        requested: usize,
        max: usize,
        scheme: &'static str,
    },
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No data to export")]
    NoData,

    #[error("Shapefile writer unavailable: {0}")]
    WriterUnavailable(String),

    #[error("Failed to write {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode shapefile: {0}")]
    Shapefile(String),

    #[error("Failed to serialize GeoJSON: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Everything a processing run can fail with, surfaced as one message
#[derive(Error, Debug)]
pub enum MapError {
    #[error(transparent)]
    Input(#[from] InputError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Join(#[from] JoinError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Export(#[from] ExportError),
}
