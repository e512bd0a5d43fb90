//! Shared enums for geography levels and classification settings

use serde::{Deserialize, Serialize};

/// Geography level of the boundaries being joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeographyLevel {
    County,
    Subcounty,
    Zip,
    Tract,
    Place,
    State,
}

impl GeographyLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeographyLevel::County => "county",
            GeographyLevel::Subcounty => "subcounty",
            GeographyLevel::Zip => "zip",
            GeographyLevel::Tract => "tract",
            GeographyLevel::Place => "place",
            GeographyLevel::State => "state",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "county" | "counties" => Some(GeographyLevel::County),
            "subcounty" | "cousub" | "ccd" => Some(GeographyLevel::Subcounty),
            "zip" | "zcta" | "zips" => Some(GeographyLevel::Zip),
            "tract" | "tracts" => Some(GeographyLevel::Tract),
            "place" | "places" => Some(GeographyLevel::Place),
            "state" | "states" => Some(GeographyLevel::State),
            _ => None,
        }
    }

    /// Property names that may carry the boundary identifier, in lookup priority order
    pub fn id_fields(&self) -> &'static [&'static str] {
        match self {
            GeographyLevel::County => &["GEOID", "FIPS", "COUNTYFP", "COUNTYNS", "COUNTY"],
            GeographyLevel::Subcounty => &["GEOID", "COUSUBFP", "COUSUBNS", "COUSUB", "CCD"],
            GeographyLevel::Zip => &[
                "GEOID", "ZCTA5CE20", "ZCTA5CE10", "GEOID20", "GEOID10", "ZCTA5CE", "ZCTA5", "ZIP",
                "ZIPCODE", "ZCTA",
            ],
            GeographyLevel::Tract => &["GEOID", "TRACTCE", "FIPS", "TRACT"],
            GeographyLevel::Place => &["PLACEFIPS", "GEOID", "PLACEFP", "PLACE_FIPS", "PLACENS"],
            GeographyLevel::State => &["STUSPS", "STATE_NAME", "STATE_ABBR", "STATE", "STATEFP"],
        }
    }

    /// Human readable identifier format, used in zero-match diagnostics
    pub fn expected_format(&self) -> &'static str {
        match self {
            GeographyLevel::Zip => "5-digit ZIP codes (e.g., 33701, 02134)",
            GeographyLevel::County => {
                "5-digit FIPS codes (e.g., 12103) OR county names (e.g., \"Pinellas County\" or \"Pinellas\"); \
                 if using county names, select a state filter"
            }
            GeographyLevel::Place => "7-digit place FIPS codes (e.g., 1245000)",
            GeographyLevel::Tract => "11-digit census tract codes (e.g., 12103123456)",
            GeographyLevel::Subcounty => "10-digit CCD codes (e.g., 1210312345)",
            GeographyLevel::State => "2-letter state abbreviations, state names or 2-digit state FIPS codes",
        }
    }

    /// Levels where an unfiltered fetch is large enough that detected states should narrow it
    pub fn narrows_by_detected_states(&self) -> bool {
        matches!(
            self,
            GeographyLevel::County
                | GeographyLevel::Place
                | GeographyLevel::Tract
                | GeographyLevel::Subcounty
        )
    }
}

impl std::fmt::Display for GeographyLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class break method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ClassMethod {
    #[default]
    Quantile,
    Equal,
}

impl ClassMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassMethod::Quantile => "quantile",
            ClassMethod::Equal => "equal",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "quantile" => Some(ClassMethod::Quantile),
            "equal" | "equal-interval" | "equal_interval" => Some(ClassMethod::Equal),
            _ => None,
        }
    }
}

/// Named sequential or diverging palette
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ColorScheme {
    #[default]
    Reds,
    Blues,
    Greens,
    Purples,
    Oranges,
    Diverging,
}

impl ColorScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColorScheme::Reds => "reds",
            ColorScheme::Blues => "blues",
            ColorScheme::Greens => "greens",
            ColorScheme::Purples => "purples",
            ColorScheme::Oranges => "oranges",
            ColorScheme::Diverging => "diverging",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "reds" => Some(ColorScheme::Reds),
            "blues" => Some(ColorScheme::Blues),
            "greens" => Some(ColorScheme::Greens),
            "purples" => Some(ColorScheme::Purples),
            "oranges" => Some(ColorScheme::Oranges),
            "diverging" => Some(ColorScheme::Diverging),
            _ => None,
        }
    }

    pub fn colors(&self) -> &'static [&'static str] {
        match self {
            ColorScheme::Reds => &[
                "#fff5f0", "#fee0d2", "#fcbba1", "#fc9272", "#fb6a4a", "#ef3b2c", "#cb181d",
                "#a50f15", "#67000d",
            ],
            ColorScheme::Blues => &[
                "#f7fbff", "#deebf7", "#c6dbef", "#9ecae1", "#6baed6", "#4292c6", "#2171b5",
                "#08519c", "#08306b",
            ],
            ColorScheme::Greens => &[
                "#f7fcf5", "#e5f5e0", "#c7e9c0", "#a1d99b", "#74c476", "#41ab5d", "#238b45",
                "#006d2c", "#00441b",
            ],
            ColorScheme::Purples => &[
                "#fcfbfd", "#efedf5", "#dadaeb", "#bcbddc", "#9e9ac8", "#807dba", "#6a51a3",
                "#54278f", "#3f007d",
            ],
            ColorScheme::Oranges => &[
                "#fff5eb", "#fee6ce", "#fdd0a2", "#fdae6b", "#fd8d3c", "#f16913", "#d94801",
                "#a63603", "#7f2704",
            ],
            ColorScheme::Diverging => &[
                "#67001f", "#b2182b", "#d6604d", "#f4a582", "#fddbc7", "#d1e5f0", "#92c5de",
                "#4393c3", "#2166ac", "#053061",
            ],
        }
    }
}

/// How duplicate join keys are collapsed before the join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AggregationPolicy {
    /// Sum when every data value is numeric, count otherwise
    #[default]
    Auto,
    Sum,
    Count,
}

impl AggregationPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationPolicy::Auto => "auto",
            AggregationPolicy::Sum => "sum",
            AggregationPolicy::Count => "count",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "auto" => Some(AggregationPolicy::Auto),
            "sum" => Some(AggregationPolicy::Sum),
            "count" => Some(AggregationPolicy::Count),
            _ => None,
        }
    }
}

/// What an unparseable data value becomes on a merged feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MissingValuePolicy {
    /// `choropleth_value` is 0
    #[default]
    Zero,
    /// `choropleth_value` is null and renders as no data
    NoData,
}

impl MissingValuePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissingValuePolicy::Zero => "zero",
            MissingValuePolicy::NoData => "no-data",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "zero" => Some(MissingValuePolicy::Zero),
            "no-data" | "no_data" | "nodata" => Some(MissingValuePolicy::NoData),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_round_trips_through_str() {
        for level in [
            GeographyLevel::County,
            GeographyLevel::Subcounty,
            GeographyLevel::Zip,
            GeographyLevel::Tract,
            GeographyLevel::Place,
            GeographyLevel::State,
        ] {
            assert_eq!(GeographyLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(GeographyLevel::from_str("ZCTA"), Some(GeographyLevel::Zip));
        assert_eq!(GeographyLevel::from_str("block"), None);
    }

    #[test]
    fn test_county_id_fields_priority() {
        assert_eq!(GeographyLevel::County.id_fields()[0], "GEOID");
        assert_eq!(GeographyLevel::Place.id_fields()[0], "PLACEFIPS");
    }

    #[test]
    fn test_palettes_have_enough_colors() {
        assert_eq!(ColorScheme::Reds.colors().len(), 9);
        assert_eq!(ColorScheme::Diverging.colors().len(), 10);
    }
}
