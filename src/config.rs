//! Optional CONL settings file; CLI flags override whatever it sets

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::classify::DEFAULT_CLASS_COUNT;
use crate::detect::MAX_DETECTED_STATES;
use crate::fetch::{FetchSettings, ARCGIS_BASE, FEATURE_CEILING, PAGE_SIZE, TIGER_BASE, USER_AGENT};
use crate::pipeline::MapRequest;
use crate::types::{AggregationPolicy, ClassMethod, ColorScheme, GeographyLevel, MissingValuePolicy};

pub const CONFIG_FILE: &str = "choropleth.conl";
pub const DEFAULT_CACHE_DIR: &str = "cache";

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    arcgis_base: Option<String>,
    tiger_base: Option<String>,
    zip_source_url: Option<String>,
    page_size: Option<usize>,
    feature_ceiling: Option<usize>,
    max_detected_states: Option<usize>,
    class_count: Option<usize>,
    class_method: Option<String>,
    color_scheme: Option<String>,
    aggregation: Option<String>,
    missing_values: Option<String>,
    /// Empty disables the response cache
    cache_dir: Option<String>,
    user_agent: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn parse_enum<T>(key: &str, value: &Option<String>, parse: fn(&str) -> Option<T>, valid: &str) -> Result<Option<T>> {
    match non_empty(value) {
        None => Ok(None),
        Some(v) => match parse(v) {
            Some(parsed) => Ok(Some(parsed)),
            None => bail!("Invalid {} '{}'. Valid values: {}", key, v, valid),
        },
    }
}

impl Config {
    /// Read `path`, or `choropleth.conl` in the working directory when present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_conl::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.page_size == Some(0) {
            bail!("page_size must be at least 1");
        }
        if self.feature_ceiling == Some(0) {
            bail!("feature_ceiling must be at least 1");
        }
        if self.max_detected_states == Some(0) {
            bail!("max_detected_states must be at least 1");
        }
        self.class_method()?;
        self.color_scheme()?;
        self.aggregation()?;
        self.missing_values()?;
        Ok(())
    }

    fn class_method(&self) -> Result<Option<ClassMethod>> {
        parse_enum("class_method", &self.class_method, ClassMethod::from_str, "quantile, equal")
    }

    fn color_scheme(&self) -> Result<Option<ColorScheme>> {
        parse_enum(
            "color_scheme",
            &self.color_scheme,
            ColorScheme::from_str,
            "reds, blues, greens, purples, oranges, diverging",
        )
    }

    fn aggregation(&self) -> Result<Option<AggregationPolicy>> {
        parse_enum("aggregation", &self.aggregation, AggregationPolicy::from_str, "auto, sum, count")
    }

    fn missing_values(&self) -> Result<Option<MissingValuePolicy>> {
        parse_enum("missing_values", &self.missing_values, MissingValuePolicy::from_str, "zero, no-data")
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            arcgis_base: non_empty(&self.arcgis_base).unwrap_or(ARCGIS_BASE).to_string(),
            tiger_base: non_empty(&self.tiger_base).unwrap_or(TIGER_BASE).to_string(),
            zip_source_url: non_empty(&self.zip_source_url).map(str::to_string),
            page_size: self.page_size.unwrap_or(PAGE_SIZE),
            feature_ceiling: self.feature_ceiling.unwrap_or(FEATURE_CEILING),
        }
    }

    /// Cache directory, `cache/` unless set; an explicitly empty value turns caching off
    pub fn cache_dir(&self) -> Option<PathBuf> {
        match &self.cache_dir {
            None => Some(PathBuf::from(DEFAULT_CACHE_DIR)),
            Some(_) => non_empty(&self.cache_dir).map(PathBuf::from),
        }
    }

    pub fn max_detected_states(&self) -> usize {
        self.max_detected_states.unwrap_or(MAX_DETECTED_STATES)
    }

    pub fn user_agent(&self) -> &str {
        non_empty(&self.user_agent).unwrap_or(USER_AGENT)
    }

    /// Request with this file's defaults; the caller applies CLI overrides on top
    pub fn map_request(&self, level: GeographyLevel, join_column: &str, data_column: &str) -> Result<MapRequest> {
        let mut request = MapRequest::new(level, join_column, data_column);
        request.class_count = self.class_count.unwrap_or(DEFAULT_CLASS_COUNT);
        request.max_detected_states = self.max_detected_states();
        if let Some(method) = self.class_method()? {
            request.method = method;
        }
        if let Some(scheme) = self.color_scheme()? {
            request.scheme = scheme;
        }
        if let Some(policy) = self.aggregation()? {
            request.aggregation = policy;
        }
        if let Some(policy) = self.missing_values()? {
            request.missing_values = policy;
        }
        Ok(request)
    }
}
