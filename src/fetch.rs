//! Boundary polygons from ArcGIS FeatureServer, Census TIGERweb or a static ZIP GeoJSON

use geojson::{FeatureCollection, GeoJson};
use reqwest::Url;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::FetchError;
use crate::normalize::{id_variants, normalize_zip, property_key};
use crate::states::{self, UsState};
use crate::types::GeographyLevel;

pub const ARCGIS_BASE: &str = "https://services.arcgis.com/P3ePLMYs2RVChkJx/arcgis/rest/services";
pub const TIGER_BASE: &str = "https://tigerweb.geo.census.gov/arcgis/rest/services/TIGERweb";
pub const PAGE_SIZE: usize = 2000;
pub const FEATURE_CEILING: usize = 10_000;
pub const USER_AGENT: &str = "Mozilla/5.0 (compatible; ChoroplethJoin/1.0)";

/// Plain HTTP GET returning the body of a 2xx response
pub trait Transport {
    fn get_text(&self, url: &str) -> Result<String, FetchError>;

    /// Called once a body has parsed into usable boundaries
    fn remember(&self, _url: &str, _body: &str) {}
}

/// Boundary responses on disk, one file per request URL
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: PathBuf,
}

impl ResponseCache {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, url: &str) -> PathBuf {
        let (path, query) = url.split_once('?').unwrap_or((url, ""));
        let path = path
            .strip_prefix("https://")
            .or_else(|| path.strip_prefix("http://"))
            .unwrap_or(path);
        // readable head of the query plus a digest of all of it
        let head: String = query
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .take(80)
            .collect();
        let digest = format!("{:x}", Sha256::digest(query.as_bytes()));
        self.dir
            .join(path)
            .join(format!("q_{}_{}.json", head, &digest[..16]))
    }

    pub fn load(&self, url: &str) -> Option<String> {
        let path = self.path_for(url);
        if !path.exists() {
            return None;
        }
        match fs::read_to_string(&path) {
            Ok(text) => {
                debug!(path = %path.display(), "boundary cache hit");
                Some(text)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable cache entry");
                None
            }
        }
    }

    pub fn store(&self, url: &str, body: &str) {
        let path = self.path_for(url);
        if path.exists() {
            return;
        }
        let written = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::write(&path, body));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "failed to cache response");
        }
    }
}

/// reqwest client with an optional on-disk response cache
pub struct CachedClient {
    client: reqwest::blocking::Client,
    cache: Option<ResponseCache>,
}

impl CachedClient {
    pub fn new(user_agent: &str, cache_dir: Option<PathBuf>) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(user_agent)
            .build()?;
        Ok(Self {
            client,
            cache: cache_dir.map(ResponseCache::new),
        })
    }
}

impl Transport for CachedClient {
    fn get_text(&self, url: &str) -> Result<String, FetchError> {
        if let Some(text) = self.cache.as_ref().and_then(|c| c.load(url)) {
            return Ok(text);
        }

        let network = |e: reqwest::Error| FetchError::Network {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self.client.get(url).send().map_err(network)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        response.text().map_err(network)
    }

    fn remember(&self, url: &str, body: &str) {
        if let Some(cache) = &self.cache {
            cache.store(url, body);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    ArcGis,
    Tiger,
    StaticZip,
}

impl Source {
    fn name(&self) -> &'static str {
        match self {
            Source::ArcGis => "ArcGIS FeatureServer",
            Source::Tiger => "Census TIGERweb",
            Source::StaticZip => "static ZIP GeoJSON",
        }
    }
}

fn arcgis_layer(level: GeographyLevel) -> &'static str {
    match level {
        GeographyLevel::County => "/USA_Counties_Generalized_Boundaries/FeatureServer/0",
        GeographyLevel::Subcounty => "/USA_County_Subdivisions/FeatureServer/0",
        GeographyLevel::Zip => "/USA_ZIP_Code_Tabulation_Areas_ZCTA5_2020/FeatureServer/0",
        GeographyLevel::Tract => "/USA_Census_Tracts/FeatureServer/0",
        GeographyLevel::Place => "/USA_Census_Populated_Places/FeatureServer/0",
        GeographyLevel::State => "/USA_States_Generalized/FeatureServer/0",
    }
}

fn tiger_layer(level: GeographyLevel) -> &'static str {
    match level {
        GeographyLevel::County => "/State_County/MapServer/1",
        GeographyLevel::Subcounty => "/Places_CouSub_ConCity_SubMCD/MapServer/1",
        GeographyLevel::Zip => "/PUMA_TAD_TAZ_UGA_ZCTA/MapServer/2",
        GeographyLevel::Tract => "/Tracts_Blocks/MapServer/0",
        GeographyLevel::Place => "/Places_CouSub_ConCity_SubMCD/MapServer/0",
        GeographyLevel::State => "/State_County/MapServer/0",
    }
}

#[derive(Debug, Clone, Copy)]
enum StateKey {
    Name,
    Abbr,
    Fips,
}

/// Fields that encode the state on each ArcGIS layer, and which state form they hold
fn arcgis_state_fields(level: GeographyLevel) -> &'static [(&'static str, StateKey)] {
    match level {
        GeographyLevel::County => &[
            ("STATE_NAME", StateKey::Name),
            ("STUSPS", StateKey::Abbr),
            ("STATE_ABBR", StateKey::Abbr),
        ],
        GeographyLevel::Tract | GeographyLevel::Subcounty => {
            &[("STATE", StateKey::Fips), ("STATEFP", StateKey::Fips)]
        }
        GeographyLevel::Place => &[("STATE", StateKey::Abbr), ("ST", StateKey::Abbr)],
        // ZIP is post-filtered by prefix; state level is small enough to take whole
        GeographyLevel::Zip | GeographyLevel::State => &[],
    }
}

fn state_predicate(fields: &[(&str, StateKey)], state: Option<&UsState>) -> String {
    let Some(state) = state else {
        return "1=1".to_string();
    };
    if fields.is_empty() {
        return "1=1".to_string();
    }
    fields
        .iter()
        .map(|(field, key)| {
            let value = match key {
                StateKey::Name => state.name,
                StateKey::Abbr => state.abbr,
                StateKey::Fips => state.fips,
            };
            format!("{} = '{}'", field, value.replace('\'', "''"))
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

pub fn arcgis_where(level: GeographyLevel, state: Option<&UsState>) -> String {
    state_predicate(arcgis_state_fields(level), state)
}

pub fn tiger_where(level: GeographyLevel, state: Option<&UsState>) -> String {
    let fields: &[(&str, StateKey)] = match level {
        GeographyLevel::State | GeographyLevel::Zip => &[],
        _ => &[("STATE", StateKey::Fips)],
    };
    state_predicate(fields, state)
}

/// ZCTA layers on both services carry the 5-digit ZIP as a string `GEOID`
const ZIP_QUERY_FIELD: &str = "GEOID";

/// ZIP-prefix ranges of one state as a string range predicate on the ZCTA id
pub fn zip_where(state: &UsState) -> String {
    state
        .zip_prefixes
        .iter()
        .map(|(lo, hi)| {
            format!(
                "({f} >= '{:03}00' AND {f} <= '{:03}99')",
                lo,
                hi,
                f = ZIP_QUERY_FIELD
            )
        })
        .collect::<Vec<_>>()
        .join(" OR ")
}

/// 5-digit ZIP of a boundary feature, from the first ZIP identifier field present
fn feature_zip(feature: &geojson::Feature) -> Option<String> {
    let props = feature.properties.as_ref()?;
    GeographyLevel::Zip.id_fields().iter().find_map(|f| {
        let id = props.get(*f).and_then(property_key)?;
        let first = id_variants(&id, GeographyLevel::Zip).into_iter().next()?;
        Some(normalize_zip(&first))
    })
}

fn empty_collection() -> FeatureCollection {
    FeatureCollection {
        bbox: None,
        features: Vec::new(),
        foreign_members: None,
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub arcgis_base: String,
    pub tiger_base: String,
    /// Pre-built nationwide ZIP GeoJSON; the ArcGIS ZCTA layer is paged when None
    pub zip_source_url: Option<String>,
    pub page_size: usize,
    pub feature_ceiling: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            arcgis_base: ARCGIS_BASE.to_string(),
            tiger_base: TIGER_BASE.to_string(),
            zip_source_url: None,
            page_size: PAGE_SIZE,
            feature_ceiling: FEATURE_CEILING,
        }
    }
}

#[derive(Debug)]
pub struct StateFailure {
    pub state: &'static str,
    pub error: FetchError,
}

/// Features accumulated over a per-state fetch sequence plus the states that failed
#[derive(Debug)]
pub struct MultiStateFetch {
    pub collection: FeatureCollection,
    pub fetched: Vec<&'static str>,
    pub failures: Vec<StateFailure>,
}

pub struct BoundaryFetcher<'a> {
    transport: &'a dyn Transport,
    settings: FetchSettings,
}

impl<'a> BoundaryFetcher<'a> {
    pub fn new(transport: &'a dyn Transport, settings: FetchSettings) -> Self {
        Self {
            transport,
            settings,
        }
    }

    /// Boundaries for one level, optionally restricted to one state
    pub fn fetch(
        &self,
        level: GeographyLevel,
        state: Option<&'static UsState>,
    ) -> Result<FeatureCollection, FetchError> {
        if level == GeographyLevel::Zip {
            return self.fetch_zip(&state.into_iter().collect::<Vec<_>>());
        }

        let scope = state.map(|s| format!(" for {}", s.abbr)).unwrap_or_default();
        let primary = if state.is_some_and(|s| states::needs_batch_fetch(level, s)) {
            info!("Large dataset for {}{}, fetching in batches", level, scope);
            self.fetch_paged(Source::ArcGis, &self.arcgis_url(level), &arcgis_where(level, state), level)
        } else {
            self.arcgis_query(level, state, None)
        };

        let fallback_where = tiger_where(level, state);
        self.or_tiger(primary, level, &fallback_where, scope)
    }

    /// ZIP boundaries, restricted to the given states when any are named
    ///
    /// A configured static source is read whole and filtered by ZIP prefix.
    /// Otherwise each state is queried by its prefix ranges, so the feature
    /// ceiling applies per state rather than to all ~33k ZCTAs.
    pub fn fetch_zip(&self, filter: &[&'static UsState]) -> Result<FeatureCollection, FetchError> {
        let level = GeographyLevel::Zip;
        let mut collection = match (&self.settings.zip_source_url, filter.is_empty()) {
            (Some(url), _) => {
                let primary = self.get_collection(Source::StaticZip, url, level);
                self.or_tiger(primary, level, "1=1", String::new())?
            }
            (None, true) => {
                let primary = self.fetch_paged(Source::ArcGis, &self.arcgis_url(level), "1=1", level);
                self.or_tiger(primary, level, "1=1", String::new())?
            }
            (None, false) => self.fetch_zip_states(filter)?,
        };

        if !filter.is_empty() {
            let before = collection.features.len();
            collection.features.retain(|f| {
                feature_zip(f)
                    .and_then(|z| states::by_zip(&z))
                    .is_some_and(|owner| filter.iter().any(|s| s.fips == owner.fips))
            });
            let abbrs: Vec<&str> = filter.iter().map(|s| s.abbr).collect();
            info!(
                "Filtered {} ZIP boundaries to {} in {}",
                before,
                collection.features.len(),
                abbrs.join(", ")
            );
            if collection.features.is_empty() {
                return Err(FetchError::Empty {
                    source_name: format!("ZIP source filtered to {}", abbrs.join(", ")),
                    level,
                });
            }
        }

        Ok(collection)
    }

    fn fetch_zip_states(&self, filter: &[&'static UsState]) -> Result<FeatureCollection, FetchError> {
        let level = GeographyLevel::Zip;
        let mut all = empty_collection();
        let mut first_error = None;
        for state in filter {
            let where_clause = zip_where(state);
            let primary = self.fetch_paged(Source::ArcGis, &self.arcgis_url(level), &where_clause, level);
            match self.or_tiger(primary, level, &where_clause, format!(" for {}", state.abbr)) {
                Ok(fc) => {
                    info!("Added {} ZIP features from {}", fc.features.len(), state.abbr);
                    all.features.extend(fc.features);
                }
                Err(error) => {
                    warn!(state = state.abbr, error = %error, "ZIP fetch failed");
                    first_error.get_or_insert(error);
                }
            }
        }
        match first_error {
            Some(error) if all.features.is_empty() => Err(error),
            _ => Ok(all),
        }
    }

    /// Pass a primary result through, or retry the level on TIGERweb
    fn or_tiger(
        &self,
        primary: Result<FeatureCollection, FetchError>,
        level: GeographyLevel,
        where_clause: &str,
        scope: String,
    ) -> Result<FeatureCollection, FetchError> {
        let primary = match primary {
            Ok(fc) => return Ok(fc),
            Err(e) => e,
        };
        warn!(error = %primary, "{} source failed, trying {}", level, Source::Tiger.name());
        self.tiger_query(level, where_clause).map_err(|fallback| FetchError::Exhausted {
            level,
            scope,
            primary: Box::new(primary),
            fallback: Box::new(fallback),
        })
    }

    /// Fetch each state in turn, keeping whatever succeeds
    pub fn fetch_states(&self, level: GeographyLevel, states: &[&'static UsState]) -> MultiStateFetch {
        let init = MultiStateFetch {
            collection: empty_collection(),
            fetched: Vec::new(),
            failures: Vec::new(),
        };
        states.iter().fold(init, |mut acc, state| {
            match self.fetch(level, Some(state)) {
                Ok(fc) => {
                    info!("Added {} {} features from {}", fc.features.len(), level, state.abbr);
                    acc.collection.features.extend(fc.features);
                    acc.fetched.push(state.abbr);
                }
                Err(error) => {
                    warn!(state = state.abbr, error = %error, "state fetch failed");
                    acc.failures.push(StateFailure {
                        state: state.abbr,
                        error,
                    });
                }
            }
            acc
        })
    }

    fn arcgis_url(&self, level: GeographyLevel) -> String {
        format!("{}{}/query", self.settings.arcgis_base, arcgis_layer(level))
    }

    fn query_url(base: &str, params: &[(&str, String)]) -> Result<String, FetchError> {
        Url::parse_with_params(base, params)
            .map(|u| u.to_string())
            .map_err(|e| FetchError::InvalidUrl {
                url: base.to_string(),
                message: e.to_string(),
            })
    }

    fn arcgis_params(where_clause: &str, page: Option<(usize, usize)>) -> Vec<(&'static str, String)> {
        let mut params = vec![
            ("where", where_clause.to_string()),
            ("outFields", "*".to_string()),
            ("f", "geojson".to_string()),
            ("outSR", "4326".to_string()),
            ("returnGeometry", "true".to_string()),
            ("geometryPrecision", "4".to_string()),
        ];
        if let Some((offset, limit)) = page {
            params.push(("resultOffset", offset.to_string()));
            params.push(("resultRecordCount", limit.to_string()));
        }
        params
    }

    fn arcgis_query(
        &self,
        level: GeographyLevel,
        state: Option<&UsState>,
        page: Option<(usize, usize)>,
    ) -> Result<FeatureCollection, FetchError> {
        let params = Self::arcgis_params(&arcgis_where(level, state), page);
        let url = Self::query_url(&self.arcgis_url(level), &params)?;
        self.get_collection(Source::ArcGis, &url, level)
    }

    fn tiger_query(&self, level: GeographyLevel, where_clause: &str) -> Result<FeatureCollection, FetchError> {
        let base = format!("{}{}/query", self.settings.tiger_base, tiger_layer(level));
        let params = vec![
            ("where", where_clause.to_string()),
            ("outFields", "*".to_string()),
            ("f", "geojson".to_string()),
            ("outSR", "4326".to_string()),
            ("returnGeometry", "true".to_string()),
        ];
        let url = Self::query_url(&base, &params)?;
        self.get_collection(Source::Tiger, &url, level)
    }

    /// Page through a query with an offset cursor until a short page or the ceiling
    fn fetch_paged(
        &self,
        source: Source,
        base: &str,
        where_clause: &str,
        level: GeographyLevel,
    ) -> Result<FeatureCollection, FetchError> {
        let limit = self.settings.page_size.max(1);
        let mut all = empty_collection();
        let mut offset = 0;

        loop {
            let params = Self::arcgis_params(where_clause, Some((offset, limit)));
            let url = Self::query_url(base, &params)?;
            debug!("Fetching batch {} at offset {}", offset / limit + 1, offset);

            let page = match self.get_collection(source, &url, level) {
                Ok(page) => page,
                // an empty page past the first just means the previous page was exactly full
                Err(FetchError::Empty { .. }) if offset > 0 => break,
                Err(e) if offset > 0 => {
                    warn!(offset, error = %e, "batch fetch failed, keeping {} features", all.features.len());
                    break;
                }
                Err(e) => return Err(e),
            };

            let count = page.features.len();
            all.features.extend(page.features);
            debug!("Fetched {} features (total: {})", count, all.features.len());

            if count < limit {
                break;
            }
            if all.features.len() >= self.settings.feature_ceiling {
                warn!(
                    "Batch fetch stopped at {} features (ceiling {})",
                    all.features.len(),
                    self.settings.feature_ceiling
                );
                break;
            }
            offset += limit;
        }

        info!("Batch fetch complete: {} total features", all.features.len());
        Ok(all)
    }

    fn get_collection(
        &self,
        source: Source,
        url: &str,
        level: GeographyLevel,
    ) -> Result<FeatureCollection, FetchError> {
        debug!(url, "fetching {}", source.name());
        let text = self.transport.get_text(url)?;
        let collection = parse_collection(source, &text, level)?;
        // service errors and empty pages stay uncached so the next run asks again
        self.transport.remember(url, &text);
        Ok(collection)
    }
}

fn parse_collection(
    source: Source,
    text: &str,
    level: GeographyLevel,
) -> Result<FeatureCollection, FetchError> {
    let json_err = |message: String| FetchError::Json {
        source_name: source.name().to_string(),
        message,
    };

    let value: Value = serde_json::from_str(text).map_err(|e| {
        let preview: String = text.chars().take(200).collect();
        json_err(format!("{} (response starts: {:?})", e, preview))
    })?;

    // ArcGIS reports query errors as 200 OK with an error object
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return Err(FetchError::Service {
            source_name: source.name().to_string(),
            message,
        });
    }

    let mut collection = match GeoJson::from_json_value(value) {
        Ok(GeoJson::FeatureCollection(fc)) => fc,
        Ok(_) => return Err(json_err("expected a FeatureCollection".to_string())),
        Err(e) => return Err(json_err(e.to_string())),
    };

    let before = collection.features.len();
    collection.features.retain(|f| {
        f.geometry.is_some() && f.properties.as_ref().is_some_and(|p| !p.is_empty())
    });
    if collection.features.len() < before {
        debug!(
            dropped = before - collection.features.len(),
            "dropped features without geometry or properties"
        );
    }

    if collection.features.is_empty() {
        return Err(FetchError::Empty {
            source_name: source.name().to_string(),
            level,
        });
    }
    Ok(collection)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;

    /// In-memory transport: the first rule whose every needle occurs in the URL answers
    pub(crate) struct MockTransport {
        rules: Vec<(Vec<String>, Result<String, u16>)>,
        pub requests: RefCell<Vec<String>>,
        pub remembered: RefCell<Vec<String>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self {
                rules: Vec::new(),
                requests: RefCell::new(Vec::new()),
                remembered: RefCell::new(Vec::new()),
            }
        }

        pub(crate) fn respond(mut self, needles: &[&str], body: String) -> Self {
            self.rules
                .push((needles.iter().map(|n| n.to_string()).collect(), Ok(body)));
            self
        }

        pub(crate) fn fail(mut self, needles: &[&str], status: u16) -> Self {
            self.rules
                .push((needles.iter().map(|n| n.to_string()).collect(), Err(status)));
            self
        }

        pub(crate) fn requested(&self, needle: &str) -> usize {
            self.requests
                .borrow()
                .iter()
                .filter(|u| u.contains(needle))
                .count()
        }
    }

    impl Transport for MockTransport {
        fn get_text(&self, url: &str) -> Result<String, FetchError> {
            self.requests.borrow_mut().push(url.to_string());
            for (needles, response) in &self.rules {
                if needles.iter().all(|n| url.contains(n.as_str())) {
                    return match response {
                        Ok(body) => Ok(body.clone()),
                        Err(status) => Err(FetchError::Status {
                            url: url.to_string(),
                            status: *status,
                        }),
                    };
                }
            }
            Err(FetchError::Network {
                url: url.to_string(),
                message: "no mock rule".to_string(),
            })
        }

        fn remember(&self, url: &str, _body: &str) {
            self.remembered.borrow_mut().push(url.to_string());
        }
    }

    /// FeatureCollection JSON with one square per (field, id)
    pub(crate) fn collection_json(field: &str, ids: &[String]) -> String {
        let features: Vec<Value> = ids
            .iter()
            .map(|id| {
                json!({
                    "type": "Feature",
                    "geometry": {
                        "type": "Polygon",
                        "coordinates": [[[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 0.0]]]
                    },
                    "properties": { field: id, "NAME": format!("Area {}", id) }
                })
            })
            .collect();
        json!({"type": "FeatureCollection", "features": features}).to_string()
    }

    fn ids(prefix: &str, range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("{}{:04}", prefix, i)).collect()
    }

    fn settings(page_size: usize, ceiling: usize) -> FetchSettings {
        FetchSettings {
            page_size,
            feature_ceiling: ceiling,
            ..FetchSettings::default()
        }
    }

    #[test]
    fn test_arcgis_predicates_per_level() {
        let fl = states::by_abbr("FL");
        assert_eq!(
            arcgis_where(GeographyLevel::County, fl),
            "STATE_NAME = 'Florida' OR STUSPS = 'FL' OR STATE_ABBR = 'FL'"
        );
        assert_eq!(
            arcgis_where(GeographyLevel::Tract, fl),
            "STATE = '12' OR STATEFP = '12'"
        );
        assert_eq!(
            arcgis_where(GeographyLevel::Place, fl),
            "STATE = 'FL' OR ST = 'FL'"
        );
        assert_eq!(arcgis_where(GeographyLevel::Zip, fl), "1=1");
        assert_eq!(arcgis_where(GeographyLevel::County, None), "1=1");
        assert_eq!(tiger_where(GeographyLevel::County, fl), "STATE = '12'");
        assert_eq!(tiger_where(GeographyLevel::State, fl), "1=1");
    }

    #[test]
    fn test_primary_success() {
        let mock = MockTransport::new().respond(
            &["USA_Counties_Generalized_Boundaries"],
            collection_json("GEOID", &["12103".to_string(), "12057".to_string()]),
        );
        let fetcher = BoundaryFetcher::new(&mock, FetchSettings::default());
        let fc = fetcher
            .fetch(GeographyLevel::County, states::by_abbr("FL"))
            .unwrap();
        assert_eq!(fc.features.len(), 2);
        assert_eq!(mock.requested("tigerweb"), 0);
        let url = &mock.requests.borrow()[0];
        assert!(url.contains("f=geojson"));
        assert!(url.contains("outSR=4326"));
        assert!(url.contains("STUSPS"));
    }

    #[test]
    fn test_empty_primary_falls_back_to_tiger() {
        let mock = MockTransport::new()
            .respond(
                &["services.arcgis.com"],
                json!({"type": "FeatureCollection", "features": []}).to_string(),
            )
            .respond(
                &["tigerweb", "State_County/MapServer/1"],
                collection_json("GEOID", &["12103".to_string()]),
            );
        let fetcher = BoundaryFetcher::new(&mock, FetchSettings::default());
        let fc = fetcher
            .fetch(GeographyLevel::County, states::by_abbr("FL"))
            .unwrap();
        assert_eq!(fc.features.len(), 1);
        assert_eq!(mock.requested("tigerweb"), 1);
    }

    #[test]
    fn test_service_error_and_bad_json_fall_back() {
        let mock = MockTransport::new()
            .respond(
                &["services.arcgis.com"],
                json!({"error": {"code": 400, "message": "Invalid query"}}).to_string(),
            )
            .respond(&["tigerweb"], "<html>oops</html>".to_string());
        let fetcher = BoundaryFetcher::new(&mock, FetchSettings::default());
        let err = fetcher
            .fetch(GeographyLevel::Place, states::by_abbr("NV"))
            .unwrap_err();
        match err {
            FetchError::Exhausted {
                level,
                primary,
                fallback,
                ..
            } => {
                assert_eq!(level, GeographyLevel::Place);
                assert!(matches!(*primary, FetchError::Service { .. }));
                assert!(matches!(*fallback, FetchError::Json { .. }));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_http_failure_on_both_sources() {
        let mock = MockTransport::new()
            .fail(&["services.arcgis.com"], 500)
            .fail(&["tigerweb"], 503);
        let fetcher = BoundaryFetcher::new(&mock, FetchSettings::default());
        let err = fetcher.fetch(GeographyLevel::State, None).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("state boundaries"));
        assert!(msg.contains("HTTP 500"));
        assert!(msg.contains("HTTP 503"));
    }

    #[test]
    fn test_large_state_is_paged_until_short_page() {
        let mock = MockTransport::new()
            .respond(
                &["USA_Census_Tracts", "resultOffset=0&"],
                collection_json("GEOID", &ids("06", 0..3)),
            )
            .respond(
                &["USA_Census_Tracts", "resultOffset=3&"],
                collection_json("GEOID", &ids("06", 3..6)),
            )
            .respond(
                &["USA_Census_Tracts", "resultOffset=6&"],
                collection_json("GEOID", &ids("06", 6..7)),
            );
        let fetcher = BoundaryFetcher::new(&mock, settings(3, 100));
        let fc = fetcher
            .fetch(GeographyLevel::Tract, states::by_abbr("CA"))
            .unwrap();
        assert_eq!(fc.features.len(), 7);
        assert_eq!(mock.requested("resultRecordCount=3"), 3);
    }

    #[test]
    fn test_paging_stops_at_ceiling() {
        // every page is full, as if the service never returned a short page
        let mock = MockTransport::new().respond(
            &["USA_Census_Tracts"],
            collection_json("GEOID", &ids("48", 0..5)),
        );
        let fetcher = BoundaryFetcher::new(&mock, settings(5, 12));
        let fc = fetcher
            .fetch(GeographyLevel::Tract, states::by_abbr("TX"))
            .unwrap();
        assert_eq!(fc.features.len(), 15);
        assert_eq!(mock.requests.borrow().len(), 3);
    }

    #[test]
    fn test_exactly_full_last_page_ends_on_empty_page() {
        let mock = MockTransport::new()
            .respond(
                &["USA_Census_Populated_Places", "resultOffset=0&"],
                collection_json("PLACEFIPS", &ids("06", 0..2)),
            )
            .respond(
                &["USA_Census_Populated_Places", "resultOffset=2&"],
                json!({"type": "FeatureCollection", "features": []}).to_string(),
            );
        let fetcher = BoundaryFetcher::new(&mock, settings(2, 100));
        let fc = fetcher
            .fetch(GeographyLevel::Place, states::by_abbr("CA"))
            .unwrap();
        assert_eq!(fc.features.len(), 2);
    }

    #[test]
    fn test_zip_source_is_post_filtered_by_prefix() {
        let zips: Vec<String> = ["33701", "30301", "39801", "02134", "1233702"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mock = MockTransport::new().respond(&["zips.geojson"], collection_json("ZCTA5CE10", &zips));
        let fetcher = BoundaryFetcher::new(
            &mock,
            FetchSettings {
                zip_source_url: Some("https://example.com/zips.geojson".to_string()),
                ..FetchSettings::default()
            },
        );

        let ga = fetcher.fetch(GeographyLevel::Zip, states::by_abbr("GA")).unwrap();
        assert_eq!(ga.features.len(), 2);

        let fl = fetcher.fetch(GeographyLevel::Zip, states::by_abbr("FL")).unwrap();
        assert_eq!(fl.features.len(), 2);

        let all = fetcher.fetch(GeographyLevel::Zip, None).unwrap();
        assert_eq!(all.features.len(), 5);

        let err = fetcher.fetch(GeographyLevel::Zip, states::by_abbr("AK")).unwrap_err();
        assert!(matches!(err, FetchError::Empty { .. }));
    }

    #[test]
    fn test_zip_state_query_uses_prefix_ranges() {
        let ga = states::by_abbr("GA").unwrap();
        assert_eq!(
            zip_where(ga),
            "(GEOID >= '30000' AND GEOID <= '31999') OR (GEOID >= '39800' AND GEOID <= '39999')"
        );
    }

    #[test]
    fn test_zip_state_is_not_cut_off_by_nationwide_ceiling() {
        // nationwide pages hold only Florida and never end; Georgia needs its own query
        let mock = MockTransport::new()
            .respond(
                &["USA_ZIP_Code_Tabulation_Areas", "%2730000%27"],
                collection_json("GEOID", &["30301".to_string()]),
            )
            .respond(
                &["USA_ZIP_Code_Tabulation_Areas", "where=1%3D1"],
                collection_json("GEOID", &["33701".to_string(), "33702".to_string()]),
            );
        let fetcher = BoundaryFetcher::new(&mock, settings(2, 4));

        let nationwide = fetcher.fetch(GeographyLevel::Zip, None).unwrap();
        assert_eq!(nationwide.features.len(), 4);
        assert!(nationwide.features.iter().all(|f| feature_zip(f).as_deref() != Some("30301")));

        let ga = fetcher.fetch(GeographyLevel::Zip, states::by_abbr("GA")).unwrap();
        assert_eq!(ga.features.len(), 1);
        assert_eq!(feature_zip(&ga.features[0]).as_deref(), Some("30301"));
        assert_eq!(mock.requested("%2730000%27"), 1);
    }

    #[test]
    fn test_zip_states_keep_partial_results() {
        let mock = MockTransport::new()
            .respond(
                &["USA_ZIP_Code_Tabulation_Areas", "%2730000%27"],
                collection_json("GEOID", &["30301".to_string()]),
            )
            .fail(&["services.arcgis.com"], 500)
            .fail(&["tigerweb"], 500);
        let fetcher = BoundaryFetcher::new(&mock, FetchSettings::default());
        let filter: Vec<&'static UsState> = ["GA", "FL"]
            .iter()
            .filter_map(|a| states::by_abbr(a))
            .collect();
        let fc = fetcher.fetch_zip(&filter).unwrap();
        assert_eq!(fc.features.len(), 1);

        let fl: Vec<&'static UsState> = states::by_abbr("FL").into_iter().collect();
        assert!(matches!(fetcher.fetch_zip(&fl), Err(FetchError::Exhausted { .. })));
    }

    #[test]
    fn test_multi_state_fold_tolerates_failures() {
        let mock = MockTransport::new()
            .respond(
                &["USA_Counties_Generalized_Boundaries", "STUSPS+%3D+%27FL%27"],
                collection_json("GEOID", &["12103".to_string()]),
            )
            .respond(
                &["USA_Counties_Generalized_Boundaries", "STUSPS+%3D+%27GA%27"],
                collection_json("GEOID", &["13121".to_string(), "13089".to_string()]),
            )
            .fail(&["services.arcgis.com"], 500)
            .fail(&["tigerweb"], 500);
        let fetcher = BoundaryFetcher::new(&mock, FetchSettings::default());
        let states: Vec<&'static UsState> = ["FL", "CT", "GA"]
            .iter()
            .filter_map(|a| states::by_abbr(a))
            .collect();
        let result = fetcher.fetch_states(GeographyLevel::County, &states);
        assert_eq!(result.collection.features.len(), 3);
        assert_eq!(result.fetched, vec!["FL", "GA"]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].state, "CT");
    }

    #[test]
    fn test_features_without_geometry_are_dropped() {
        let body = json!({
            "type": "FeatureCollection",
            "features": [
                {"type": "Feature", "geometry": null, "properties": {"GEOID": "1"}},
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}, "properties": {}},
                {"type": "Feature", "geometry": {"type": "Point", "coordinates": [0.0, 0.0]}, "properties": {"GEOID": "2"}}
            ]
        })
        .to_string();
        let fc = parse_collection(Source::ArcGis, &body, GeographyLevel::County).unwrap();
        assert_eq!(fc.features.len(), 1);
    }

    fn temp_cache(name: &str) -> ResponseCache {
        let dir = std::env::temp_dir().join(format!("choropleth-join-cache-{}", name));
        let _ = fs::remove_dir_all(&dir);
        ResponseCache::new(dir)
    }

    #[test]
    fn test_cache_path_includes_query() {
        let cache = ResponseCache::new(PathBuf::from("cache"));
        let a = cache.path_for("https://host/a/query?where=STATE+%3D+%2712%27");
        let b = cache.path_for("https://host/a/query?where=STATE+%3D+%2713%27");
        assert_ne!(a, b);
        assert!(a.starts_with("cache/host/a/query"));
    }

    #[test]
    fn test_long_queries_differing_late_get_distinct_files() {
        let cache = ResponseCache::new(PathBuf::from("cache"));
        let head = "x".repeat(300);
        let a = cache.path_for(&format!("https://host/q?where={}&resultOffset=0", head));
        let b = cache.path_for(&format!("https://host/q?where={}&resultOffset=2000", head));
        assert_ne!(a, b);
        let name = a.file_name().and_then(|n| n.to_str()).unwrap();
        assert!(name.len() < 120, "{}", name);
    }

    #[test]
    fn test_cache_store_and_load() {
        let cache = temp_cache("roundtrip");
        let url = "https://host/layer/query?where=1%3D1";
        assert!(cache.load(url).is_none());
        cache.store(url, "{\"type\":\"FeatureCollection\"}");
        assert_eq!(cache.load(url).as_deref(), Some("{\"type\":\"FeatureCollection\"}"));
        let _ = fs::remove_dir_all(&cache.dir);
    }

    #[test]
    fn test_only_usable_responses_are_remembered() {
        let mock = MockTransport::new()
            .respond(
                &["services.arcgis.com"],
                json!({"error": {"code": 500, "message": "busy"}}).to_string(),
            )
            .respond(
                &["tigerweb"],
                json!({"type": "FeatureCollection", "features": []}).to_string(),
            );
        let fetcher = BoundaryFetcher::new(&mock, FetchSettings::default());
        assert!(fetcher.fetch(GeographyLevel::County, states::by_abbr("FL")).is_err());
        assert_eq!(mock.requests.borrow().len(), 2);
        assert!(mock.remembered.borrow().is_empty());

        let mock = MockTransport::new().respond(
            &["services.arcgis.com"],
            collection_json("GEOID", &["12103".to_string()]),
        );
        let fetcher = BoundaryFetcher::new(&mock, FetchSettings::default());
        fetcher.fetch(GeographyLevel::County, states::by_abbr("FL")).unwrap();
        assert_eq!(*mock.remembered.borrow(), *mock.requests.borrow());
    }

    #[test]
    fn test_cached_client_serves_remembered_boundaries() {
        let cache = temp_cache("client");
        let client = CachedClient {
            client: reqwest::blocking::Client::new(),
            cache: Some(cache.clone()),
        };
        // an unroutable host, so only the cache can answer
        let url = "https://cache-only.invalid/layer/query?where=1%3D1";
        client.remember(url, &collection_json("GEOID", &["12103".to_string()]));
        let fetcher = BoundaryFetcher::new(&client, FetchSettings::default());
        let fc = fetcher
            .get_collection(Source::ArcGis, url, GeographyLevel::County)
            .unwrap();
        assert_eq!(fc.features.len(), 1);
        let _ = fs::remove_dir_all(&cache.dir);
    }
}
