//! Writing the merged FeatureCollection out as GeoJSON or an ESRI shapefile

use geojson::{FeatureCollection, GeoJson, Geometry};
use serde_json::Value;
use shapefile::dbase::{FieldName, FieldValue, Record, TableWriterBuilder};
use shapefile::{Point, Polygon, PolygonRing};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::ExportError;

pub const DEFAULT_GEOJSON_FILE: &str = "choropleth_data.geojson";
pub const DEFAULT_SHAPEFILE_DIR: &str = "choropleth_shapefile";
pub const SHAPEFILE_LAYER: &str = "choropleth_data";

/// dBase field names are limited to 10 characters
pub const MAX_FIELD_NAME: usize = 10;
/// dBase character fields hold at most 254 bytes
pub const MAX_TEXT_LEN: usize = 254;

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> ExportError + '_ {
    move |source| ExportError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Serialize the whole document first, then write it in one go, so a failure leaves no file
pub fn write_geojson(collection: &FeatureCollection, path: &Path) -> Result<(), ExportError> {
    if collection.features.is_empty() {
        return Err(ExportError::NoData);
    }

    let document = GeoJson::FeatureCollection(collection.clone());
    let text = serde_json::to_string_pretty(&document)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(io_error(parent))?;
    }
    let tmp = path.with_extension("geojson.partial");
    fs::write(&tmp, text).map_err(io_error(&tmp))?;
    fs::rename(&tmp, path).map_err(io_error(path))?;

    info!(
        path = %path.display(),
        features = collection.features.len(),
        "wrote GeoJSON"
    );
    Ok(())
}

/// Shapefile-safe field names in the order of `keys`
///
/// Names are cut to 10 characters; a collision gets a numeric suffix that
/// replaces trailing characters, e.g. `population` and `population_2020`
/// become `population` and `populatio1`.
pub fn shapefile_field_names(keys: &[String]) -> Vec<String> {
    let mut taken: Vec<String> = Vec::with_capacity(keys.len());
    for key in keys {
        let base: String = key.chars().take(MAX_FIELD_NAME).collect();
        let mut name = base.clone();
        let mut n = 1;
        while taken.iter().any(|t| t.eq_ignore_ascii_case(&name)) {
            let suffix = n.to_string();
            let keep = MAX_FIELD_NAME.saturating_sub(suffix.len());
            name = base.chars().take(keep).collect::<String>() + &suffix;
            n += 1;
        }
        taken.push(name);
    }
    taken
}

fn truncate_text(value: &Value) -> Value {
    match value {
        Value::String(s) if s.len() > MAX_TEXT_LEN => {
            let mut end = MAX_TEXT_LEN;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            Value::String(s[..end].to_string())
        }
        // dBase has no nested types
        Value::Array(_) | Value::Object(_) => Value::String(
            value.to_string().chars().take(MAX_TEXT_LEN).collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ShapefileRecord {
    pub geometry: Geometry,
    /// One value per entry of `ShapefileLayer::fields`, Null where the feature lacks it
    pub values: Vec<Value>,
}

/// Attribute table and geometries ready for a shapefile encoder
#[derive(Debug, Clone, PartialEq)]
pub struct ShapefileLayer {
    pub name: String,
    /// (original property name, shapefile field name)
    pub fields: Vec<(String, String)>,
    pub records: Vec<ShapefileRecord>,
}

pub fn prepare_shapefile(collection: &FeatureCollection) -> Result<ShapefileLayer, ExportError> {
    if collection.features.is_empty() {
        return Err(ExportError::NoData);
    }

    let mut keys: Vec<String> = Vec::new();
    for feature in &collection.features {
        for key in feature.properties.iter().flat_map(|p| p.keys()) {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
    }
    let names = shapefile_field_names(&keys);

    let records = collection
        .features
        .iter()
        .filter_map(|feature| {
            let geometry = feature.geometry.clone()?;
            let values = keys
                .iter()
                .map(|k| {
                    feature
                        .properties
                        .as_ref()
                        .and_then(|p| p.get(k))
                        .map(truncate_text)
                        .unwrap_or(Value::Null)
                })
                .collect();
            Some(ShapefileRecord { geometry, values })
        })
        .collect::<Vec<_>>();

    if records.is_empty() {
        return Err(ExportError::NoData);
    }

    Ok(ShapefileLayer {
        name: SHAPEFILE_LAYER.to_string(),
        fields: keys.into_iter().zip(names).collect(),
        records,
    })
}

/// Binary shapefile encoding (.shp/.shx/.dbf/.prj) lives behind this seam
pub trait ShapefileWriter {
    fn write_layer(&self, dir: &Path, layer: &ShapefileLayer) -> Result<(), ExportError>;
}

/// Prepare attributes and hand them to `writer`
pub fn export_shapefile(
    collection: &FeatureCollection,
    dir: &Path,
    writer: &dyn ShapefileWriter,
) -> Result<ShapefileLayer, ExportError> {
    let layer = prepare_shapefile(collection)?;
    writer.write_layer(dir, &layer)?;
    info!(dir = %dir.display(), records = layer.records.len(), "wrote shapefile");
    Ok(layer)
}

const WGS84_PRJ: &str = "GEOGCS[\"GCS_WGS_1984\",DATUM[\"D_WGS_1984\",SPHEROID[\"WGS_1984\",6378137.0,298.257223563]],PRIMEM[\"Greenwich\",0.0],UNIT[\"Degree\",0.0174532925199433]]";

const SHAPEFILE_PARTS: &[&str] = &["shp", "shx", "dbf", "prj"];

/// Width and decimals of numeric dBase columns
const NUMERIC_WIDTH: u8 = 20;
const NUMERIC_DECIMALS: u8 = 6;

/// Polygon layers written with the `shapefile` crate, WGS84 coordinates
pub struct EsriShapefileWriter;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Column {
    Numeric,
    Character(u8),
}

fn column_kind(records: &[ShapefileRecord], index: usize) -> Column {
    let values = records.iter().map(|r| &r.values[index]).filter(|v| !v.is_null());
    let mut numeric = true;
    let mut width = 1;
    for value in values {
        numeric &= value.is_number();
        width = width.max(text_value(value).len());
    }
    if numeric {
        Column::Numeric
    } else {
        Column::Character(width.min(MAX_TEXT_LEN) as u8)
    }
}

fn text_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn ring(coords: &[Vec<f64>]) -> Vec<Point> {
    coords
        .iter()
        .filter(|c| c.len() >= 2)
        .map(|c| Point::new(c[0], c[1]))
        .collect()
}

/// Shapefile polygon from a GeoJSON Polygon or MultiPolygon; the first ring of each part is its shell
fn to_polygon(geometry: &Geometry) -> Option<Polygon> {
    let parts: Vec<&Vec<Vec<Vec<f64>>>> = match &geometry.value {
        geojson::Value::Polygon(p) => vec![p],
        geojson::Value::MultiPolygon(mp) => mp.iter().collect(),
        _ => return None,
    };
    let rings: Vec<PolygonRing<Point>> = parts
        .into_iter()
        .flat_map(|part| {
            part.iter().enumerate().filter_map(|(i, coords)| {
                let points = ring(coords);
                if points.len() < 3 {
                    return None;
                }
                Some(if i == 0 {
                    PolygonRing::Outer(points)
                } else {
                    PolygonRing::Inner(points)
                })
            })
        })
        .collect();
    if rings.is_empty() {
        return None;
    }
    Some(Polygon::with_rings(rings))
}

fn geometry_type(geometry: &Geometry) -> &'static str {
    match geometry.value {
        geojson::Value::Point(_) => "Point",
        geojson::Value::MultiPoint(_) => "MultiPoint",
        geojson::Value::LineString(_) => "LineString",
        geojson::Value::MultiLineString(_) => "MultiLineString",
        geojson::Value::Polygon(_) => "Polygon",
        geojson::Value::MultiPolygon(_) => "MultiPolygon",
        geojson::Value::GeometryCollection(_) => "GeometryCollection",
    }
}

impl EsriShapefileWriter {
    fn write_files(&self, dir: &Path, layer: &ShapefileLayer, polygons: &[Polygon]) -> Result<(), ExportError> {
        let columns: Vec<Column> = (0..layer.fields.len())
            .map(|i| column_kind(&layer.records, i))
            .collect();
        let mut table = TableWriterBuilder::new();
        for ((_, name), column) in layer.fields.iter().zip(&columns) {
            let field = FieldName::try_from(name.as_str())
                .map_err(|e| ExportError::Shapefile(format!("field name '{}': {:?}", name, e)))?;
            table = match column {
                Column::Numeric => table.add_numeric_field(field, NUMERIC_WIDTH, NUMERIC_DECIMALS),
                Column::Character(width) => table.add_character_field(field, *width),
            };
        }

        let base = dir.join(&layer.name);
        let mut writer = shapefile::Writer::from_path(base.with_extension("shp"), table)
            .map_err(|e| ExportError::Shapefile(e.to_string()))?;
        for (record, polygon) in layer.records.iter().zip(polygons) {
            let mut row = Record::default();
            for (((_, name), column), value) in layer.fields.iter().zip(&columns).zip(&record.values) {
                let field_value = match column {
                    Column::Numeric => FieldValue::Numeric(value.as_f64()),
                    Column::Character(_) => {
                        FieldValue::Character((!value.is_null()).then(|| text_value(value)))
                    }
                };
                row.insert(name.clone(), field_value);
            }
            writer
                .write_shape_and_record(polygon, &row)
                .map_err(|e| ExportError::Shapefile(e.to_string()))?;
        }
        drop(writer);

        let prj = base.with_extension("prj");
        fs::write(&prj, WGS84_PRJ).map_err(io_error(&prj))?;
        Ok(())
    }
}

impl ShapefileWriter for EsriShapefileWriter {
    fn write_layer(&self, dir: &Path, layer: &ShapefileLayer) -> Result<(), ExportError> {
        let mut polygons = Vec::with_capacity(layer.records.len());
        for record in &layer.records {
            let polygon = to_polygon(&record.geometry).ok_or_else(|| {
                ExportError::WriterUnavailable(format!(
                    "only polygon layers can be written, found {}",
                    geometry_type(&record.geometry)
                ))
            })?;
            polygons.push(polygon);
        }

        fs::create_dir_all(dir).map_err(io_error(dir))?;
        let written = self.write_files(dir, layer, &polygons);
        if written.is_err() {
            // no partial layer left behind
            for ext in SHAPEFILE_PARTS {
                let _ = fs::remove_file(dir.join(&layer.name).with_extension(ext));
            }
        }
        written
    }
}
