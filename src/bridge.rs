use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use geo::{Coord, Geometry, LineString, MultiLineString, MultiPoint, MultiPolygon, Point, Polygon};
use geojson::{Feature, FeatureCollection, GeoJson, Geometry as GeoJsonGeometry};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::provider::FeatureRecord;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON serialization failure: {0}")]
    Json(#[from] serde_json::Error),
    #[error("GeoJSON parse failure: {0}")]
    GeoJson(#[from] geojson::Error),
    #[error("columnar conversion failure: {0}")]
    Arrow(#[from] arrow::error::ArrowError),
    #[error("columnar file failure: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("unsupported geometry type: {0}")]
    UnsupportedGeometry(&'static str),
    #[error("malformed feature data: {0}")]
    Malformed(String),
    #[error("file is not a GeoJSON feature collection")]
    NotFeatureCollection,
}

pub fn to_geojson_value(geometry: &Geometry<f64>) -> Result<geojson::Value, BridgeError> {
    match geometry {
        Geometry::Point(point) => Ok(geojson::Value::Point(vec![point.x(), point.y()])),
        Geometry::MultiPoint(points) => Ok(geojson::Value::MultiPoint(
            points.iter().map(|p| vec![p.x(), p.y()]).collect(),
        )),
        Geometry::LineString(line) => Ok(geojson::Value::LineString(line_positions(line))),
        Geometry::MultiLineString(lines) => Ok(geojson::Value::MultiLineString(
            lines.iter().map(line_positions).collect(),
        )),
        Geometry::Polygon(polygon) => Ok(geojson::Value::Polygon(polygon_rings(polygon))),
        Geometry::MultiPolygon(polygons) => Ok(geojson::Value::MultiPolygon(
            polygons.iter().map(polygon_rings).collect(),
        )),
        Geometry::Line(_) => Err(BridgeError::UnsupportedGeometry("Line")),
        Geometry::Rect(_) => Err(BridgeError::UnsupportedGeometry("Rect")),
        Geometry::Triangle(_) => Err(BridgeError::UnsupportedGeometry("Triangle")),
        Geometry::GeometryCollection(_) => {
            Err(BridgeError::UnsupportedGeometry("GeometryCollection"))
        }
    }
}

pub fn from_geojson_value(value: &geojson::Value) -> Result<Geometry<f64>, BridgeError> {
    match value {
        geojson::Value::Point(position) => {
            let coord = coord_from(position)?;
            Ok(Geometry::Point(Point::from(coord)))
        }
        geojson::Value::MultiPoint(positions) => {
            let points = positions
                .iter()
                .map(|p| coord_from(p).map(Point::from))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Geometry::MultiPoint(MultiPoint::new(points)))
        }
        geojson::Value::LineString(positions) => {
            Ok(Geometry::LineString(line_from(positions)?))
        }
        geojson::Value::MultiLineString(lines) => {
            let lines = lines
                .iter()
                .map(|l| line_from(l))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Geometry::MultiLineString(MultiLineString::new(lines)))
        }
        geojson::Value::Polygon(rings) => Ok(Geometry::Polygon(polygon_from(rings)?)),
        geojson::Value::MultiPolygon(polygons) => {
            let polygons = polygons
                .iter()
                .map(|p| polygon_from(p))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
        }
        geojson::Value::GeometryCollection(_) => {
            Err(BridgeError::UnsupportedGeometry("GeometryCollection"))
        }
    }
}

fn line_positions(line: &LineString<f64>) -> Vec<Vec<f64>> {
    line.points().map(|p| vec![p.x(), p.y()]).collect()
}

fn polygon_rings(polygon: &Polygon<f64>) -> Vec<Vec<Vec<f64>>> {
    let mut rings = vec![line_positions(polygon.exterior())];
    rings.extend(polygon.interiors().iter().map(line_positions));
    rings
}

fn coord_from(position: &[f64]) -> Result<Coord<f64>, BridgeError> {
    if position.len() < 2 {
        return Err(BridgeError::Malformed(format!(
            "position with {} ordinates",
            position.len()
        )));
    }
    Ok((position[0], position[1]).into())
}

fn line_from(positions: &[Vec<f64>]) -> Result<LineString<f64>, BridgeError> {
    let coords = positions
        .iter()
        .map(|p| coord_from(p))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(LineString::new(coords))
}

fn polygon_from(rings: &[Vec<Vec<f64>>]) -> Result<Polygon<f64>, BridgeError> {
    let mut iter = rings.iter();
    let exterior = iter
        .next()
        .ok_or_else(|| BridgeError::Malformed("polygon without rings".to_string()))?;
    let holes = iter.map(|r| line_from(r)).collect::<Result<Vec<_>, _>>()?;
    Ok(Polygon::new(line_from(exterior)?, holes))
}

/// Converts every attribute value to its string form, keeping strings and
/// nulls as they are. Streaming output uses this so the emitted schema stays
/// permissive no matter which value types individual tiles carried.
pub fn stringify_properties(properties: &Map<String, Value>) -> Map<String, Value> {
    properties
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(_) | Value::Null => value.clone(),
                other => Value::String(other.to_string()),
            };
            (key.clone(), value)
        })
        .collect()
}

pub fn record_to_feature(
    record: &FeatureRecord,
    stringify: bool,
) -> Result<Feature, BridgeError> {
    let properties = if stringify {
        stringify_properties(&record.properties)
    } else {
        record.properties.clone()
    };
    Ok(Feature {
        bbox: None,
        geometry: Some(GeoJsonGeometry::new(to_geojson_value(&record.geometry)?)),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    })
}

/// Returns `None` for features without a geometry.
pub fn feature_to_record(feature: &Feature) -> Result<Option<FeatureRecord>, BridgeError> {
    let geometry = match &feature.geometry {
        Some(geometry) => from_geojson_value(&geometry.value)?,
        None => return Ok(None),
    };
    Ok(Some(FeatureRecord {
        geometry,
        properties: feature.properties.clone().unwrap_or_default(),
    }))
}

pub fn feature_collection(records: &[FeatureRecord]) -> Result<FeatureCollection, BridgeError> {
    let features = records
        .iter()
        .map(|r| record_to_feature(r, false))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    })
}

pub fn collection_to_geojson_string(records: &[FeatureRecord]) -> Result<String, BridgeError> {
    Ok(serde_json::to_string(&feature_collection(records)?)?)
}

/// Writes the whole collection as one JSON document.
pub fn write_geojson_file(path: &Path, records: &[FeatureRecord]) -> Result<(), BridgeError> {
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), &feature_collection(records)?)?;
    Ok(())
}

pub fn read_feature_collection(path: &Path) -> Result<Vec<Feature>, BridgeError> {
    let file = File::open(path)?;
    let geojson = GeoJson::from_reader(BufReader::new(file))?;
    match geojson {
        GeoJson::FeatureCollection(collection) => Ok(collection.features),
        _ => Err(BridgeError::NotFeatureCollection),
    }
}

pub fn read_geojson_file(path: &Path) -> Result<Vec<FeatureRecord>, BridgeError> {
    let features = read_feature_collection(path)?;
    let mut records = Vec::with_capacity(features.len());
    for feature in &features {
        if let Some(record) = feature_to_record(feature)? {
            records.push(record);
        }
    }
    Ok(records)
}

pub fn parse_geojson_string(body: &str) -> Result<Vec<FeatureRecord>, BridgeError> {
    match body.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(collection) => {
            let mut records = Vec::with_capacity(collection.features.len());
            for feature in &collection.features {
                if let Some(record) = feature_to_record(feature)? {
                    records.push(record);
                }
            }
            Ok(records)
        }
        _ => Err(BridgeError::NotFeatureCollection),
    }
}

/// Incremental feature-collection writer: the output file is opened once and
/// records are appended as they arrive, so at most one tile's records are
/// resident at a time. Attribute values are stringified on the way out.
pub struct FeatureStreamWriter {
    out: BufWriter<File>,
    path: PathBuf,
    written: usize,
}

impl FeatureStreamWriter {
    pub fn create(path: &Path) -> Result<Self, BridgeError> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        out.write_all(b"{\"type\":\"FeatureCollection\",\"features\":[")?;
        Ok(Self {
            out,
            path: path.to_path_buf(),
            written: 0,
        })
    }

    pub fn write_record(&mut self, record: &FeatureRecord) -> Result<(), BridgeError> {
        let feature = record_to_feature(record, true)?;
        if self.written > 0 {
            self.out.write_all(b",")?;
        }
        serde_json::to_writer(&mut self.out, &feature)?;
        self.written += 1;
        Ok(())
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn finish(mut self) -> Result<(PathBuf, usize), BridgeError> {
        self.out.write_all(b"]}")?;
        self.out.flush()?;
        Ok((self.path, self.written))
    }
}

fn parquet_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new("geometry", DataType::Utf8, false),
        Field::new("properties", DataType::Utf8, false),
    ]))
}

/// Writes records as a two-column string batch: GeoJSON-encoded geometry and
/// JSON-encoded attribute map.
pub fn write_parquet(path: &Path, records: &[FeatureRecord]) -> Result<(), BridgeError> {
    let mut geometries = Vec::with_capacity(records.len());
    let mut properties = Vec::with_capacity(records.len());
    for record in records {
        let geometry = GeoJsonGeometry::new(to_geojson_value(&record.geometry)?);
        geometries.push(serde_json::to_string(&geometry)?);
        properties.push(Value::Object(record.properties.clone()).to_string());
    }

    let schema = parquet_schema();
    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(StringArray::from(geometries)),
            Arc::new(StringArray::from(properties)),
        ],
    )?;

    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, schema, None)?;
    writer.write(&batch)?;
    writer.close()?;
    Ok(())
}

pub fn read_parquet(path: &Path) -> Result<Vec<FeatureRecord>, BridgeError> {
    let file = File::open(path)?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch?;
        let geometries = string_column(&batch, 0)?;
        let properties = string_column(&batch, 1)?;
        for row in 0..batch.num_rows() {
            let geometry: GeoJsonGeometry = serde_json::from_str(geometries.value(row))?;
            let properties = match serde_json::from_str(properties.value(row))? {
                Value::Object(map) => map,
                other => {
                    return Err(BridgeError::Malformed(format!(
                        "expected attribute object, got {}",
                        other
                    )))
                }
            };
            records.push(FeatureRecord {
                geometry: from_geojson_value(&geometry.value)?,
                properties,
            });
        }
    }
    Ok(records)
}

fn string_column(batch: &RecordBatch, index: usize) -> Result<&StringArray, BridgeError> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| BridgeError::Malformed(format!("column {} is not a string column", index)))
}
