use std::collections::BTreeSet;
use std::time::Duration;

use geo::{Geometry, LineString, Point, Polygon};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::config::HarvestConfig;
use crate::grid::BoundingBox;

/// Coordinate reference system of everything OpenStreetMap serves.
pub const WGS84: &str = "EPSG:4326";

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("could not geocode location '{location}': {reason}")]
    Geocoding { location: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(reqwest::Error),
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned HTTP {status}")]
    Status { endpoint: String, status: u16 },
    #[error("malformed provider response: {0}")]
    Decode(String),
}

/// Feature-category identifiers selected by the operator, used unmodified as
/// the per-tile query filter. Ordered so generated queries are deterministic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TagSet(BTreeSet<String>);

impl TagSet {
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl std::fmt::Display for TagSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for tag in self.iter() {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", tag)?;
            first = false;
        }
        Ok(())
    }
}

/// One geometry plus its attribute mapping, as returned by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    pub geometry: Geometry<f64>,
    pub properties: Map<String, Value>,
}

/// The ordered records of one tile fetch together with their CRS.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSet {
    pub crs: String,
    pub records: Vec<FeatureRecord>,
}

/// External feature provider: geocoding plus per-tile bounding-box queries.
///
/// The provider applies its own rate limiting; callers issue at most one
/// outstanding request at a time.
pub trait FeatureProvider {
    fn geocode(&self, location: &str) -> Result<BoundingBox, ProviderError>;

    fn fetch_features(
        &self,
        bbox: &BoundingBox,
        tags: &TagSet,
    ) -> Result<FeatureSet, ProviderError>;
}

/// OpenStreetMap provider: Nominatim for geocoding, Overpass for features.
pub struct OverpassProvider {
    client: reqwest::blocking::Client,
    nominatim_url: String,
    overpass_url: String,
    timeout_secs: u64,
}

impl OverpassProvider {
    pub fn new(config: &HarvestConfig) -> Result<Self, ProviderError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(ProviderError::Client)?;
        Ok(Self {
            client,
            nominatim_url: config.nominatim_url.clone(),
            overpass_url: config.overpass_url.clone(),
            timeout_secs: config.fetch_timeout_secs,
        })
    }
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    boundingbox: Vec<String>,
    #[serde(default)]
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct OverpassResponse {
    elements: Vec<OverpassElement>,
}

#[derive(Debug, Deserialize)]
struct OverpassElement {
    #[serde(rename = "type")]
    kind: String,
    id: u64,
    lat: Option<f64>,
    lon: Option<f64>,
    geometry: Option<Vec<OverpassVertex>>,
    tags: Option<Map<String, Value>>,
}

#[derive(Debug, Deserialize)]
struct OverpassVertex {
    lat: f64,
    lon: f64,
}

impl FeatureProvider for OverpassProvider {
    fn geocode(&self, location: &str) -> Result<BoundingBox, ProviderError> {
        let endpoint = format!("{}/search", self.nominatim_url);
        let response = self
            .client
            .get(&endpoint)
            .query(&[("q", location), ("format", "jsonv2"), ("limit", "1")])
            .send()
            .map_err(|source| ProviderError::Request {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }

        let places: Vec<NominatimPlace> = response
            .json()
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let place = places.first().ok_or_else(|| ProviderError::Geocoding {
            location: location.to_string(),
            reason: "no matching place".to_string(),
        })?;
        debug!(place = %place.display_name, "geocoded location");

        bbox_from_place(place).map_err(|reason| ProviderError::Geocoding {
            location: location.to_string(),
            reason,
        })
    }

    fn fetch_features(
        &self,
        bbox: &BoundingBox,
        tags: &TagSet,
    ) -> Result<FeatureSet, ProviderError> {
        let query = overpass_query(bbox, tags, self.timeout_secs);
        let response = self
            .client
            .post(&self.overpass_url)
            .form(&[("data", query.as_str())])
            .send()
            .map_err(|source| ProviderError::Request {
                endpoint: self.overpass_url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Status {
                endpoint: self.overpass_url.clone(),
                status: status.as_u16(),
            });
        }

        let body: OverpassResponse = response
            .json()
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        Ok(FeatureSet {
            crs: WGS84.to_string(),
            records: records_from_elements(body.elements),
        })
    }
}

/// Nominatim bounding boxes arrive as `[south, north, west, east]` strings.
fn bbox_from_place(place: &NominatimPlace) -> Result<BoundingBox, String> {
    if place.boundingbox.len() != 4 {
        return Err(format!(
            "expected 4 bounding box values, got {}",
            place.boundingbox.len()
        ));
    }
    let mut parsed = [0.0f64; 4];
    for (slot, raw) in parsed.iter_mut().zip(&place.boundingbox) {
        *slot = raw
            .parse()
            .map_err(|_| format!("unparseable bounding box value '{}'", raw))?;
    }
    let [south, north, west, east] = parsed;
    BoundingBox::new(north, south, east, west).map_err(|e| e.to_string())
}

/// Builds the Overpass QL query for one tile: nodes, ways and relations
/// carrying any of the selected tags, with geometry inlined in the response.
fn overpass_query(bbox: &BoundingBox, tags: &TagSet, timeout_secs: u64) -> String {
    let window = format!(
        "({},{},{},{})",
        bbox.south(),
        bbox.west(),
        bbox.north(),
        bbox.east()
    );
    let mut query = format!("[out:json][timeout:{}];\n(\n", timeout_secs);
    for tag in tags.iter() {
        for element in ["node", "way", "relation"] {
            query.push_str(&format!("  {}[\"{}\"]{};\n", element, tag, window));
        }
    }
    query.push_str(");\nout geom;\n");
    query
}

fn records_from_elements(elements: Vec<OverpassElement>) -> Vec<FeatureRecord> {
    let mut records = Vec::with_capacity(elements.len());
    for element in elements {
        let geometry = match element.kind.as_str() {
            "node" => match (element.lat, element.lon) {
                (Some(lat), Some(lon)) => Geometry::Point(Point::new(lon, lat)),
                _ => {
                    debug!(id = element.id, "node without coordinates, skipping");
                    continue;
                }
            },
            "way" => match element.geometry.as_deref() {
                Some(vertices) if vertices.len() >= 2 => way_geometry(vertices),
                _ => {
                    debug!(id = element.id, "way without usable geometry, skipping");
                    continue;
                }
            },
            other => {
                // Relations only arrive when a member matched the tag filter;
                // their member ways are already reported individually.
                debug!(id = element.id, kind = other, "skipping element kind");
                continue;
            }
        };

        let mut properties = element.tags.unwrap_or_default();
        properties.insert("osm_type".to_string(), Value::String(element.kind));
        properties.insert("osm_id".to_string(), Value::from(element.id));
        records.push(FeatureRecord {
            geometry,
            properties,
        });
    }
    records
}

/// Closed ways become polygons, open ways linestrings.
fn way_geometry(vertices: &[OverpassVertex]) -> Geometry<f64> {
    let coords: Vec<_> = vertices.iter().map(|v| (v.lon, v.lat).into()).collect();
    let closed = vertices.len() >= 4
        && vertices[0].lat == vertices[vertices.len() - 1].lat
        && vertices[0].lon == vertices[vertices.len() - 1].lon;
    if closed {
        Geometry::Polygon(Polygon::new(LineString::new(coords), vec![]))
    } else {
        Geometry::LineString(LineString::new(coords))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_set_is_ordered_and_deduplicated() {
        let tags = TagSet::from_tags(["highway", "building", "highway"]);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.to_string(), "building,highway");
    }

    #[test]
    fn overpass_query_lists_every_tag_and_element_kind() {
        let bbox = BoundingBox::new(1.0, 0.0, 1.0, 0.0).unwrap();
        let query = overpass_query(&bbox, &TagSet::from_tags(["highway"]), 25);
        assert!(query.starts_with("[out:json][timeout:25];"));
        assert!(query.contains("node[\"highway\"](0,0,1,1);"));
        assert!(query.contains("way[\"highway\"](0,0,1,1);"));
        assert!(query.contains("relation[\"highway\"](0,0,1,1);"));
        assert!(query.trim_end().ends_with("out geom;"));
    }

    #[test]
    fn nominatim_bounding_box_order_is_south_north_west_east() {
        let place = NominatimPlace {
            boundingbox: vec![
                "59.0".to_string(),
                "60.0".to_string(),
                "10.0".to_string(),
                "11.0".to_string(),
            ],
            display_name: String::new(),
        };
        let bbox = bbox_from_place(&place).unwrap();
        assert_eq!(bbox.north(), 60.0);
        assert_eq!(bbox.south(), 59.0);
        assert_eq!(bbox.east(), 11.0);
        assert_eq!(bbox.west(), 10.0);
    }

    fn element(kind: &str, id: u64) -> OverpassElement {
        OverpassElement {
            kind: kind.to_string(),
            id,
            lat: None,
            lon: None,
            geometry: None,
            tags: None,
        }
    }

    #[test]
    fn nodes_become_points_with_osm_properties() {
        let mut node = element("node", 7);
        node.lat = Some(59.91);
        node.lon = Some(10.75);
        node.tags = Some(
            [("highway".to_string(), Value::String("crossing".to_string()))]
                .into_iter()
                .collect(),
        );

        let records = records_from_elements(vec![node]);
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].geometry,
            Geometry::Point(Point::new(10.75, 59.91))
        );
        assert_eq!(records[0].properties["osm_id"], Value::from(7u64));
        assert_eq!(records[0].properties["highway"], Value::from("crossing"));
    }

    #[test]
    fn closed_ways_become_polygons_and_relations_are_skipped() {
        let ring = vec![
            OverpassVertex { lat: 0.0, lon: 0.0 },
            OverpassVertex { lat: 0.0, lon: 1.0 },
            OverpassVertex { lat: 1.0, lon: 1.0 },
            OverpassVertex { lat: 0.0, lon: 0.0 },
        ];
        let open = vec![
            OverpassVertex { lat: 0.0, lon: 0.0 },
            OverpassVertex { lat: 1.0, lon: 1.0 },
        ];

        let mut closed_way = element("way", 1);
        closed_way.geometry = Some(ring);
        let mut open_way = element("way", 2);
        open_way.geometry = Some(open);
        let relation = element("relation", 3);

        let records = records_from_elements(vec![closed_way, open_way, relation]);
        assert_eq!(records.len(), 2);
        assert!(matches!(records[0].geometry, Geometry::Polygon(_)));
        assert!(matches!(records[1].geometry, Geometry::LineString(_)));
    }
}
