use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ChunkdexError, Result};
use crate::time::{check_interval, epoch_secs_to_ntp, ntp_to_epoch_secs};

/// Surrogate key of a stored chunk. Allocated by the collection, never reused.
pub type ChunkId = u64;

/// Attribute name reserved for the internal join key.
pub const RESERVED_ID_FIELD: &str = "id";

/// Attribute that holds the original text when a collection retains it.
pub const TEXT_FIELD: &str = "text";

/// Attribute map stored alongside each vector.
///
/// A `BTreeMap` keeps projections and serialized rows in a stable order.
pub type Metadata = BTreeMap<String, AttrValue>;

// =============================================================================
// Enums
// =============================================================================

/// Distance metric used by a collection's vector index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    /// `1 - cosine_similarity`, in `[0, 2]`.
    #[default]
    Cosine,
    /// L2 distance.
    Euclidean,
}

impl Metric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::Cosine => "cosine",
            Metric::Euclidean => "euclidean",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "cosine" => Ok(Metric::Cosine),
            "euclidean" => Ok(Metric::Euclidean),
            other => Err(ChunkdexError::Config(format!("Unknown metric: {}", other))),
        }
    }
}

/// Which nearest-neighbor structure backs a collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact linear scan.
    Flat,
    /// Hierarchical navigable small world graph.
    #[default]
    Hnsw,
}

/// Declared type of a metadata attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrType {
    String,
    Int,
    Float,
}

impl AttrType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, AttrType::Int | AttrType::Float)
    }
}

impl fmt::Display for AttrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AttrType::String => "string",
            AttrType::Int => "int",
            AttrType::Float => "float",
        };
        f.write_str(name)
    }
}

/// A typed scalar attribute value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
}

impl AttrValue {
    pub fn attr_type(&self) -> AttrType {
        match self {
            AttrValue::Str(_) => AttrType::String,
            AttrValue::Int(_) => AttrType::Int,
            AttrValue::Float(_) => AttrType::Float,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            AttrValue::Str(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

// =============================================================================
// Schema
// =============================================================================

/// One declared attribute of a collection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: AttrType,
    /// Records may omit optional attributes.
    #[serde(default)]
    pub optional: bool,
}

impl FieldSpec {
    pub fn required(name: &str, ty: AttrType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            optional: false,
        }
    }

    pub fn optional(name: &str, ty: AttrType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            optional: true,
        }
    }
}

/// Declared attribute schema of a collection.
///
/// Every metadata map is validated against it before it reaches either
/// store, so the stores only ever hold well-typed rows.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    fields: Vec<FieldSpec>,
}

impl Schema {
    /// Build a schema, rejecting duplicate names and the reserved `id` field.
    pub fn new(fields: Vec<FieldSpec>) -> Result<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            if field.name.is_empty() {
                return Err(ChunkdexError::Config("Empty field name in schema".into()));
            }
            if field.name == RESERVED_ID_FIELD {
                return Err(ChunkdexError::Config(format!(
                    "Field name '{}' is reserved",
                    RESERVED_ID_FIELD
                )));
            }
            if !seen.insert(field.name.as_str()) {
                return Err(ChunkdexError::Config(format!(
                    "Duplicate field '{}' in schema",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Add the retained-text field unless the schema already declares it.
    pub fn with_text_field(mut self) -> Self {
        if self.field(TEXT_FIELD).is_none() {
            self.fields
                .push(FieldSpec::required(TEXT_FIELD, AttrType::String));
        }
        self
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Check a metadata map against the schema and return its normalized form.
    ///
    /// Integers offered for float fields are widened. Undeclared attributes,
    /// type mismatches and missing required attributes are rejected.
    pub fn validate(&self, metadata: Metadata) -> Result<Metadata> {
        let mut normalized = Metadata::new();

        for (name, value) in metadata {
            let spec = self.field(&name).ok_or_else(|| {
                ChunkdexError::InvalidMetadata(format!("Undeclared attribute '{}'", name))
            })?;

            let value = match (spec.ty, value) {
                (AttrType::String, v @ AttrValue::Str(_)) => v,
                (AttrType::Int, v @ AttrValue::Int(_)) => v,
                (AttrType::Float, v @ AttrValue::Float(_)) => v,
                (AttrType::Float, AttrValue::Int(i)) => AttrValue::Float(i as f64),
                (expected, other) => {
                    return Err(ChunkdexError::InvalidMetadata(format!(
                        "Attribute '{}' expects {}, got {}",
                        name,
                        expected,
                        other.attr_type()
                    )));
                }
            };

            if let AttrValue::Float(f) = value {
                if !f.is_finite() {
                    return Err(ChunkdexError::InvalidMetadata(format!(
                        "Attribute '{}' is not a finite number",
                        name
                    )));
                }
            }

            normalized.insert(name, value);
        }

        if let Some(missing) = self
            .fields
            .iter()
            .find(|f| !f.optional && !normalized.contains_key(&f.name))
        {
            return Err(ChunkdexError::InvalidMetadata(format!(
                "Missing required attribute '{}'",
                missing.name
            )));
        }

        Ok(normalized)
    }
}

// =============================================================================
// Records
// =============================================================================

/// The unit of storage: one embedding plus its attributes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// A time-coded video-summary segment.
///
/// Converts into the attribute layout used by video summarization
/// collections: camelCase chunk identity, presentation timestamps, seconds
/// offsets, and NTP wall-clock strings with their epoch-second float forms
/// for range filters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VideoChunk {
    pub chunk_idx: i64,
    pub stream_id: String,
    pub start_pts: i64,
    pub end_pts: i64,
    /// Offset of the segment start in seconds.
    pub start_time: f64,
    /// Offset of the segment end in seconds.
    pub end_time: f64,
    pub start_ntp: Option<String>,
    pub end_ntp: Option<String>,
}

impl VideoChunk {
    /// Schema fields matching [`VideoChunk::to_metadata`].
    pub fn schema_fields() -> Vec<FieldSpec> {
        vec![
            FieldSpec::required("chunkIdx", AttrType::Int),
            FieldSpec::required("streamId", AttrType::String),
            FieldSpec::required("start_pts", AttrType::Int),
            FieldSpec::required("end_pts", AttrType::Int),
            FieldSpec::required("start_time", AttrType::Float),
            FieldSpec::required("end_time", AttrType::Float),
            FieldSpec::optional("start_ntp", AttrType::String),
            FieldSpec::optional("end_ntp", AttrType::String),
            FieldSpec::optional("start_ntp_float", AttrType::Float),
            FieldSpec::optional("end_ntp_float", AttrType::Float),
        ]
    }

    /// Build the attribute map for this chunk.
    ///
    /// NTP strings are stored in UTC at millisecond precision. Fails with
    /// `InvalidMetadata` if an NTP string cannot be parsed or an interval
    /// ends before it starts.
    pub fn to_metadata(&self) -> Result<Metadata> {
        check_interval("pts", self.start_pts, self.end_pts)?;
        check_interval("time", self.start_time, self.end_time)?;

        let mut meta = Metadata::new();
        meta.insert("chunkIdx".into(), AttrValue::Int(self.chunk_idx));
        meta.insert("streamId".into(), AttrValue::Str(self.stream_id.clone()));
        meta.insert("start_pts".into(), AttrValue::Int(self.start_pts));
        meta.insert("end_pts".into(), AttrValue::Int(self.end_pts));
        meta.insert("start_time".into(), AttrValue::Float(self.start_time));
        meta.insert("end_time".into(), AttrValue::Float(self.end_time));

        let start = self.start_ntp.as_deref().map(ntp_to_epoch_secs).transpose()?;
        let end = self.end_ntp.as_deref().map(ntp_to_epoch_secs).transpose()?;
        if let (Some(start), Some(end)) = (start, end) {
            check_interval("ntp", start, end)?;
        }

        for (prefix, secs) in [("start", start), ("end", end)] {
            if let Some(secs) = secs {
                meta.insert(format!("{}_ntp_float", prefix), AttrValue::Float(secs));
                meta.insert(format!("{}_ntp", prefix), AttrValue::Str(epoch_secs_to_ntp(secs)?));
            }
        }

        Ok(meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, AttrValue)]) -> Metadata {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn sample_schema() -> Schema {
        Schema::new(vec![
            FieldSpec::required("chunkIdx", AttrType::Int),
            FieldSpec::required("start_time", AttrType::Float),
            FieldSpec::optional("camera", AttrType::String),
        ])
        .unwrap()
    }

    #[test]
    fn test_schema_rejects_reserved_id() {
        let result = Schema::new(vec![FieldSpec::required("id", AttrType::Int)]);
        assert!(matches!(result, Err(ChunkdexError::Config(_))));
    }

    #[test]
    fn test_schema_rejects_duplicates() {
        let result = Schema::new(vec![
            FieldSpec::required("a", AttrType::Int),
            FieldSpec::required("a", AttrType::Float),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_widens_int_to_float() {
        let schema = sample_schema();
        let normalized = schema
            .validate(meta(&[
                ("chunkIdx", AttrValue::Int(1)),
                ("start_time", AttrValue::Int(10)),
            ]))
            .unwrap();
        assert_eq!(normalized["start_time"], AttrValue::Float(10.0));
    }

    #[test]
    fn test_validate_rejects_undeclared() {
        let schema = sample_schema();
        let err = schema
            .validate(meta(&[
                ("chunkIdx", AttrValue::Int(1)),
                ("start_time", AttrValue::Float(0.0)),
                ("bogus", AttrValue::Int(2)),
            ]))
            .unwrap_err();
        assert!(matches!(err, ChunkdexError::InvalidMetadata(_)));
    }

    #[test]
    fn test_validate_rejects_type_mismatch() {
        let schema = sample_schema();
        let err = schema
            .validate(meta(&[
                ("chunkIdx", AttrValue::Str("one".into())),
                ("start_time", AttrValue::Float(0.0)),
            ]))
            .unwrap_err();
        assert!(err.to_string().contains("expects int, got string"));
    }

    #[test]
    fn test_validate_rejects_missing_required() {
        let schema = sample_schema();
        let err = schema
            .validate(meta(&[("chunkIdx", AttrValue::Int(1))]))
            .unwrap_err();
        assert!(err.to_string().contains("start_time"));
    }

    #[test]
    fn test_validate_allows_missing_optional() {
        let schema = sample_schema();
        let normalized = schema
            .validate(meta(&[
                ("chunkIdx", AttrValue::Int(1)),
                ("start_time", AttrValue::Float(1.5)),
            ]))
            .unwrap();
        assert!(!normalized.contains_key("camera"));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let schema = sample_schema();
        let result = schema.validate(meta(&[
            ("chunkIdx", AttrValue::Int(1)),
            ("start_time", AttrValue::Float(f64::NAN)),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_with_text_field_is_idempotent() {
        let schema = sample_schema().with_text_field().with_text_field();
        assert_eq!(
            schema.field_names().filter(|n| *n == TEXT_FIELD).count(),
            1
        );
    }

    #[test]
    fn test_attr_value_json_shape() {
        let m = meta(&[
            ("a", AttrValue::Int(3)),
            ("b", AttrValue::Float(2.5)),
            ("c", AttrValue::Str("x".into())),
        ]);
        let json = serde_json::to_string(&m).unwrap();
        assert_eq!(json, r#"{"a":3,"b":2.5,"c":"x"}"#);

        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn test_video_chunk_metadata_matches_schema() {
        let chunk = VideoChunk {
            chunk_idx: 2,
            stream_id: "cam-1".into(),
            start_pts: 60_000_000_000,
            end_pts: 120_000_000_000,
            start_time: 60.0,
            end_time: 120.0,
            start_ntp: Some("2024-05-30T01:41:25.000Z".into()),
            end_ntp: Some("2024-05-30T01:42:25.000Z".into()),
        };
        let schema = Schema::new(VideoChunk::schema_fields()).unwrap();
        let normalized = schema.validate(chunk.to_metadata().unwrap()).unwrap();

        let start = normalized["start_ntp_float"].as_f64().unwrap();
        let end = normalized["end_ntp_float"].as_f64().unwrap();
        assert!((end - start - 60.0).abs() < 1e-6);
        assert_eq!(normalized["chunkIdx"], AttrValue::Int(2));
    }

    #[test]
    fn test_video_chunk_without_ntp() {
        let chunk = VideoChunk {
            chunk_idx: 0,
            stream_id: "file".into(),
            ..Default::default()
        };
        let metadata = chunk.to_metadata().unwrap();
        assert!(!metadata.contains_key("start_ntp"));
        assert!(!metadata.contains_key("start_ntp_float"));
    }

    #[test]
    fn test_video_chunk_bad_ntp() {
        let chunk = VideoChunk {
            start_ntp: Some("yesterday".into()),
            ..Default::default()
        };
        assert!(matches!(
            chunk.to_metadata(),
            Err(ChunkdexError::InvalidMetadata(_))
        ));
    }

    #[test]
    fn test_video_chunk_ntp_normalized_to_utc_millis() {
        let chunk = VideoChunk {
            start_ntp: Some("2024-05-30T03:41:25+02:00".into()),
            end_ntp: Some("2024-05-30T01:42:25.1234Z".into()),
            ..Default::default()
        };
        let metadata = chunk.to_metadata().unwrap();
        assert_eq!(
            metadata["start_ntp"],
            AttrValue::Str("2024-05-30T01:41:25.000Z".into())
        );
        assert_eq!(
            metadata["end_ntp"],
            AttrValue::Str("2024-05-30T01:42:25.123Z".into())
        );
    }

    #[test]
    fn test_video_chunk_rejects_inverted_intervals() {
        let inverted_time = VideoChunk {
            start_time: 120.0,
            end_time: 60.0,
            ..Default::default()
        };
        let inverted_pts = VideoChunk {
            start_pts: 2_000,
            end_pts: 1_000,
            ..Default::default()
        };
        let inverted_ntp = VideoChunk {
            start_ntp: Some("2024-05-30T01:42:25Z".into()),
            end_ntp: Some("2024-05-30T01:41:25Z".into()),
            ..Default::default()
        };
        for chunk in [inverted_time, inverted_pts, inverted_ntp] {
            assert!(matches!(
                chunk.to_metadata(),
                Err(ChunkdexError::InvalidMetadata(_))
            ));
        }
    }

    #[test]
    fn test_metric_parse_round_trip() {
        for metric in [Metric::Cosine, Metric::Euclidean] {
            assert_eq!(Metric::parse(metric.as_str()).unwrap(), metric);
        }
        assert!(Metric::parse("manhattan").is_err());
    }
}
