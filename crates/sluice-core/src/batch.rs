//! Batch identity types: requests, definitions, fingerprints and markers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{BatchError, Result};
use crate::filter::FilterCondition;
use crate::sampling::SamplingMethod;

// ---------------------------------------------------------------------------
// Identifier values
// ---------------------------------------------------------------------------

/// Value of one partition identifier.
///
/// Totally ordered (variant first, then value) so definition lists sort
/// deterministically. Non-integral JSON numbers are carried as their
/// decimal text.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(untagged)]
pub enum IdentifierValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
}

impl IdentifierValue {
    pub fn is_null(&self) -> bool {
        matches!(self, IdentifierValue::Null)
    }

    pub fn to_json(&self) -> Value {
        match self {
            IdentifierValue::Null => Value::Null,
            IdentifierValue::Bool(b) => Value::Bool(*b),
            IdentifierValue::Int(i) => Value::from(*i),
            IdentifierValue::Str(s) => Value::String(s.clone()),
        }
    }

    /// Loose equality: `Int(7)` and `Str("7")` are the same identifier.
    pub fn loosely_equals(&self, other: &IdentifierValue) -> bool {
        if self == other {
            return true;
        }
        !self.is_null() && !other.is_null() && self.to_string() == other.to_string()
    }
}

impl TryFrom<Value> for IdentifierValue {
    type Error = BatchError;

    fn try_from(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(IdentifierValue::Null),
            Value::Bool(b) => Ok(IdentifierValue::Bool(b)),
            Value::Number(n) => Ok(match n.as_i64() {
                Some(i) => IdentifierValue::Int(i),
                None => IdentifierValue::Str(n.to_string()),
            }),
            Value::String(s) => Ok(IdentifierValue::Str(s)),
            other => Err(BatchError::InvalidBatchKwargs(format!(
                "batch identifier values must be scalars, got {}",
                other
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for IdentifierValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        IdentifierValue::try_from(value).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for IdentifierValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentifierValue::Null => f.write_str("null"),
            IdentifierValue::Bool(b) => write!(f, "{}", b),
            IdentifierValue::Int(i) => write!(f, "{}", i),
            IdentifierValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for IdentifierValue {
    fn from(s: &str) -> Self {
        IdentifierValue::Str(s.to_string())
    }
}

impl From<String> for IdentifierValue {
    fn from(s: String) -> Self {
        IdentifierValue::Str(s)
    }
}

impl From<i64> for IdentifierValue {
    fn from(i: i64) -> Self {
        IdentifierValue::Int(i)
    }
}

impl From<i32> for IdentifierValue {
    fn from(i: i32) -> Self {
        IdentifierValue::Int(i as i64)
    }
}

impl From<bool> for IdentifierValue {
    fn from(b: bool) -> Self {
        IdentifierValue::Bool(b)
    }
}

/// Fully resolved partition identifiers, keyed by partition key.
pub type BatchIdentifiers = BTreeMap<String, IdentifierValue>;

pub(crate) fn identifiers_to_json(identifiers: &BatchIdentifiers) -> Value {
    Value::Object(
        identifiers
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect(),
    )
}

/// Selects partitions for one identifier key: an exact value or a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdentifierSelector {
    Predicate(FilterCondition),
    Value(IdentifierValue),
}

impl IdentifierSelector {
    pub fn matches(&self, candidate: &IdentifierValue) -> bool {
        match self {
            IdentifierSelector::Value(v) => v.loosely_equals(candidate),
            IdentifierSelector::Predicate(condition) => condition.matches(candidate),
        }
    }
}

macro_rules! selector_from_value {
    ($($t:ty),*) => {
        $(
            impl From<$t> for IdentifierSelector {
                fn from(value: $t) -> Self {
                    IdentifierSelector::Value(value.into())
                }
            }
        )*
    };
}

selector_from_value!(IdentifierValue, &str, String, i64, i32, bool);

impl From<FilterCondition> for IdentifierSelector {
    fn from(condition: FilterCondition) -> Self {
        IdentifierSelector::Predicate(condition)
    }
}

// ---------------------------------------------------------------------------
// Runtime parameters
// ---------------------------------------------------------------------------

/// Record batches handed to a runtime connector directly.
#[derive(Clone)]
pub struct InMemoryDataset {
    schema: SchemaRef,
    batches: Arc<Vec<RecordBatch>>,
}

impl InMemoryDataset {
    pub fn try_new(schema: SchemaRef, batches: Vec<RecordBatch>) -> Result<Self> {
        if let Some(bad) = batches.iter().find(|b| b.schema() != schema) {
            return Err(BatchError::InvalidBatchKwargs(format!(
                "in-memory dataset batch schema {:?} does not match dataset schema {:?}",
                bad.schema(),
                schema
            )));
        }
        Ok(Self {
            schema,
            batches: Arc::new(batches),
        })
    }

    /// Build from non-empty batches, taking the schema of the first one.
    pub fn from_batches(batches: Vec<RecordBatch>) -> Result<Self> {
        let schema = batches
            .first()
            .map(|b| b.schema())
            .ok_or_else(|| {
                BatchError::InvalidBatchKwargs(
                    "in-memory dataset requires at least one record batch".to_string(),
                )
            })?;
        Self::try_new(schema, batches)
    }

    pub fn schema(&self) -> SchemaRef {
        Arc::clone(&self.schema)
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }

    pub fn num_rows(&self) -> usize {
        self.batches.iter().map(|b| b.num_rows()).sum()
    }
}

impl fmt::Debug for InMemoryDataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryDataset")
            .field("columns", &self.schema.fields().len())
            .field("batches", &self.batches.len())
            .field("rows", &self.num_rows())
            .finish()
    }
}

/// Ad hoc data reference supplied with a runtime batch request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeParameters {
    Query(String),
    Path(String),
    #[serde(skip)]
    BatchData(InMemoryDataset),
}

// ---------------------------------------------------------------------------
// Batch request
// ---------------------------------------------------------------------------

/// Position or half-open slice over an ordered definition list. Negative
/// values count from the end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BatchIndex {
    Position(i64),
    Slice {
        #[serde(default)]
        start: Option<i64>,
        #[serde(default)]
        end: Option<i64>,
    },
}

impl BatchIndex {
    pub fn apply<T>(&self, items: Vec<T>) -> Vec<T> {
        let len = items.len() as i64;
        let resolve = |i: i64| -> i64 {
            let i = if i < 0 { len + i } else { i };
            i.clamp(0, len)
        };
        let (start, end) = match *self {
            BatchIndex::Position(i) => {
                let idx = if i < 0 { len + i } else { i };
                if idx < 0 || idx >= len {
                    return Vec::new();
                }
                (idx, idx + 1)
            }
            BatchIndex::Slice { start, end } => {
                (resolve(start.unwrap_or(0)), resolve(end.unwrap_or(len)))
            }
        };
        if start >= end {
            return Vec::new();
        }
        items
            .into_iter()
            .skip(start as usize)
            .take((end - start) as usize)
            .collect()
    }
}

/// A declarative request for one or more batches of a named asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub datasource_name: String,
    pub data_connector_name: String,
    pub data_asset_name: String,
    #[serde(default)]
    pub batch_identifiers: BTreeMap<String, IdentifierSelector>,
    #[serde(default)]
    pub runtime_parameters: Option<RuntimeParameters>,
    /// Applied after `index`.
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub index: Option<BatchIndex>,
    /// Overrides the asset's configured sampling.
    #[serde(default)]
    pub sampling: Option<SamplingMethod>,
}

impl BatchRequest {
    pub fn new(
        datasource_name: impl Into<String>,
        data_connector_name: impl Into<String>,
        data_asset_name: impl Into<String>,
    ) -> Self {
        Self {
            datasource_name: datasource_name.into(),
            data_connector_name: data_connector_name.into(),
            data_asset_name: data_asset_name.into(),
            ..Default::default()
        }
    }

    pub fn with_identifier(
        mut self,
        key: impl Into<String>,
        selector: impl Into<IdentifierSelector>,
    ) -> Self {
        self.batch_identifiers.insert(key.into(), selector.into());
        self
    }

    pub fn with_predicate(mut self, key: impl Into<String>, condition: FilterCondition) -> Self {
        self.batch_identifiers
            .insert(key.into(), IdentifierSelector::Predicate(condition));
        self
    }

    pub fn with_runtime_parameters(mut self, parameters: RuntimeParameters) -> Self {
        self.runtime_parameters = Some(parameters);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_index(mut self, index: BatchIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_sampling(mut self, sampling: SamplingMethod) -> Self {
        self.sampling = Some(sampling);
        self
    }

    /// Check required names and predicate shapes.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("datasource_name", &self.datasource_name),
            ("data_connector_name", &self.data_connector_name),
            ("data_asset_name", &self.data_asset_name),
        ] {
            if value.trim().is_empty() {
                return Err(BatchError::InvalidBatchKwargs(format!(
                    "batch request requires a non-empty {}",
                    field
                )));
            }
        }
        for (key, selector) in &self.batch_identifiers {
            if let IdentifierSelector::Predicate(condition) = selector {
                condition.validate(key)?;
            }
        }
        if let Some(sampling) = &self.sampling {
            sampling.validate()?;
        }
        Ok(())
    }

    /// True when every requested key is present and selected.
    pub fn matches(&self, identifiers: &BatchIdentifiers) -> bool {
        self.batch_identifiers.iter().all(|(key, selector)| {
            identifiers
                .get(key)
                .is_some_and(|candidate| selector.matches(candidate))
        })
    }

    /// The identifiers as exact values, if no predicate was given.
    pub fn exact_identifiers(&self) -> Option<BatchIdentifiers> {
        self.batch_identifiers
            .iter()
            .map(|(key, selector)| match selector {
                IdentifierSelector::Value(v) => Some((key.clone(), v.clone())),
                IdentifierSelector::Predicate(_) => None,
            })
            .collect()
    }

    /// Apply `index` then `limit` to an ordered definition list.
    pub fn select<T>(&self, items: Vec<T>) -> Vec<T> {
        let items = match &self.index {
            Some(index) => index.apply(items),
            None => items,
        };
        match self.limit {
            Some(limit) => items.into_iter().take(limit).collect(),
            None => items,
        }
    }

    /// Compact rendering of the requested identifiers for error context.
    pub fn describe_identifiers(&self) -> String {
        serde_json::to_string(&self.batch_identifiers).unwrap_or_else(|_| "{}".to_string())
    }
}

// ---------------------------------------------------------------------------
// Batch definition
// ---------------------------------------------------------------------------

/// Identifies exactly one reproducible batch within a connector's inventory.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BatchDefinition {
    pub datasource_name: String,
    pub data_connector_name: String,
    pub data_asset_name: String,
    pub batch_identifiers: BatchIdentifiers,
}

impl BatchDefinition {
    pub fn new(
        datasource_name: impl Into<String>,
        data_connector_name: impl Into<String>,
        data_asset_name: impl Into<String>,
        batch_identifiers: BatchIdentifiers,
    ) -> Self {
        Self {
            datasource_name: datasource_name.into(),
            data_connector_name: data_connector_name.into(),
            data_asset_name: data_asset_name.into(),
            batch_identifiers,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "datasource_name": self.datasource_name,
            "data_connector_name": self.data_connector_name,
            "data_asset_name": self.data_asset_name,
            "batch_identifiers": identifiers_to_json(&self.batch_identifiers),
        })
    }

    /// Stable sha256 id of the definition's canonical JSON form.
    pub fn id(&self) -> String {
        format!("{:x}", Sha256::digest(self.to_json().to_string().as_bytes()))
    }
}

impl fmt::Display for BatchDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{} {}",
            self.datasource_name,
            self.data_connector_name,
            self.data_asset_name,
            identifiers_to_json(&self.batch_identifiers)
        )
    }
}

// ---------------------------------------------------------------------------
// Fingerprints and markers
// ---------------------------------------------------------------------------

/// Partition id plus content hash; detects whether recorded batch metadata
/// still describes the same underlying data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchFingerprint {
    pub partition_id: String,
    pub fingerprint: String,
}

impl BatchFingerprint {
    pub fn new(partition_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            partition_id: partition_id.into(),
            fingerprint: fingerprint.into(),
        }
    }

    pub fn to_tuple(&self) -> (&str, &str) {
        (&self.partition_id, &self.fingerprint)
    }
}

/// Provenance recorded at fetch time. Only engines construct these; the
/// load time cannot be re-derived later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMarkers {
    #[serde(alias = "ge_load_time")]
    pub load_time: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BatchMarkers {
    pub fn new(load_time: DateTime<Utc>) -> Self {
        Self {
            load_time,
            extra: BTreeMap::new(),
        }
    }

    /// Markers stamped with the current time.
    pub fn stamp() -> Self {
        Self::new(Utc::now())
    }

    pub fn with_marker(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.extra.get(key)
    }

    /// Parse the loose map form. Fails when `load_time` (or its older
    /// spelling `ge_load_time`) is missing.
    pub fn from_map(map: serde_json::Map<String, Value>) -> Result<Self> {
        if !map.contains_key("load_time") && !map.contains_key("ge_load_time") {
            return Err(BatchError::InvalidBatchId(
                "BatchMarkers requires a load_time".to_string(),
            ));
        }
        serde_json::from_value(Value::Object(map))
            .map_err(|e| BatchError::InvalidBatchId(format!("malformed batch markers: {}", e)))
    }
}
