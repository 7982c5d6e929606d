//! Backend fetch specifications and the capability tags that route them.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use url::Url;

use crate::batch::{identifiers_to_json, BatchIdentifiers, InMemoryDataset};
use crate::error::{BatchError, Result};
use crate::sampling::SamplingMethod;
use crate::splitting::SplitterMethod;
use crate::sql::{quote_ident, SqlDialect};

/// Engine family a batch spec may be dispatched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    InMemory,
    Distributed,
    Relational,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Capability::InMemory => "in_memory",
            Capability::Distributed => "distributed",
            Capability::Relational => "relational",
        })
    }
}

pub fn display_capabilities(capabilities: &[Capability]) -> String {
    capabilities
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Optionally schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableRef {
    #[serde(default)]
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: Option<String>, table: impl Into<String>) -> Self {
        Self {
            schema,
            table: table.into(),
        }
    }

    /// Parse `schema.table` or a bare `table`.
    pub fn parse(name: &str) -> Self {
        match name.split_once('.') {
            Some((schema, table)) => Self::new(Some(schema.to_string()), table),
            None => Self::new(None, name),
        }
    }

    /// Quoted reference usable in a FROM clause.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => quote_ident(&self.table),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => f.write_str(&self.table),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReaderMethod {
    Csv,
    Parquet,
    Json,
}

impl ReaderMethod {
    /// Guess the reader from a path or object key extension.
    pub fn guess(path: &str) -> Result<Self> {
        let ext = Path::new(path)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match ext.as_deref() {
            Some("csv") | Some("tsv") => Ok(ReaderMethod::Csv),
            Some("parquet") => Ok(ReaderMethod::Parquet),
            Some("json") | Some("ndjson") | Some("jsonl") => Ok(ReaderMethod::Json),
            Some("gz") => Err(BatchError::InvalidBatchSpec(format!(
                "compressed input '{}' is not supported; pass an uncompressed file",
                path
            ))),
            _ => Err(BatchError::InvalidBatchSpec(format!(
                "unable to determine reader method for '{}'",
                path
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReaderOptions {
    #[serde(default = "default_has_header")]
    pub has_header: bool,
    #[serde(default)]
    pub delimiter: Option<char>,
}

fn default_has_header() -> bool {
    true
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            has_header: true,
            delimiter: None,
        }
    }
}

impl ReaderOptions {
    /// Delimiter to use for `path`: explicit, tab for `.tsv`, comma otherwise.
    pub fn delimiter_for(&self, path: &str) -> u8 {
        match self.delimiter {
            Some(c) if c.is_ascii() => c as u8,
            _ if path.to_ascii_lowercase().ends_with(".tsv") => b'\t',
            _ => b',',
        }
    }
}

/// Where a batch's rows come from.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecTarget {
    Path {
        path: String,
        reader_method: Option<ReaderMethod>,
        reader_options: ReaderOptions,
    },
    S3 {
        uri: String,
        reader_method: Option<ReaderMethod>,
        reader_options: ReaderOptions,
    },
    InMemory(#[serde(serialize_with = "summarize_dataset")] InMemoryDataset),
    Table(TableRef),
    Query { query: String },
}

fn summarize_dataset<S: Serializer>(
    dataset: &InMemoryDataset,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error> {
    let summary = serde_json::json!({
        "columns": dataset
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect::<Vec<_>>(),
        "rows": dataset.num_rows(),
    });
    summary.serialize(serializer)
}

impl SpecTarget {
    pub fn path(path: impl Into<String>) -> Self {
        SpecTarget::Path {
            path: path.into(),
            reader_method: None,
            reader_options: ReaderOptions::default(),
        }
    }

    pub fn query(query: impl Into<String>) -> Self {
        SpecTarget::Query {
            query: query.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SpecTarget::Path { .. } => "path",
            SpecTarget::S3 { .. } => "s3",
            SpecTarget::InMemory(_) => "in_memory",
            SpecTarget::Table(_) => "table",
            SpecTarget::Query { .. } => "query",
        }
    }

    /// Engine families able to consume this target.
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            SpecTarget::Path { .. } | SpecTarget::S3 { .. } | SpecTarget::InMemory(_) => {
                vec![Capability::InMemory, Capability::Distributed]
            }
            SpecTarget::Table(_) | SpecTarget::Query { .. } => vec![
                Capability::InMemory,
                Capability::Distributed,
                Capability::Relational,
            ],
        }
    }

    /// Reader for file targets, explicit or guessed from the extension.
    pub fn resolved_reader_method(&self) -> Result<Option<ReaderMethod>> {
        match self {
            SpecTarget::Path {
                path,
                reader_method,
                ..
            } => reader_method.map_or_else(|| ReaderMethod::guess(path), Ok).map(Some),
            SpecTarget::S3 {
                uri,
                reader_method,
                ..
            } => reader_method.map_or_else(|| ReaderMethod::guess(uri), Ok).map(Some),
            _ => Ok(None),
        }
    }
}

/// Backend fetch specification for one batch.
#[derive(Debug, Clone, Serialize)]
pub struct BatchSpec {
    pub data_asset_name: String,
    pub batch_identifiers: BatchIdentifiers,
    pub target: SpecTarget,
    pub sampling: Option<SamplingMethod>,
    pub splitter: Option<SplitterMethod>,
}

impl BatchSpec {
    pub fn new(
        data_asset_name: impl Into<String>,
        batch_identifiers: BatchIdentifiers,
        target: SpecTarget,
    ) -> Self {
        Self {
            data_asset_name: data_asset_name.into(),
            batch_identifiers,
            target,
            sampling: None,
            splitter: None,
        }
    }

    pub fn with_sampling(mut self, sampling: Option<SamplingMethod>) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_splitter(mut self, splitter: Option<SplitterMethod>) -> Self {
        self.splitter = splitter;
        self
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        self.target.capabilities()
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.target {
            SpecTarget::Path { path, .. } => {
                if path.trim().is_empty() {
                    return Err(BatchError::InvalidBatchSpec(
                        "path batch spec requires a non-empty path".to_string(),
                    ));
                }
                self.target.resolved_reader_method()?;
            }
            SpecTarget::S3 { uri, .. } => {
                parse_s3_uri(uri)?;
                self.target.resolved_reader_method()?;
            }
            SpecTarget::InMemory(_) => {}
            SpecTarget::Table(table) => {
                if table.table.trim().is_empty() {
                    return Err(BatchError::InvalidBatchSpec(
                        "table batch spec requires a table name".to_string(),
                    ));
                }
            }
            SpecTarget::Query { query } => {
                if query.trim().is_empty() {
                    return Err(BatchError::InvalidBatchSpec(
                        "query batch spec requires query text".to_string(),
                    ));
                }
            }
        }
        if let Some(sampling) = &self.sampling {
            sampling.validate()?;
        }
        if let Some(splitter) = &self.splitter {
            splitter.validate()?;
        }
        Ok(())
    }

    /// Restrict `base` to this spec's partition when a splitter is set.
    pub fn split_query(&self, base: &str, dialect: SqlDialect) -> Result<String> {
        match &self.splitter {
            Some(splitter) => splitter.apply(base, &self.batch_identifiers, dialect),
            None => Ok(base.to_string()),
        }
    }

    /// Apply sampling on top of an already split query.
    pub fn sample_query(
        &self,
        query: &str,
        columns: &[String],
        dialect: SqlDialect,
    ) -> Result<String> {
        match &self.sampling {
            Some(sampling) => sampling.apply(query, columns, dialect),
            None => Ok(query.to_string()),
        }
    }

    /// Stable content id for markers and logs.
    pub fn id(&self) -> String {
        let json = serde_json::json!({
            "data_asset_name": self.data_asset_name,
            "batch_identifiers": identifiers_to_json(&self.batch_identifiers),
            "target": self.target,
            "sampling": self.sampling,
            "splitter": self.splitter,
        });
        format!("{:x}", Sha256::digest(json.to_string().as_bytes()))
    }

    /// Validate a loose kwargs map into a typed spec.
    ///
    /// Recognised shapes are keyed by `path`, `s3`, `table` (with optional
    /// `schema`) and `query`. `sampling_method`/`sampling_kwargs` and
    /// `splitter_method`/`splitter_kwargs` attach policy.
    pub fn from_kwargs(data_asset_name: &str, kwargs: &Map<String, Value>) -> Result<Self> {
        let reader_method = match kwargs.get("reader_method") {
            None | Some(Value::Null) => None,
            Some(v) => Some(from_kwarg::<ReaderMethod>("reader_method", v)?),
        };
        let reader_options = match kwargs.get("reader_options") {
            None | Some(Value::Null) => ReaderOptions::default(),
            Some(v) => from_kwarg::<ReaderOptions>("reader_options", v)?,
        };

        let target = if let Some(path) = kwargs.get("path") {
            SpecTarget::Path {
                path: string_kwarg("path", path)?,
                reader_method,
                reader_options,
            }
        } else if let Some(uri) = kwargs.get("s3") {
            SpecTarget::S3 {
                uri: string_kwarg("s3", uri)?,
                reader_method,
                reader_options,
            }
        } else if let Some(table) = kwargs.get("table") {
            let schema = match kwargs.get("schema") {
                None | Some(Value::Null) => None,
                Some(v) => Some(string_kwarg("schema", v)?),
            };
            SpecTarget::Table(TableRef::new(schema, string_kwarg("table", table)?))
        } else if let Some(query) = kwargs.get("query") {
            SpecTarget::query(string_kwarg("query", query)?)
        } else if kwargs.contains_key("dataset") {
            return Err(BatchError::InvalidBatchKwargs(
                "in-memory datasets cannot be described by kwargs; pass them as \
                 RuntimeParameters::BatchData"
                    .to_string(),
            ));
        } else {
            return Err(BatchError::InvalidBatchKwargs(
                "batch kwargs require one of 'path', 's3', 'table' or 'query'".to_string(),
            ));
        };

        let batch_identifiers = match kwargs.get("batch_identifiers") {
            None | Some(Value::Null) => BatchIdentifiers::new(),
            Some(v) => from_kwarg::<BatchIdentifiers>("batch_identifiers", v)?,
        };
        let sampling = match kwargs.get("sampling_method") {
            None | Some(Value::Null) => None,
            Some(name) => Some(SamplingMethod::from_name(
                &string_kwarg("sampling_method", name)?,
                kwargs.get("sampling_kwargs"),
            )?),
        };
        let splitter = match kwargs.get("splitter_method") {
            None | Some(Value::Null) => None,
            Some(name) => Some(SplitterMethod::from_name(
                &string_kwarg("splitter_method", name)?,
                kwargs.get("splitter_kwargs"),
            )?),
        };

        let spec = BatchSpec::new(data_asset_name, batch_identifiers, target)
            .with_sampling(sampling)
            .with_splitter(splitter);
        spec.validate()?;
        Ok(spec)
    }
}

fn string_kwarg(key: &str, value: &Value) -> Result<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Ok(s.clone()),
        other => Err(BatchError::InvalidBatchKwargs(format!(
            "'{}' must be a non-empty string, got {}",
            key, other
        ))),
    }
}

fn from_kwarg<T: serde::de::DeserializeOwned>(key: &str, value: &Value) -> Result<T> {
    serde_json::from_value(value.clone())
        .map_err(|e| BatchError::InvalidBatchKwargs(format!("invalid '{}': {}", key, e)))
}

/// Parse an `s3://bucket/key` URI into (bucket, key).
pub fn parse_s3_uri(uri: &str) -> Result<(String, String)> {
    let invalid = |reason: &str| BatchError::InvalidBatchSpec(format!("{} in '{}'", reason, uri));
    let url = Url::parse(uri).map_err(|_| invalid("invalid S3 URI"))?;
    if url.scheme() != "s3" {
        return Err(invalid("URI scheme must be s3://"));
    }
    let bucket = url
        .host_str()
        .filter(|b| !b.is_empty())
        .ok_or_else(|| invalid("missing bucket"))?
        .to_string();
    let key = url.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return Err(invalid("missing object key"));
    }
    Ok((bucket, key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::IdentifierValue;
    use serde_json::json;

    fn kwargs(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("kwargs must be an object"),
        }
    }

    #[test]
    fn test_capabilities_per_target() {
        assert_eq!(
            SpecTarget::path("/data/a.csv").capabilities(),
            vec![Capability::InMemory, Capability::Distributed]
        );
        let table = SpecTarget::Table(TableRef::new(None, "trips"));
        assert!(table.capabilities().contains(&Capability::Relational));
        let spec = BatchSpec::new("a", BatchIdentifiers::new(), SpecTarget::path("/x.csv"));
        assert!(!spec.supports(Capability::Relational));
        assert!(spec.supports(Capability::Distributed));
    }

    #[test]
    fn test_display_capabilities() {
        assert_eq!(
            display_capabilities(&[Capability::InMemory, Capability::Relational]),
            "in_memory, relational"
        );
    }

    #[test]
    fn test_table_ref() {
        let t = TableRef::parse("public.trips");
        assert_eq!(t.schema.as_deref(), Some("public"));
        assert_eq!(t.quoted(), "\"public\".\"trips\"");
        assert_eq!(t.to_string(), "public.trips");
        assert_eq!(TableRef::parse("trips").quoted(), "\"trips\"");
    }

    #[test]
    fn test_reader_method_guess() {
        assert_eq!(ReaderMethod::guess("a/b.CSV").unwrap(), ReaderMethod::Csv);
        assert_eq!(ReaderMethod::guess("x.tsv").unwrap(), ReaderMethod::Csv);
        assert_eq!(ReaderMethod::guess("x.parquet").unwrap(), ReaderMethod::Parquet);
        assert_eq!(ReaderMethod::guess("x.jsonl").unwrap(), ReaderMethod::Json);
        assert!(ReaderMethod::guess("x.csv.gz").is_err());
        assert!(ReaderMethod::guess("x").is_err());
    }

    #[test]
    fn test_delimiter_for() {
        let opts = ReaderOptions::default();
        assert_eq!(opts.delimiter_for("a.tsv"), b'\t');
        assert_eq!(opts.delimiter_for("a.csv"), b',');
        let opts = ReaderOptions {
            has_header: true,
            delimiter: Some(';'),
        };
        assert_eq!(opts.delimiter_for("a.tsv"), b';');
    }

    #[test]
    fn test_validate_rejects_empty_targets() {
        let empty_path = BatchSpec::new("a", BatchIdentifiers::new(), SpecTarget::path(" "));
        assert!(matches!(
            empty_path.validate(),
            Err(BatchError::InvalidBatchSpec(_))
        ));
        let empty_query = BatchSpec::new("a", BatchIdentifiers::new(), SpecTarget::query(""));
        assert!(empty_query.validate().is_err());
        let bad_s3 = BatchSpec::new(
            "a",
            BatchIdentifiers::new(),
            SpecTarget::S3 {
                uri: "s3://bucket/".into(),
                reader_method: None,
                reader_options: ReaderOptions::default(),
            },
        );
        assert!(bad_s3.validate().is_err());
    }

    #[test]
    fn test_from_kwargs_path() {
        let spec = BatchSpec::from_kwargs(
            "trips",
            &kwargs(json!({"path": "/data/trips.csv", "reader_method": "csv"})),
        )
        .unwrap();
        match spec.target {
            SpecTarget::Path {
                path,
                reader_method,
                ..
            } => {
                assert_eq!(path, "/data/trips.csv");
                assert_eq!(reader_method, Some(ReaderMethod::Csv));
            }
            other => panic!("expected path target, got {:?}", other),
        }
    }

    #[test]
    fn test_from_kwargs_table_with_policy() {
        let spec = BatchSpec::from_kwargs(
            "trips",
            &kwargs(json!({
                "table": "trips",
                "schema": "public",
                "batch_identifiers": {"vendor": 2},
                "sampling_method": "sample_using_random",
                "sampling_kwargs": {"p": 0.25},
                "splitter_method": "split_on_column_value",
                "splitter_kwargs": {"column_name": "vendor"}
            })),
        )
        .unwrap();
        assert!(matches!(spec.target, SpecTarget::Table(_)));
        assert_eq!(spec.batch_identifiers["vendor"], IdentifierValue::Int(2));
        assert_eq!(spec.sampling, Some(SamplingMethod::Random { p: 0.25, seed: 0 }));
        assert_eq!(
            spec.splitter,
            Some(SplitterMethod::ColumnValue {
                column: "vendor".into()
            })
        );
        assert_eq!(
            spec.split_query("SELECT * FROM \"trips\"", SqlDialect::Postgres).unwrap(),
            "SELECT * FROM (SELECT * FROM \"trips\") AS split_src WHERE \"vendor\" = 2"
        );
    }

    #[test]
    fn test_from_kwargs_missing_elements() {
        assert!(matches!(
            BatchSpec::from_kwargs("a", &kwargs(json!({"reader_method": "csv"}))),
            Err(BatchError::InvalidBatchKwargs(_))
        ));
        assert!(matches!(
            BatchSpec::from_kwargs("a", &kwargs(json!({"dataset": [1, 2]}))),
            Err(BatchError::InvalidBatchKwargs(_))
        ));
        assert!(matches!(
            BatchSpec::from_kwargs("a", &kwargs(json!({"query": 5}))),
            Err(BatchError::InvalidBatchKwargs(_))
        ));
    }

    #[test]
    fn test_spec_id_is_stable() {
        let a = BatchSpec::new("a", BatchIdentifiers::new(), SpecTarget::query("SELECT 1"));
        let b = BatchSpec::new("a", BatchIdentifiers::new(), SpecTarget::query("SELECT 1"));
        let c = BatchSpec::new("a", BatchIdentifiers::new(), SpecTarget::query("SELECT 2"));
        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_parse_s3_uri() {
        let (bucket, key) = parse_s3_uri("s3://data/year=2024/month=01/data.parquet").unwrap();
        assert_eq!(bucket, "data");
        assert_eq!(key, "year=2024/month=01/data.parquet");
        assert!(parse_s3_uri("s3://bucket/").is_err());
        assert!(parse_s3_uri("http://bucket/key").is_err());
    }
}
