//! Session plumbing shared by the DataFusion and Ballista engines.
//!
//! Both engines speak DataFusion SQL against a `SessionContext`: file and
//! in-memory targets are registered under a unique source name, then the
//! spec's splitter and sampling are rendered on top of that source.

use std::sync::Arc;

use arrow::array::Array;
use arrow::util::display::array_value_to_string;
use datafusion::datasource::MemTable;
use datafusion::prelude::{
    CsvReadOptions, NdJsonReadOptions, ParquetReadOptions, SessionContext,
};
use datafusion::scalar::ScalarValue;
use sluice_core::sql::quote_ident;
use sluice_core::{
    parse_s3_uri, BatchError, BatchIdentifiers, BatchSpec, IdentifierValue, ReaderMethod,
    ReaderOptions, Result, SpecTarget, SplitterMethod, SqlDialect, TableRef,
};
use tracing::{debug, info};
use url::Url;

use crate::s3::S3Config;

const SOURCE_PREFIX: &str = "__sluice_src_";
pub(crate) const BATCH_PREFIX: &str = "sluice_batch_";

/// A spec rendered against a session.
pub(crate) struct PlannedQuery {
    pub sql: String,
    /// Temporary table registered for file or in-memory targets.
    pub source: Option<String>,
}

pub(crate) struct SessionBackend {
    name: String,
    ctx: SessionContext,
    s3: Option<S3Config>,
}

impl SessionBackend {
    pub fn new(name: impl Into<String>, ctx: SessionContext, s3: Option<S3Config>) -> Self {
        Self {
            name: name.into(),
            ctx,
            s3,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn error(&self, err: impl std::fmt::Display) -> BatchError {
        BatchError::engine(&self.name, err)
    }

    /// Register the spec's target if needed and return the base selectable.
    async fn register_source(&self, spec: &BatchSpec) -> Result<(String, Option<String>)> {
        let source = unique_name(SOURCE_PREFIX);
        match &spec.target {
            SpecTarget::Path {
                path,
                reader_options,
                ..
            } => {
                let reader = spec.target.resolved_reader_method()?;
                self.register_file(&source, path, reader, reader_options)
                    .await?;
            }
            SpecTarget::S3 {
                uri,
                reader_options,
                ..
            } => {
                self.register_s3_bucket(uri)?;
                let reader = spec.target.resolved_reader_method()?;
                self.register_file(&source, uri, reader, reader_options)
                    .await?;
            }
            SpecTarget::InMemory(dataset) => {
                let table = MemTable::try_new(dataset.schema(), vec![dataset.batches().to_vec()])
                    .map_err(|e| self.error(e))?;
                self.ctx
                    .register_table(source.as_str(), Arc::new(table))
                    .map_err(|e| self.error(e))?;
            }
            SpecTarget::Table(table) => {
                return Ok((format!("SELECT * FROM {}", table.quoted()), None));
            }
            SpecTarget::Query { query } => {
                return Ok((format!("SELECT * FROM ({}) AS runtime_query", query), None));
            }
        }
        debug!(engine = %self.name, source = %source, target = spec.target.kind(), "Registered batch source");
        Ok((format!("SELECT * FROM {}", quote_ident(&source)), Some(source)))
    }

    async fn register_file(
        &self,
        name: &str,
        path: &str,
        reader: Option<ReaderMethod>,
        options: &ReaderOptions,
    ) -> Result<()> {
        let extension = file_extension(path);
        let result = match reader {
            Some(ReaderMethod::Csv) | None => {
                let read_options = CsvReadOptions::new()
                    .has_header(options.has_header)
                    .delimiter(options.delimiter_for(path))
                    .file_extension(&extension);
                self.ctx.register_csv(name, path, read_options).await
            }
            Some(ReaderMethod::Parquet) => {
                let read_options = ParquetReadOptions {
                    file_extension: &extension,
                    ..Default::default()
                };
                self.ctx.register_parquet(name, path, read_options).await
            }
            Some(ReaderMethod::Json) => {
                let read_options = NdJsonReadOptions::default().file_extension(&extension);
                self.ctx.register_json(name, path, read_options).await
            }
        };
        result.map_err(|e| self.error(format!("failed to register '{}': {}", path, e)))
    }

    fn register_s3_bucket(&self, uri: &str) -> Result<()> {
        let (bucket, _) = parse_s3_uri(uri)?;
        let config = match &self.s3 {
            Some(config) => config.clone(),
            None => S3Config::from_env()?,
        };
        let store = config.build_store(&bucket)?;
        let url = Url::parse(&format!("s3://{}", bucket))
            .map_err(|e| BatchError::InvalidBatchSpec(format!("invalid S3 bucket '{}': {}", bucket, e)))?;
        self.ctx.register_object_store(&url, store);
        Ok(())
    }

    pub fn deregister(&self, name: &str) {
        if let Err(e) = self.ctx.deregister_table(name) {
            debug!(engine = %self.name, table = %name, "Failed to deregister table: {}", e);
        }
    }

    pub async fn columns_of(&self, sql: &str) -> Result<Vec<String>> {
        let df = self.ctx.sql(sql).await.map_err(|e| self.error(e))?;
        Ok(df
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect())
    }

    /// Render a spec to one SQL statement: split first, then sample.
    pub async fn plan(&self, spec: &BatchSpec) -> Result<PlannedQuery> {
        let (base, source) = self.register_source(spec).await?;
        let planned = async {
            let split = spec.split_query(&base, SqlDialect::DataFusion)?;
            let columns = match &spec.sampling {
                Some(sampling) if sampling.needs_columns() => self.columns_of(&split).await?,
                _ => Vec::new(),
            };
            spec.sample_query(&split, &columns, SqlDialect::DataFusion)
        }
        .await;
        match planned {
            Ok(sql) => Ok(PlannedQuery { sql, source }),
            Err(e) => {
                if let Some(source) = &source {
                    self.deregister(source);
                }
                Err(e)
            }
        }
    }

    pub async fn distinct_partitions(
        &self,
        spec: &BatchSpec,
        splitter: &SplitterMethod,
    ) -> Result<Vec<BatchIdentifiers>> {
        let keys = splitter.identifier_keys();
        if keys.is_empty() {
            return Ok(vec![BatchIdentifiers::new()]);
        }
        let (base, source) = self.register_source(spec).await?;
        let result = async {
            let sql = splitter.distinct_query(&base, SqlDialect::DataFusion)?;
            let batches = self
                .ctx
                .sql(&sql)
                .await
                .map_err(|e| self.error(e))?
                .collect()
                .await
                .map_err(|e| self.error(e))?;
            let mut partitions = Vec::new();
            for batch in &batches {
                for row in 0..batch.num_rows() {
                    let mut identifiers = BatchIdentifiers::new();
                    for (i, key) in keys.iter().enumerate() {
                        let value = identifier_from_array(batch.column(i).as_ref(), row)
                            .map_err(|e| self.error(e))?;
                        identifiers.insert(key.clone(), value);
                    }
                    partitions.push(identifiers);
                }
            }
            partitions.sort();
            Ok::<_, BatchError>(partitions)
        }
        .await;
        if let Some(source) = &source {
            self.deregister(source);
        }
        let partitions = result?;
        info!(
            engine = %self.name,
            splitter = splitter.method_name(),
            partitions = partitions.len(),
            "Discovered split partitions"
        );
        Ok(partitions)
    }

    /// Tables registered in the session catalog, excluding sluice temporaries.
    pub fn list_tables(&self) -> Vec<TableRef> {
        let mut tables = Vec::new();
        for catalog_name in self.ctx.catalog_names() {
            let Some(catalog) = self.ctx.catalog(&catalog_name) else {
                continue;
            };
            for schema_name in catalog.schema_names() {
                if schema_name == "information_schema" {
                    continue;
                }
                let Some(schema) = catalog.schema(&schema_name) else {
                    continue;
                };
                for table in schema.table_names() {
                    if table.starts_with(SOURCE_PREFIX) || table.starts_with(BATCH_PREFIX) {
                        continue;
                    }
                    let schema = (schema_name != "public").then(|| schema_name.clone());
                    tables.push(TableRef::new(schema, table));
                }
            }
        }
        tables.sort();
        tables.dedup();
        tables
    }
}

pub(crate) fn unique_name(prefix: &str) -> String {
    format!("{}{}", prefix, uuid::Uuid::new_v4().simple())
}

fn file_extension(path: &str) -> String {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e))
        .unwrap_or_default()
}

/// Convert one cell of a distinct-partition result into an identifier value.
fn identifier_from_array(
    array: &dyn Array,
    row: usize,
) -> std::result::Result<IdentifierValue, datafusion::error::DataFusionError> {
    if array.is_null(row) {
        return Ok(IdentifierValue::Null);
    }
    let value = match ScalarValue::try_from_array(array, row)? {
        ScalarValue::Boolean(Some(b)) => IdentifierValue::Bool(b),
        ScalarValue::Int8(Some(v)) => IdentifierValue::Int(v as i64),
        ScalarValue::Int16(Some(v)) => IdentifierValue::Int(v as i64),
        ScalarValue::Int32(Some(v)) => IdentifierValue::Int(v as i64),
        ScalarValue::Int64(Some(v)) => IdentifierValue::Int(v),
        ScalarValue::UInt8(Some(v)) => IdentifierValue::Int(v as i64),
        ScalarValue::UInt16(Some(v)) => IdentifierValue::Int(v as i64),
        ScalarValue::UInt32(Some(v)) => IdentifierValue::Int(v as i64),
        // Values past i64::MAX keep their decimal text.
        ScalarValue::UInt64(Some(v)) => match i64::try_from(v) {
            Ok(v) => IdentifierValue::Int(v),
            Err(_) => IdentifierValue::Str(v.to_string()),
        },
        ScalarValue::Utf8(Some(s)) | ScalarValue::LargeUtf8(Some(s)) => IdentifierValue::Str(s),
        _ => IdentifierValue::Str(array_value_to_string(array, row)?),
    };
    Ok(value)
}
