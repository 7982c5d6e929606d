//! Fetched batch handles.
//!
//! A `BatchData` is opaque to callers: it points at rows that live inside the
//! engine that produced them (a registered DataFusion table or a Postgres
//! selectable) and can be counted, aggregated, collected and fingerprinted.

use std::fmt;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use datafusion::prelude::SessionContext;
use datafusion::scalar::ScalarValue;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sluice_core::sql::quote_ident;
use sluice_core::{BatchError, Capability, Result};
use sqlx::postgres::PgRow;
use sqlx::{Column, PgPool, Row, TypeInfo};
use tracing::debug;

const NULL_TOKEN: &str = "~";

/// Where the rows of a fetched batch live.
#[derive(Clone)]
pub enum BatchHandle {
    /// A table registered in a DataFusion or Ballista session.
    Session(Arc<SessionTable>),
    /// A selectable evaluated lazily by Postgres.
    Relational { pool: PgPool, selectable: String },
}

/// A table registered in a session for one fetched batch. The registration,
/// and every source registration it reads through, is removed when the last
/// handle to it is dropped.
pub struct SessionTable {
    ctx: SessionContext,
    name: String,
    reads_through: Vec<String>,
}

impl SessionTable {
    pub fn new(ctx: SessionContext, name: impl Into<String>) -> Self {
        Self {
            ctx,
            name: name.into(),
            reads_through: Vec::new(),
        }
    }

    /// Registrations the table depends on, released after it.
    pub fn reading_through(mut self, names: impl IntoIterator<Item = String>) -> Self {
        self.reads_through.extend(names);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }
}

impl Drop for SessionTable {
    fn drop(&mut self) {
        for name in std::iter::once(&self.name).chain(&self.reads_through) {
            if let Err(e) = self.ctx.deregister_table(name.as_str()) {
                debug!(table = %name, "Failed to release batch table: {}", e);
            }
        }
    }
}

#[derive(Clone)]
pub struct BatchData {
    engine: String,
    capability: Capability,
    handle: BatchHandle,
}

impl fmt::Debug for BatchData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = match &self.handle {
            BatchHandle::Session(table) => format!("session table {}", table.name()),
            BatchHandle::Relational { selectable, .. } => format!("selectable {}", selectable),
        };
        f.debug_struct("BatchData")
            .field("engine", &self.engine)
            .field("capability", &self.capability)
            .field("target", &target)
            .finish()
    }
}

impl BatchData {
    pub fn new(engine: impl Into<String>, capability: Capability, handle: BatchHandle) -> Self {
        Self {
            engine: engine.into(),
            capability,
            handle,
        }
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn handle(&self) -> &BatchHandle {
        &self.handle
    }

    /// SQL selecting every row of the batch in the producing engine's dialect.
    pub fn selectable(&self) -> String {
        match &self.handle {
            BatchHandle::Session(table) => format!("SELECT * FROM {}", quote_ident(table.name())),
            BatchHandle::Relational { selectable, .. } => selectable.clone(),
        }
    }

    pub async fn row_count(&self) -> Result<u64> {
        let value = self.aggregate("COUNT(*)").await?;
        value
            .as_u64()
            .ok_or_else(|| BatchError::engine(&self.engine, format!("unexpected row count {}", value)))
    }

    /// Evaluate an aggregate expression such as `COUNT(*)` or `max("fare")`
    /// over the batch.
    pub async fn aggregate(&self, expr: &str) -> Result<Value> {
        let sql = format!("SELECT {} AS value FROM ({}) AS batch", expr, self.selectable());
        debug!(engine = %self.engine, %sql, "Evaluating batch aggregate");
        match &self.handle {
            BatchHandle::Session(table) => {
                let batches = table
                    .context()
                    .sql(&sql)
                    .await
                    .map_err(|e| self.error(e))?
                    .collect()
                    .await
                    .map_err(|e| self.error(e))?;
                let batch = batches
                    .iter()
                    .find(|b| b.num_rows() > 0)
                    .ok_or_else(|| self.error("aggregate returned no rows"))?;
                let scalar =
                    ScalarValue::try_from_array(batch.column(0), 0).map_err(|e| self.error(e))?;
                Ok(scalar_to_json(scalar))
            }
            BatchHandle::Relational { pool, .. } => {
                let wrapped = format!("SELECT to_jsonb(agg.value) FROM ({}) AS agg", sql);
                let value: Option<Value> = sqlx::query_scalar(&wrapped)
                    .fetch_one(pool)
                    .await
                    .map_err(|e| self.error(e))?;
                Ok(value.unwrap_or(Value::Null))
            }
        }
    }

    /// Materialize every row as Arrow record batches.
    pub async fn collect(&self) -> Result<Vec<RecordBatch>> {
        match &self.handle {
            BatchHandle::Session(table) => table
                .context()
                .table(table.name())
                .await
                .map_err(|e| self.error(e))?
                .collect()
                .await
                .map_err(|e| self.error(e)),
            BatchHandle::Relational { pool, selectable } => {
                let rows = sqlx::query(selectable)
                    .fetch_all(pool)
                    .await
                    .map_err(|e| self.error(e))?;
                if rows.is_empty() {
                    return Ok(Vec::new());
                }
                let batch = rows_to_record_batch(&rows).map_err(|e| self.error(e))?;
                Ok(vec![batch])
            }
        }
    }

    /// Order-independent sha256 over the rendered rows.
    ///
    /// Session batches hash the Arrow display form of each row; relational
    /// batches let Postgres hash its own text form, so fingerprints are only
    /// comparable between engines of the same family.
    pub async fn content_fingerprint(&self) -> Result<String> {
        match &self.handle {
            BatchHandle::Session(_) => {
                let batches = self.collect().await?;
                let mut rows = render_rows(&batches).map_err(|e| self.error(e))?;
                rows.sort();
                let mut hasher = Sha256::new();
                for row in &rows {
                    hasher.update(row.as_bytes());
                    hasher.update(b"\n");
                }
                Ok(format!("{:x}", hasher.finalize()))
            }
            BatchHandle::Relational { pool, selectable } => {
                let sql = format!(
                    "SELECT coalesce(md5(string_agg(t::text, E'\\n' ORDER BY t::text)), md5('')) \
                     FROM ({}) AS t",
                    selectable
                );
                sqlx::query_scalar::<_, String>(&sql)
                    .fetch_one(pool)
                    .await
                    .map_err(|e| self.error(e))
            }
        }
    }

    fn error(&self, err: impl fmt::Display) -> BatchError {
        BatchError::engine(&self.engine, err)
    }
}

fn scalar_to_json(value: ScalarValue) -> Value {
    if value.is_null() {
        return Value::Null;
    }
    match value {
        ScalarValue::Boolean(Some(b)) => Value::Bool(b),
        ScalarValue::Int8(Some(v)) => v.into(),
        ScalarValue::Int16(Some(v)) => v.into(),
        ScalarValue::Int32(Some(v)) => v.into(),
        ScalarValue::Int64(Some(v)) => v.into(),
        ScalarValue::UInt8(Some(v)) => v.into(),
        ScalarValue::UInt16(Some(v)) => v.into(),
        ScalarValue::UInt32(Some(v)) => v.into(),
        ScalarValue::UInt64(Some(v)) => v.into(),
        ScalarValue::Float32(Some(v)) => float_to_json(v as f64),
        ScalarValue::Float64(Some(v)) => float_to_json(v),
        ScalarValue::Utf8(Some(s)) | ScalarValue::LargeUtf8(Some(s)) => Value::String(s),
        other => Value::String(other.to_string()),
    }
}

fn float_to_json(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Render each row as `len:cell|len:cell|...` with a bare null token, so no
/// cell content can be mistaken for a separator or for NULL.
pub(crate) fn render_rows(
    batches: &[RecordBatch],
) -> std::result::Result<Vec<String>, arrow::error::ArrowError> {
    let mut rows = Vec::new();
    for batch in batches {
        for row in 0..batch.num_rows() {
            let mut cells = Vec::with_capacity(batch.num_columns());
            for column in batch.columns() {
                if column.is_null(row) {
                    cells.push(NULL_TOKEN.to_string());
                } else {
                    let cell = array_value_to_string(column, row)?;
                    cells.push(format!("{}:{}", cell.len(), cell));
                }
            }
            rows.push(cells.join("|"));
        }
    }
    Ok(rows)
}

/// Map a Postgres type name (as reported by the row's column metadata) to Arrow.
fn pg_type_to_arrow(type_name: &str) -> DataType {
    match type_name.to_uppercase().as_str() {
        "INT2" => DataType::Int16,
        "INT4" => DataType::Int32,
        "INT8" => DataType::Int64,
        "FLOAT4" => DataType::Float32,
        "FLOAT8" => DataType::Float64,
        "BOOL" => DataType::Boolean,
        other => {
            debug!("Rendering PostgreSQL type '{}' as Utf8", other);
            DataType::Utf8
        }
    }
}

/// Text form of a non-native column value; `None` when it is NULL or of a
/// type without a text decoding.
pub(crate) fn decode_as_text(row: &PgRow, i: usize) -> Option<String> {
    if let Ok(v) = row.try_get::<Option<String>, _>(i) {
        return v;
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(i) {
        return v.map(|t| t.to_rfc3339());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(i) {
        return v.map(|t| t.to_string());
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(i) {
        return v.map(|t| t.to_string());
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(i) {
        return v.map(|u| u.to_string());
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(i) {
        return v.map(|j| j.to_string());
    }
    None
}

/// Convert PostgreSQL rows to an Arrow record batch using the first row's
/// column metadata.
fn rows_to_record_batch(rows: &[PgRow]) -> std::result::Result<RecordBatch, arrow::error::ArrowError> {
    use arrow::array::*;

    let Some(first) = rows.first() else {
        return Ok(RecordBatch::new_empty(Arc::new(Schema::empty())));
    };
    let fields: Vec<Field> = first
        .columns()
        .iter()
        .map(|c| Field::new(c.name(), pg_type_to_arrow(c.type_info().name()), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for (i, field) in schema.fields().iter().enumerate() {
        let array: ArrayRef = match field.data_type() {
            DataType::Int16 => Arc::new(Int16Array::from(
                rows.iter()
                    .map(|row| row.try_get::<Option<i16>, _>(i).ok().flatten())
                    .collect::<Vec<_>>(),
            )),
            DataType::Int32 => Arc::new(Int32Array::from(
                rows.iter()
                    .map(|row| row.try_get::<Option<i32>, _>(i).ok().flatten())
                    .collect::<Vec<_>>(),
            )),
            DataType::Int64 => Arc::new(Int64Array::from(
                rows.iter()
                    .map(|row| row.try_get::<Option<i64>, _>(i).ok().flatten())
                    .collect::<Vec<_>>(),
            )),
            DataType::Float32 => Arc::new(Float32Array::from(
                rows.iter()
                    .map(|row| row.try_get::<Option<f32>, _>(i).ok().flatten())
                    .collect::<Vec<_>>(),
            )),
            DataType::Float64 => Arc::new(Float64Array::from(
                rows.iter()
                    .map(|row| row.try_get::<Option<f64>, _>(i).ok().flatten())
                    .collect::<Vec<_>>(),
            )),
            DataType::Boolean => Arc::new(BooleanArray::from(
                rows.iter()
                    .map(|row| row.try_get::<Option<bool>, _>(i).ok().flatten())
                    .collect::<Vec<_>>(),
            )),
            _ => Arc::new(StringArray::from(
                rows.iter()
                    .map(|row| decode_as_text(row, i))
                    .collect::<Vec<_>>(),
            )),
        };
        columns.push(array);
    }

    RecordBatch::try_new(schema, columns)
}
