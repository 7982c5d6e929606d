//! In-memory execution engine built on DataFusion.

use std::sync::Arc;

use async_trait::async_trait;
use datafusion::datasource::MemTable;
use datafusion::prelude::{SessionConfig, SessionContext};
use sluice_core::{
    BatchIdentifiers, BatchMarkers, BatchSpec, Capability, InMemoryDataset, Result,
    SplitterMethod, SqlDialect, TableRef,
};
use tracing::info;

use crate::batch_data::{BatchData, BatchHandle, SessionTable};
use crate::config::EngineSettings;
use crate::s3::S3Config;
use crate::session::{unique_name, SessionBackend, BATCH_PREFIX};
use crate::{fetch_markers, ExecutionEngine};

/// Fetches batches eagerly: every fetch is collected into a `MemTable`, so
/// the returned data no longer depends on the source files.
pub struct DataFusionEngine {
    name: String,
    backend: SessionBackend,
    settings: EngineSettings,
}

impl DataFusionEngine {
    pub fn new() -> Self {
        Self::with_settings("datafusion", EngineSettings::default(), None)
    }

    pub fn with_settings(
        name: impl Into<String>,
        settings: EngineSettings,
        s3: Option<S3Config>,
    ) -> Self {
        let config = SessionConfig::new().with_target_partitions(settings.target_partitions.max(1));
        let ctx = SessionContext::new_with_config(config);
        Self::from_context(name, ctx, settings, s3)
    }

    pub fn from_context(
        name: impl Into<String>,
        ctx: SessionContext,
        settings: EngineSettings,
        s3: Option<S3Config>,
    ) -> Self {
        let name = name.into();
        info!(engine = %name, "DataFusion engine initialized");
        Self {
            backend: SessionBackend::new(name.clone(), ctx, s3),
            name,
            settings,
        }
    }

    pub fn context(&self) -> &SessionContext {
        self.backend.context()
    }

    /// Register a CSV file as a named table
    pub async fn register_csv(&self, table_name: &str, path: &str) -> Result<()> {
        self.context()
            .register_csv(table_name, path, Default::default())
            .await
            .map_err(|e| self.backend.error(e))
    }

    /// Register a Parquet file as a named table
    pub async fn register_parquet(&self, table_name: &str, path: &str) -> Result<()> {
        self.context()
            .register_parquet(table_name, path, Default::default())
            .await
            .map_err(|e| self.backend.error(e))
    }

    pub fn register_record_batches(&self, table_name: &str, dataset: &InMemoryDataset) -> Result<()> {
        let table = MemTable::try_new(dataset.schema(), vec![dataset.batches().to_vec()])
            .map_err(|e| self.backend.error(e))?;
        self.context()
            .register_table(table_name, Arc::new(table))
            .map_err(|e| self.backend.error(e))?;
        Ok(())
    }

    async fn fetch(&self, spec: &BatchSpec) -> Result<(BatchData, BatchMarkers)> {
        let planned = self.backend.plan(spec).await?;
        let collected = async {
            let df = self
                .context()
                .sql(&planned.sql)
                .await
                .map_err(|e| self.backend.error(e))?;
            let schema = df.schema().inner().clone();
            let batches = df.collect().await.map_err(|e| self.backend.error(e))?;
            Ok::<_, sluice_core::BatchError>((schema, batches))
        }
        .await;
        if let Some(source) = &planned.source {
            self.backend.deregister(source);
        }
        let (logical_schema, batches) = collected?;
        let schema = batches
            .first()
            .map(|b| b.schema())
            .unwrap_or(logical_schema);

        let row_count: usize = batches.iter().map(|b| b.num_rows()).sum();
        let table_name = unique_name(BATCH_PREFIX);
        let table = MemTable::try_new(schema, vec![batches]).map_err(|e| self.backend.error(e))?;
        self.context()
            .register_table(table_name.as_str(), Arc::new(table))
            .map_err(|e| self.backend.error(e))?;

        info!(
            engine = %self.name,
            asset = %spec.data_asset_name,
            target = spec.target.kind(),
            rows = row_count,
            "Fetched batch into memory"
        );
        let table = SessionTable::new(self.context().clone(), table_name);
        let data = BatchData::new(
            &self.name,
            Capability::InMemory,
            BatchHandle::Session(Arc::new(table)),
        );
        let markers = fetch_markers(&self.name, spec).with_marker("row_count", row_count as u64);
        Ok((data, markers))
    }
}

impl Default for DataFusionEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionEngine for DataFusionEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::InMemory
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::DataFusion
    }

    async fn get_batch_data_and_markers(
        &self,
        spec: &BatchSpec,
    ) -> Result<(BatchData, BatchMarkers)> {
        self.check_capability(spec)?;
        spec.validate()?;
        self.settings.with_timeout(&self.name, self.fetch(spec)).await
    }

    async fn distinct_partitions(
        &self,
        spec: &BatchSpec,
        splitter: &SplitterMethod,
    ) -> Result<Vec<BatchIdentifiers>> {
        self.check_capability(spec)?;
        spec.validate()?;
        self.settings
            .with_timeout(&self.name, self.backend.distinct_partitions(spec, splitter))
            .await
    }

    async fn list_tables(&self) -> Result<Vec<TableRef>> {
        Ok(self.backend.list_tables())
    }
}
