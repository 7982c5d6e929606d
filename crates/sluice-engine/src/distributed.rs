//! Distributed execution engine built on Ballista.
//!
//! Fetches stay lazy: the planned query is registered as a view and only
//! runs on the cluster when the batch is counted, aggregated or collected.

use std::sync::Arc;

use async_trait::async_trait;
use ballista::prelude::SessionContextExt;
use datafusion::prelude::SessionContext;
use sluice_core::{
    BatchIdentifiers, BatchMarkers, BatchSpec, Capability, Result, SplitterMethod, SqlDialect,
    TableRef,
};
use tracing::info;

use crate::batch_data::{BatchData, BatchHandle, SessionTable};
use crate::config::EngineSettings;
use crate::s3::S3Config;
use crate::session::{unique_name, SessionBackend, BATCH_PREFIX};
use crate::{fetch_markers, ExecutionEngine};

pub struct BallistaEngine {
    name: String,
    backend: SessionBackend,
    settings: EngineSettings,
}

impl BallistaEngine {
    /// Connect to a running scheduler, e.g. `df://localhost:50050`.
    pub async fn remote(
        name: impl Into<String>,
        scheduler_url: &str,
        settings: EngineSettings,
        s3: Option<S3Config>,
    ) -> Result<Self> {
        let name = name.into();
        let ctx = SessionContext::remote(scheduler_url)
            .await
            .map_err(|e| sluice_core::BatchError::engine(&name, e))?;
        info!(engine = %name, scheduler = %scheduler_url, "Connected to Ballista scheduler");
        Ok(Self::from_context(name, ctx, settings, s3))
    }

    /// Start an in-process scheduler and executor.
    pub async fn standalone(
        name: impl Into<String>,
        settings: EngineSettings,
        s3: Option<S3Config>,
    ) -> Result<Self> {
        let name = name.into();
        let ctx = SessionContext::standalone()
            .await
            .map_err(|e| sluice_core::BatchError::engine(&name, e))?;
        info!(engine = %name, "Started standalone Ballista cluster");
        Ok(Self::from_context(name, ctx, settings, s3))
    }

    /// Wrap an existing session; any `SessionContext` works, which keeps the
    /// lazy-view semantics testable without a cluster.
    pub fn from_context(
        name: impl Into<String>,
        ctx: SessionContext,
        settings: EngineSettings,
        s3: Option<S3Config>,
    ) -> Self {
        let name = name.into();
        Self {
            backend: SessionBackend::new(name.clone(), ctx, s3),
            name,
            settings,
        }
    }

    pub fn context(&self) -> &SessionContext {
        self.backend.context()
    }

    async fn fetch(&self, spec: &BatchSpec) -> Result<(BatchData, BatchMarkers)> {
        let planned = self.backend.plan(spec).await?;
        let df = match self.context().sql(&planned.sql).await {
            Ok(df) => df,
            Err(e) => {
                if let Some(source) = &planned.source {
                    self.backend.deregister(source);
                }
                return Err(self.backend.error(e));
            }
        };
        // The view reads through the source registration; both go with the batch.
        let view_name = unique_name(BATCH_PREFIX);
        let table = SessionTable::new(self.context().clone(), view_name.as_str())
            .reading_through(planned.source);
        self.context()
            .register_table(view_name.as_str(), df.into_view())
            .map_err(|e| self.backend.error(e))?;

        info!(
            engine = %self.name,
            asset = %spec.data_asset_name,
            target = spec.target.kind(),
            view = %view_name,
            "Registered lazy batch view"
        );
        let data = BatchData::new(
            &self.name,
            Capability::Distributed,
            BatchHandle::Session(Arc::new(table)),
        );
        Ok((data, fetch_markers(&self.name, spec)))
    }
}

#[async_trait]
impl ExecutionEngine for BallistaEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn capability(&self) -> Capability {
        Capability::Distributed
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
