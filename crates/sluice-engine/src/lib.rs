//! Sluice Engine - execution engine adapters
//!
//! An execution engine turns a `BatchSpec` into fetched `BatchData` plus
//! `BatchMarkers`. Engines declare one capability; a spec is dispatched only
//! to engines whose capability is among the spec's tags.
//!
//! - `DataFusionEngine`: in-memory, results materialized into a `MemTable`
//! - `BallistaEngine`: distributed, results kept as a lazy view
//! - `PostgresEngine`: relational, results kept as a lazy selectable

pub mod batch_data;
pub mod config;
pub mod distributed;
pub mod factory;
pub mod in_memory;
pub mod relational;
pub mod s3;
mod session;

use async_trait::async_trait;
use sluice_core::{
    BatchError, BatchFingerprint, BatchIdentifiers, BatchMarkers, BatchSpec, Capability, Result,
    SplitterMethod, SqlDialect, TableRef,
};

pub use batch_data::{BatchData, BatchHandle, SessionTable};
pub use config::EngineSettings;
pub use distributed::BallistaEngine;
pub use factory::{build_engine, EngineConfig, EngineKind};
pub use in_memory::DataFusionEngine;
pub use relational::PostgresEngine;
pub use s3::S3Config;

#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    /// Name used in logs, markers and errors.
    fn name(&self) -> &str;

    fn capability(&self) -> Capability;

    fn dialect(&self) -> SqlDialect;

    fn supports(&self, spec: &BatchSpec) -> bool {
        spec.supports(self.capability())
    }

    /// Explicit tag check performed before any backend work.
    fn check_capability(&self, spec: &BatchSpec) -> Result<()> {
        if self.supports(spec) {
            Ok(())
        } else {
            Err(BatchError::EngineCapabilityMismatch {
                engine: self.name().to_string(),
                capability: self.capability(),
                spec_capabilities: spec.capabilities(),
            })
        }
    }

    async fn get_batch_data_and_markers(
        &self,
        spec: &BatchSpec,
    ) -> Result<(BatchData, BatchMarkers)>;

    /// Identifier tuples present in the spec's target under `splitter`, sorted.
    async fn distinct_partitions(
        &self,
        spec: &BatchSpec,
        splitter: &SplitterMethod,
    ) -> Result<Vec<BatchIdentifiers>>;

    async fn list_tables(&self) -> Result<Vec<TableRef>>;

    async fn fingerprint(&self, data: &BatchData, partition_id: &str) -> Result<BatchFingerprint> {
        let fingerprint = data.content_fingerprint().await?;
        Ok(BatchFingerprint::new(partition_id, fingerprint))
    }
}

/// Markers every engine stamps on a fetch.
pub(crate) fn fetch_markers(engine: &str, spec: &BatchSpec) -> BatchMarkers {
    BatchMarkers::stamp()
        .with_marker("engine", engine)
        .with_marker("spec_id", spec.id())
}
