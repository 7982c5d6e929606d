//! Sluice Connectors - partition discovery and batch resolution
//!
//! This crate turns batch requests into fetchable batch specs:
//! - `InferredAssetDataConnector`: assets named by a file pattern or by the
//!   engine's table catalog
//! - `ConfiguredAssetDataConnector`: assets declared one by one
//! - `RuntimeDataConnector`: one ad hoc batch per request
//! - `Datasource`: engine plus connectors, the end-to-end resolution facade

pub mod configured;
pub mod datasource;
pub mod factory;
pub mod inferred;
pub mod inventory;
pub mod location;
pub mod pattern;
mod resolve;
pub mod runtime;

use std::collections::BTreeSet;

use async_trait::async_trait;
use sluice_core::{BatchDefinition, BatchRequest, BatchSpec, Result};

pub use configured::{
    AssetConfig, AssetDefaults, ConfiguredAssetDataConnector, ConfiguredSource,
};
pub use datasource::{Batch, Datasource, DatasourceConfig};
pub use factory::{build_connector, ConnectorKind, DataConnectorConfig};
pub use inferred::{InferredAssetDataConnector, InferredSource};
pub use inventory::{Inventory, InventoryCache, Partition, PartitionSource};
pub use location::FileLocation;
pub use pattern::{PartitionPattern, PatternMatch};
pub use runtime::RuntimeDataConnector;

/// Discovers the partitions of named assets and turns requests into specs.
#[async_trait]
pub trait DataConnector: Send + Sync {
    fn name(&self) -> &str;

    fn datasource_name(&self) -> &str;

    fn kind(&self) -> ConnectorKind;

    async fn list_available_data_asset_names(&self) -> Result<BTreeSet<String>>;

    /// Definitions matching `request`, sorted by identifiers, after `index`
    /// and `limit`. An empty list is a valid answer for a known asset.
    async fn get_batch_definition_list_from_batch_request(
        &self,
        request: &BatchRequest,
    ) -> Result<Vec<BatchDefinition>>;

    /// Spec for a definition this connector produced. Derived from the
    /// definition and the connector's configuration alone, without listing
    /// partitions.
    fn build_batch_spec(&self, definition: &BatchDefinition) -> Result<BatchSpec> {
        self.build_batch_spec_for_request(definition, None)
    }

    /// Like `build_batch_spec`, honoring the request's sampling override and,
    /// for runtime connectors, its runtime parameters.
    fn build_batch_spec_for_request(
        &self,
        definition: &BatchDefinition,
        request: Option<&BatchRequest>,
    ) -> Result<BatchSpec>;

    /// Rediscover partitions.
    async fn refresh(&self) -> Result<()>;
}
