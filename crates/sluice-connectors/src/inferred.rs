//! Connector whose assets are discovered rather than declared.
//!
//! File sources derive asset names from the `data_asset_name` placeholder of
//! a partition pattern. Table sources take them from the engine's catalog.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sluice_core::{
    BatchDefinition, BatchError, BatchIdentifiers, BatchRequest, BatchSpec, ReaderMethod,
    ReaderOptions, Result, SamplingMethod, SpecTarget, TableRef,
};
use sluice_engine::ExecutionEngine;
use tracing::{debug, info};

use crate::factory::ConnectorKind;
use crate::inventory::{Inventory, InventoryCache, Partition, PartitionSource};
use crate::location::FileLocation;
use crate::pattern::PartitionPattern;
use crate::resolve::{check_definition, check_request, definitions_from_inventory, effective_sampling};
use crate::DataConnector;

pub enum InferredSource {
    Files {
        location: FileLocation,
        pattern: PartitionPattern,
    },
    Tables {
        engine: Arc<dyn ExecutionEngine>,
        /// Name assets `schema.table` for tables outside the default schema.
        /// Without it only default-schema tables become assets.
        include_schema_name: bool,
        excluded_tables: BTreeSet<String>,
    },
}

pub struct InferredAssetDataConnector {
    name: String,
    datasource_name: String,
    source: InferredSource,
    sampling: Option<SamplingMethod>,
    reader_method: Option<ReaderMethod>,
    reader_options: ReaderOptions,
    cache: InventoryCache,
}

impl InferredAssetDataConnector {
    pub fn new(
        datasource_name: impl Into<String>,
        name: impl Into<String>,
        source: InferredSource,
    ) -> Result<Self> {
        let name = name.into();
        if let InferredSource::Files { pattern, .. } = &source {
            if !pattern.names_asset() {
                return Err(BatchError::InvalidConfig(format!(
                    "data connector '{}': pattern '{}' must contain {{data_asset_name}}",
                    name, pattern
                )));
            }
        }
        Ok(Self {
            name,
            datasource_name: datasource_name.into(),
            source,
            sampling: None,
            reader_method: None,
            reader_options: ReaderOptions::default(),
            cache: InventoryCache::new(),
        })
    }

    /// Sampling applied to every asset of this connector.
    pub fn with_sampling(mut self, sampling: Option<SamplingMethod>) -> Self {
        self.sampling = sampling;
        self
    }

    pub fn with_reader(mut self, method: Option<ReaderMethod>, options: ReaderOptions) -> Self {
        self.reader_method = method;
        self.reader_options = options;
        self
    }

    async fn build_inventory(&self) -> Result<Inventory> {
        let mut inventory = Inventory::new();
        match &self.source {
            InferredSource::Files { location, pattern } => {
                for key in location.list(&self.name).await? {
                    let Some(matched) = pattern.match_path(&key) else {
                        debug!(connector = %self.name, key = %key, "Object does not match pattern");
                        continue;
                    };
                    let Some(asset) = matched.data_asset_name else {
                        continue;
                    };
                    inventory.insert(
                        asset,
                        Partition {
                            batch_identifiers: matched.batch_identifiers,
                            source: PartitionSource::File(key),
                        },
                    );
                }
            }
            InferredSource::Tables {
                engine,
                include_schema_name,
                excluded_tables,
            } => {
                for table in engine.list_tables().await? {
                    if table.schema.is_some() && !include_schema_name {
                        debug!(
                            connector = %self.name,
                            table = %table,
                            "Skipping table outside the default schema"
                        );
                        continue;
                    }
                    let asset = self.asset_name_for(&table, *include_schema_name);
                    if excluded_tables.contains(&asset) || excluded_tables.contains(&table.to_string())
                    {
                        continue;
                    }
                    inventory.insert(
                        asset,
                        Partition {
                            batch_identifiers: BatchIdentifiers::new(),
                            source: PartitionSource::Table(table),
                        },
                    );
                }
            }
        }
        info!(
            connector = %self.name,
            assets = inventory.asset_names().len(),
            partitions = inventory.partition_count(),
            "Built partition inventory"
        );
        Ok(inventory)
    }

    fn asset_name_for(&self, table: &TableRef, include_schema_name: bool) -> String {
        match (&table.schema, include_schema_name) {
            (Some(schema), true) => format!("{}.{}", schema, table.table),
            _ => table.table.clone(),
        }
    }

    async fn inventory(&self) -> Result<Arc<Inventory>> {
        self.cache.get_or_build(|| self.build_inventory()).await
    }
}

#[async_trait]
impl DataConnector for InferredAssetDataConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn datasource_name(&self) -> &str {
        &self.datasource_name
    }

    fn kind(&self) -> ConnectorKind {
        match self.source {
            InferredSource::Files { .. } => ConnectorKind::InferredAssetFiles,
            InferredSource::Tables { .. } => ConnectorKind::InferredAssetTables,
        }
    }

    async fn list_available_data_asset_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.inventory().await?.asset_names())
    }

    async fn get_batch_definition_list_from_batch_request(
        &self,
        request: &BatchRequest,
    ) -> Result<Vec<BatchDefinition>> {
        check_request(self, request)?;
        let inventory = self.inventory().await?;
        definitions_from_inventory(self, &inventory, request)
    }

    fn build_batch_spec_for_request(
        &self,
        definition: &BatchDefinition,
        request: Option<&BatchRequest>,
    ) -> Result<BatchSpec> {
        let target = match &self.source {
            InferredSource::Files { location, pattern } => {
                check_definition(self, definition, &pattern.identifier_keys())?;
                let key =
                    pattern.render(&definition.data_asset_name, &definition.batch_identifiers)?;
                location.target(&key, self.reader_method, self.reader_options.clone())
            }
            InferredSource::Tables {
                include_schema_name,
                ..
            } => {
                check_definition(self, definition, &[])?;
                let table = if *include_schema_name {
                    TableRef::parse(&definition.data_asset_name)
                } else {
                    TableRef::new(None, &definition.data_asset_name)
                };
                SpecTarget::Table(table)
            }
        };
        let spec = BatchSpec::new(
            &definition.data_asset_name,
            definition.batch_identifiers.clone(),
            target,
        )
        .with_sampling(effective_sampling(self.sampling.as_ref(), request));
        spec.validate()?;
        Ok(spec)
    }

    async fn refresh(&self) -> Result<()> {
        self.cache.refresh(|| self.build_inventory()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::IdentifierValue;

    fn write_files(dir: &std::path::Path, names: &[&str]) {
        for name in names {
            std::fs::write(dir.join(name), "id,fare\n1,2.5\n").unwrap();
        }
    }

    fn connector(dir: &std::path::Path) -> InferredAssetDataConnector {
        InferredAssetDataConnector::new(
            "lake",
            "monthly",
            InferredSource::Files {
                location: FileLocation::local(dir),
                pattern: PartitionPattern::parse("{data_asset_name}_{year}-{month}.csv").unwrap(),
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_assets_from_file_names() {
        let dir = tempfile::tempdir().unwrap();
        write_files(
            dir.path(),
            &["trips_2020-01.csv", "trips_2020-02.csv", "fares_2021-12.csv", "README.md"],
        );
        let connector = connector(dir.path());
        let assets = connector.list_available_data_asset_names().await.unwrap();
        assert_eq!(
            assets.into_iter().collect::<Vec<_>>(),
            vec!["fares".to_string(), "trips".to_string()]
        );
    }

    #[tokio::test]
    async fn test_spec_for_definition_points_at_file() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &["trips_2020-01.csv"]);
        let connector = connector(dir.path());
        let request = BatchRequest::new("lake", "monthly", "trips");
        let definitions = connector
            .get_batch_definition_list_from_batch_request(&request)
            .await
            .unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(
            definitions[0].batch_identifiers.get("month"),
            Some(&IdentifierValue::from("01"))
        );

        let spec = connector.build_batch_spec(&definitions[0]).unwrap();
        match spec.target {
            SpecTarget::Path { path, .. } => assert!(path.ends_with("trips_2020-01.csv")),
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_spec_is_built_without_listing() {
        let dir = tempfile::tempdir().unwrap();
        write_files(dir.path(), &["trips_2020-01.csv"]);
        let connector = connector(dir.path());
        let definition = BatchDefinition::new(
            "lake",
            "monthly",
            "trips",
            BatchIdentifiers::from([
                ("year".to_string(), IdentifierValue::from("2020")),
                ("month".to_string(), IdentifierValue::from("01")),
            ]),
        );
        let spec = connector.build_batch_spec(&definition).unwrap();
        assert!(!connector.cache.is_built().await);
        match spec.target {
            SpecTarget::Path { path, .. } => assert!(path.ends_with("trips_2020-01.csv")),
            other => panic!("unexpected target {:?}", other),
        }
    }

    #[test]
    fn test_definition_missing_identifier_is_invalid_spec() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(dir.path());
        let definition = BatchDefinition::new(
            "lake",
            "monthly",
            "trips",
            BatchIdentifiers::from([("year".to_string(), IdentifierValue::from("2020"))]),
        );
        let err = connector.build_batch_spec(&definition).unwrap_err();
        assert!(matches!(err, BatchError::InvalidBatchSpec(_)));

        let foreign = BatchDefinition::new("lake", "daily", "trips", BatchIdentifiers::new());
        assert!(matches!(
            connector.build_batch_spec(&foreign),
            Err(BatchError::InvalidBatchSpec(_))
        ));
    }

    #[tokio::test]
    async fn test_wrong_connector_name_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let connector = connector(dir.path());
        let request = BatchRequest::new("lake", "daily", "trips");
        let err = connector
            .get_batch_definition_list_from_batch_request(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidBatchKwargs(_)));
    }

    #[test]
    fn test_pattern_must_name_asset() {
        let result = InferredAssetDataConnector::new(
            "lake",
            "monthly",
            InferredSource::Files {
                location: FileLocation::local("/tmp"),
                pattern: PartitionPattern::parse("{year}-{month}.csv").unwrap(),
            },
        );
        assert!(matches!(result, Err(BatchError::InvalidConfig(_))));
    }
}
