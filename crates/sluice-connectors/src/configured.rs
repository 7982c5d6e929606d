//! Connector whose assets are declared one by one.
//!
//! File assets select objects with their own pattern (optionally under a
//! prefix). Table assets map to one table. A splitter partitions either kind
//! further by asking the engine for the distinct values it yields; a split
//! file partition carries the pattern identifiers plus the split ones.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_core::{
    BatchDefinition, BatchError, BatchIdentifiers, BatchRequest, BatchSpec, ReaderMethod,
    ReaderOptions, Result, SamplingMethod, SpecTarget, SplitterMethod, TableRef,
};
use sluice_engine::ExecutionEngine;
use tracing::{debug, info};

use crate::factory::ConnectorKind;
use crate::inventory::{Inventory, InventoryCache, Partition, PartitionSource};
use crate::location::FileLocation;
use crate::pattern::PartitionPattern;
use crate::resolve::{check_definition, check_request, definitions_from_inventory, effective_sampling};
use crate::DataConnector;

/// Per-asset configuration.
///
/// Sampling and splitting accept either the tagged form
/// (`{"sampling": {"method": "random", "p": 0.1}}`) or a method name plus
/// keyword map (`"sampling_method": "sample_using_random"`,
/// `"sampling_kwargs": {"p": 0.1}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetConfig {
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub splitter: Option<SplitterMethod>,
    #[serde(default)]
    pub sampling: Option<SamplingMethod>,
    #[serde(default)]
    pub reader_method: Option<ReaderMethod>,
    #[serde(default)]
    pub reader_options: Option<ReaderOptions>,
    #[serde(default)]
    pub sampling_method: Option<String>,
    #[serde(default)]
    pub sampling_kwargs: Option<Value>,
    #[serde(default)]
    pub splitter_method: Option<String>,
    #[serde(default)]
    pub splitter_kwargs: Option<Value>,
}

impl AssetConfig {
    pub fn resolved_sampling(&self) -> Result<Option<SamplingMethod>> {
        match (&self.sampling, &self.sampling_method) {
            (Some(_), Some(_)) => Err(BatchError::InvalidConfig(
                "give either sampling or sampling_method, not both".to_string(),
            )),
            (Some(sampling), None) => {
                sampling.validate()?;
                Ok(Some(sampling.clone()))
            }
            (None, Some(name)) => {
                SamplingMethod::from_name(name, self.sampling_kwargs.as_ref()).map(Some)
            }
            (None, None) => Ok(None),
        }
    }

    pub fn resolved_splitter(&self) -> Result<Option<SplitterMethod>> {
        match (&self.splitter, &self.splitter_method) {
            (Some(_), Some(_)) => Err(BatchError::InvalidConfig(
                "give either splitter or splitter_method, not both".to_string(),
            )),
            (Some(splitter), None) => {
                splitter.validate()?;
                Ok(Some(splitter.clone()))
            }
            (None, Some(name)) => {
                SplitterMethod::from_name(name, self.splitter_kwargs.as_ref()).map(Some)
            }
            (None, None) => Ok(None),
        }
    }
}

/// Sampling and splitting applied to every asset that does not set its own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AssetDefaults {
    pub sampling: Option<SamplingMethod>,
    pub splitter: Option<SplitterMethod>,
}

pub enum ConfiguredSource {
    Files {
        location: FileLocation,
        /// Reads files to split them; required only by assets with a splitter.
        engine: Option<Arc<dyn ExecutionEngine>>,
    },
    Tables {
        engine: Arc<dyn ExecutionEngine>,
    },
}

#[derive(Debug, Clone)]
struct ConfiguredAsset {
    pattern: Option<PartitionPattern>,
    prefix: String,
    table: TableRef,
    splitter: Option<SplitterMethod>,
    sampling: Option<SamplingMethod>,
    reader_method: Option<ReaderMethod>,
    reader_options: ReaderOptions,
}

pub struct ConfiguredAssetDataConnector {
    name: String,
    datasource_name: String,
    source: ConfiguredSource,
    assets: BTreeMap<String, ConfiguredAsset>,
    cache: InventoryCache,
}

impl ConfiguredAssetDataConnector {
    pub fn new(
        datasource_name: impl Into<String>,
        name: impl Into<String>,
        source: ConfiguredSource,
        defaults: &AssetDefaults,
        assets: &BTreeMap<String, AssetConfig>,
    ) -> Result<Self> {
        let name = name.into();
        if let Some(sampling) = &defaults.sampling {
            sampling.validate()?;
        }
        if let Some(splitter) = &defaults.splitter {
            splitter.validate()?;
        }
        let for_asset = |asset: &str, e: BatchError| {
            BatchError::InvalidConfig(format!(
                "data connector '{}', asset '{}': {}",
                name, asset, e
            ))
        };

        let mut resolved = BTreeMap::new();
        for (asset, config) in assets {
            let sampling = config
                .resolved_sampling()
                .map_err(|e| for_asset(asset, e))?
                .or_else(|| defaults.sampling.clone());
            let splitter = config
                .resolved_splitter()
                .map_err(|e| for_asset(asset, e))?
                .or_else(|| defaults.splitter.clone());
            let pattern = match (&source, &config.pattern) {
                (ConfiguredSource::Files { .. }, Some(pattern)) => {
                    Some(PartitionPattern::parse(pattern).map_err(|e| for_asset(asset, e))?)
                }
                (ConfiguredSource::Files { .. }, None) => {
                    return Err(for_asset(
                        asset,
                        BatchError::InvalidConfig("file assets need a pattern".to_string()),
                    ))
                }
                (ConfiguredSource::Tables { .. }, _) => None,
            };
            if let (Some(pattern), Some(splitter)) = (&pattern, &splitter) {
                if matches!(source, ConfiguredSource::Files { engine: None, .. }) {
                    return Err(for_asset(
                        asset,
                        BatchError::InvalidConfig(
                            "splitting files needs an execution engine".to_string(),
                        ),
                    ));
                }
                let pattern_keys = pattern.identifier_keys();
                if let Some(shared) = splitter
                    .identifier_keys()
                    .into_iter()
                    .find(|key| pattern_keys.contains(key))
                {
                    return Err(for_asset(
                        asset,
                        BatchError::InvalidConfig(format!(
                            "splitter key '{}' is also a pattern placeholder",
                            shared
                        )),
                    ));
                }
            }
            let table = match (&config.schema, &config.table) {
                (Some(schema), Some(table)) => TableRef::new(Some(schema.clone()), table),
                (Some(schema), None) => TableRef::new(Some(schema.clone()), asset),
                (None, Some(table)) => TableRef::parse(table),
                (None, None) => TableRef::new(None, asset),
            };
            resolved.insert(
                asset.clone(),
                ConfiguredAsset {
                    pattern,
                    prefix: config
                        .prefix
                        .as_deref()
                        .unwrap_or_default()
                        .trim_matches('/')
                        .to_string(),
                    table,
                    splitter,
                    sampling,
                    reader_method: config.reader_method,
                    reader_options: config.reader_options.clone().unwrap_or_default(),
                },
            );
        }

        Ok(Self {
            name,
            datasource_name: datasource_name.into(),
            source,
            assets: resolved,
            cache: InventoryCache::new(),
        })
    }

    async fn build_inventory(&self) -> Result<Inventory> {
        let mut inventory = Inventory::new();
        match &self.source {
            ConfiguredSource::Files { location, engine } => {
                let keys = location.list(&self.name).await?;
                for (asset_name, asset) in &self.assets {
                    inventory.declare_asset(asset_name);
                    let Some(pattern) = &asset.pattern else {
                        continue;
                    };
                    for key in &keys {
                        let relative = if asset.prefix.is_empty() {
                            Some(key.as_str())
                        } else {
                            key.strip_prefix(asset.prefix.as_str())
                                .and_then(|rest| rest.strip_prefix('/'))
                        };
                        let Some(matched) = relative.and_then(|r| pattern.match_path(r)) else {
                            continue;
                        };
                        if matched
                            .data_asset_name
                            .as_deref()
                            .is_some_and(|named| named != asset_name)
                        {
                            continue;
                        }
                        let splits = match (engine, &asset.splitter) {
                            (Some(engine), Some(splitter))
                                if !splitter.identifier_keys().is_empty() =>
                            {
                                let spec = BatchSpec::new(
                                    asset_name,
                                    matched.batch_identifiers.clone(),
                                    location.target(
                                        key,
                                        asset.reader_method,
                                        asset.reader_options.clone(),
                                    ),
                                );
                                engine.distinct_partitions(&spec, splitter).await?
                            }
                            _ => vec![BatchIdentifiers::new()],
                        };
                        debug!(
                            connector = %self.name,
                            asset = %asset_name,
                            key = %key,
                            splits = splits.len(),
                            "Matched partition file"
                        );
                        for split in splits {
                            let mut batch_identifiers = matched.batch_identifiers.clone();
                            batch_identifiers.extend(split);
                            inventory.insert(
                                asset_name.clone(),
                                Partition {
                                    batch_identifiers,
                                    source: PartitionSource::File(key.clone()),
                                },
                            );
                        }
                    }
                }
            }
            ConfiguredSource::Tables { engine } => {
                for (asset_name, asset) in &self.assets {
                    inventory.declare_asset(asset_name);
                    let partitions = match &asset.splitter {
                        Some(splitter) if !splitter.identifier_keys().is_empty() => {
                            let spec = BatchSpec::new(
                                asset_name,
                                BatchIdentifiers::new(),
                                SpecTarget::Table(asset.table.clone()),
                            );
                            engine.distinct_partitions(&spec, splitter).await?
                        }
                        _ => vec![BatchIdentifiers::new()],
                    };
                    for batch_identifiers in partitions {
                        inventory.insert(
                            asset_name.clone(),
                            Partition {
                                batch_identifiers,
                                source: PartitionSource::Table(asset.table.clone()),
                            },
                        );
                    }
                }
            }
        }
        info!(
            connector = %self.name,
            assets = self.assets.len(),
            partitions = inventory.partition_count(),
            "Built partition inventory"
        );
        Ok(inventory)
    }

    async fn inventory(&self) -> Result<Arc<Inventory>> {
        self.cache.get_or_build(|| self.build_inventory()).await
    }
}

#[async_trait]
impl DataConnector for ConfiguredAssetDataConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn datasource_name(&self) -> &str {
        &self.datasource_name
    }

    fn kind(&self) -> ConnectorKind {
        match self.source {
            ConfiguredSource::Files { .. } => ConnectorKind::ConfiguredAssetFiles,
            ConfiguredSource::Tables { .. } => ConnectorKind::ConfiguredAssetTables,
        }
    }

    async fn list_available_data_asset_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.assets.keys().cloned().collect())
    }

    async fn get_batch_definition_list_from_batch_request(
        &self,
        request: &BatchRequest,
    ) -> Result<Vec<BatchDefinition>> {
        check_request(self, request)?;
        if !self.assets.contains_key(&request.data_asset_name) {
            return Err(BatchError::AssetNotFound {
                connector: self.name.clone(),
                asset: request.data_asset_name.clone(),
            });
        }
        let inventory = self.inventory().await?;
        definitions_from_inventory(self, &inventory, request)
    }

    fn build_batch_spec_for_request(
        &self,
        definition: &BatchDefinition,
        request: Option<&BatchRequest>,
    ) -> Result<BatchSpec> {
        let asset = self
            .assets
            .get(&definition.data_asset_name)
            .ok_or_else(|| BatchError::AssetNotFound {
                connector: self.name.clone(),
                asset: definition.data_asset_name.clone(),
            })?;
        let mut keys = asset
            .splitter
            .as_ref()
            .map(|splitter| splitter.identifier_keys())
            .unwrap_or_default();
        let target = match (&self.source, &asset.pattern) {
            (ConfiguredSource::Files { location, .. }, Some(pattern)) => {
                keys.extend(pattern.identifier_keys());
                check_definition(self, definition, &keys)?;
                let relative =
                    pattern.render(&definition.data_asset_name, &definition.batch_identifiers)?;
                let key = if asset.prefix.is_empty() {
                    relative
                } else {
                    format!("{}/{}", asset.prefix, relative)
                };
                location.target(&key, asset.reader_method, asset.reader_options.clone())
            }
            (ConfiguredSource::Files { .. }, None) => {
                return Err(BatchError::InvalidBatchSpec(format!(
                    "file asset '{}' has no pattern",
                    definition.data_asset_name
                )))
            }
            (ConfiguredSource::Tables { .. }, _) => {
                check_definition(self, definition, &keys)?;
                SpecTarget::Table(asset.table.clone())
            }
        };
        let spec = BatchSpec::new(
            &definition.data_asset_name,
            definition.batch_identifiers.clone(),
            target,
        )
        .with_splitter(asset.splitter.clone())
        .with_sampling(effective_sampling(asset.sampling.as_ref(), request));
        spec.validate()?;
        Ok(spec)
    }

    async fn refresh(&self) -> Result<()> {
        self.cache.refresh(|| self.build_inventory()).await?;
        Ok(())
    }
}
