//! Connector registry: build data connectors from configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_core::{BatchError, ReaderMethod, ReaderOptions, Result, SamplingMethod, SplitterMethod};
use sluice_engine::{ExecutionEngine, S3Config};
use tracing::info;

use crate::configured::{
    AssetConfig, AssetDefaults, ConfiguredAssetDataConnector, ConfiguredSource,
};
use crate::inferred::{InferredAssetDataConnector, InferredSource};
use crate::location::FileLocation;
use crate::pattern::PartitionPattern;
use crate::runtime::RuntimeDataConnector;
use crate::DataConnector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectorKind {
    InferredAssetFiles,
    InferredAssetTables,
    ConfiguredAssetFiles,
    ConfiguredAssetTables,
    Runtime,
}

impl ConnectorKind {
    pub fn is_runtime(&self) -> bool {
        matches!(self, ConnectorKind::Runtime)
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectorKind::InferredAssetFiles => "InferredAssetFilesystemDataConnector",
            ConnectorKind::InferredAssetTables => "InferredAssetSqlDataConnector",
            ConnectorKind::ConfiguredAssetFiles => "ConfiguredAssetFilesystemDataConnector",
            ConnectorKind::ConfiguredAssetTables => "ConfiguredAssetSqlDataConnector",
            ConnectorKind::Runtime => "RuntimeDataConnector",
        };
        f.write_str(name)
    }
}

impl FromStr for ConnectorKind {
    type Err = BatchError;

    /// The S3 class names map to the file kinds; the location comes from
    /// `bucket` instead of `base_directory`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "InferredAssetFilesystemDataConnector" | "InferredAssetS3DataConnector" => {
                Ok(ConnectorKind::InferredAssetFiles)
            }
            "InferredAssetSqlDataConnector" => Ok(ConnectorKind::InferredAssetTables),
            "ConfiguredAssetFilesystemDataConnector" | "ConfiguredAssetS3DataConnector" => {
                Ok(ConnectorKind::ConfiguredAssetFiles)
            }
            "ConfiguredAssetSqlDataConnector" => Ok(ConnectorKind::ConfiguredAssetTables),
            "RuntimeDataConnector" => Ok(ConnectorKind::Runtime),
            other => Err(BatchError::InvalidConfig(format!(
                "unknown data connector class '{}'",
                other
            ))),
        }
    }
}

/// One entry of a datasource's `data_connectors` map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataConnectorConfig {
    pub class_name: String,
    /// Local directory for file connectors.
    #[serde(default)]
    pub base_directory: Option<String>,
    /// Bucket for S3 file connectors.
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Credentials; read from the environment when absent.
    #[serde(default)]
    pub s3: Option<S3Config>,
    /// Inferred file connectors: partition naming pattern.
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub reader_method: Option<ReaderMethod>,
    #[serde(default)]
    pub reader_options: Option<ReaderOptions>,
    /// Sampling applied to every asset. Configured assets may override it.
    #[serde(default)]
    pub sampling: Option<SamplingMethod>,
    /// Configured connectors: splitter for assets that do not set one.
    #[serde(default)]
    pub splitter: Option<SplitterMethod>,
    #[serde(default)]
    pub include_schema_name: bool,
    #[serde(default)]
    pub excluded_tables: Vec<String>,
    #[serde(default)]
    pub assets: BTreeMap<String, AssetConfig>,
    /// Runtime connectors: identifier keys requests may carry.
    #[serde(default)]
    pub batch_identifiers: Vec<String>,
}

impl DataConnectorConfig {
    pub fn kind(&self) -> Result<ConnectorKind> {
        self.class_name.parse()
    }

    fn location(&self, name: &str) -> Result<FileLocation> {
        match (&self.base_directory, &self.bucket) {
            (Some(dir), None) => Ok(FileLocation::local(dir)),
            (None, Some(bucket)) => {
                let config = match &self.s3 {
                    Some(config) => config.clone(),
                    None => S3Config::from_env()?,
                };
                Ok(FileLocation::s3(
                    bucket,
                    self.prefix.clone().unwrap_or_default(),
                    config,
                ))
            }
            (Some(_), Some(_)) => Err(BatchError::InvalidConfig(format!(
                "data connector '{}' sets both base_directory and bucket",
                name
            ))),
            (None, None) => Err(BatchError::InvalidConfig(format!(
                "data connector '{}' needs a base_directory or a bucket",
                name
            ))),
        }
    }
}

pub fn build_connector(
    datasource_name: &str,
    name: &str,
    config: &DataConnectorConfig,
    engine: Arc<dyn ExecutionEngine>,
) -> Result<Arc<dyn DataConnector>> {
    let kind = config.kind()?;
    info!(datasource = %datasource_name, connector = %name, kind = %kind, "Building data connector");
    let reader_options = config.reader_options.clone().unwrap_or_default();
    if config.splitter.is_some()
        && !matches!(
            kind,
            ConnectorKind::ConfiguredAssetFiles | ConnectorKind::ConfiguredAssetTables
        )
    {
        return Err(BatchError::InvalidConfig(format!(
            "data connector '{}': a connector-level splitter needs a configured-asset connector",
            name
        )));
    }
    let defaults = AssetDefaults {
        sampling: config.sampling.clone(),
        splitter: config.splitter.clone(),
    };
    let connector: Arc<dyn DataConnector> = match kind {
        ConnectorKind::InferredAssetFiles => {
            let pattern = config.pattern.as_deref().ok_or_else(|| {
                BatchError::InvalidConfig(format!("data connector '{}' needs a pattern", name))
            })?;
            let source = InferredSource::Files {
                location: config.location(name)?,
                pattern: PartitionPattern::parse(pattern)?,
            };
            Arc::new(
                InferredAssetDataConnector::new(datasource_name, name, source)?
                    .with_sampling(config.sampling.clone())
                    .with_reader(config.reader_method, reader_options),
            )
        }
        ConnectorKind::InferredAssetTables => {
            let source = InferredSource::Tables {
                engine,
                include_schema_name: config.include_schema_name,
                excluded_tables: config.excluded_tables.iter().cloned().collect::<BTreeSet<_>>(),
            };
            Arc::new(
                InferredAssetDataConnector::new(datasource_name, name, source)?
                    .with_sampling(config.sampling.clone()),
            )
        }
        ConnectorKind::ConfiguredAssetFiles => {
            let source = ConfiguredSource::Files {
                location: config.location(name)?,
                engine: Some(engine),
            };
            Arc::new(ConfiguredAssetDataConnector::new(
                datasource_name,
                name,
                source,
                &defaults,
                &config.assets,
            )?)
        }
        ConnectorKind::ConfiguredAssetTables => Arc::new(ConfiguredAssetDataConnector::new(
            datasource_name,
            name,
            ConfiguredSource::Tables { engine },
            &defaults,
            &config.assets,
        )?),
        ConnectorKind::Runtime => Arc::new(
            RuntimeDataConnector::new(datasource_name, name, config.batch_identifiers.clone())
                .with_reader_options(reader_options),
        ),
    };
    Ok(connector)
}
