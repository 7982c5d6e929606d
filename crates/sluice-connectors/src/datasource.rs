//! A datasource pairs one execution engine with its data connectors and
//! drives a request through resolution, spec building and fetching.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sluice_core::{
    BatchDefinition, BatchError, BatchFingerprint, BatchMarkers, BatchRequest, BatchSpec,
    ResolutionState, Result,
};
use sluice_engine::{build_engine, BatchData, EngineConfig, ExecutionEngine};
use tracing::{debug, info, warn};

use crate::factory::{build_connector, DataConnectorConfig};
use crate::DataConnector;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasourceConfig {
    pub name: String,
    #[serde(default)]
    pub execution_engine: EngineConfig,
    #[serde(default)]
    pub data_connectors: BTreeMap<String, DataConnectorConfig>,
}

/// A fetched batch. Immutable once built.
#[derive(Debug, Clone)]
pub struct Batch {
    request: Option<BatchRequest>,
    definition: BatchDefinition,
    spec: BatchSpec,
    data: BatchData,
    markers: BatchMarkers,
}

impl Batch {
    pub fn new(
        request: Option<BatchRequest>,
        definition: BatchDefinition,
        spec: BatchSpec,
        data: BatchData,
        markers: BatchMarkers,
    ) -> Self {
        Self {
            request,
            definition,
            spec,
            data,
            markers,
        }
    }

    pub fn request(&self) -> Option<&BatchRequest> {
        self.request.as_ref()
    }

    pub fn definition(&self) -> &BatchDefinition {
        &self.definition
    }

    pub fn spec(&self) -> &BatchSpec {
        &self.spec
    }

    pub fn data(&self) -> &BatchData {
        &self.data
    }

    pub fn markers(&self) -> &BatchMarkers {
        &self.markers
    }

    /// The definition id, used as the partition id of fingerprints.
    pub fn id(&self) -> String {
        self.definition.id()
    }
}

pub struct Datasource {
    name: String,
    engine: Arc<dyn ExecutionEngine>,
    connectors: BTreeMap<String, Arc<dyn DataConnector>>,
}

impl Datasource {
    pub fn new(name: impl Into<String>, engine: Arc<dyn ExecutionEngine>) -> Self {
        Self {
            name: name.into(),
            engine,
            connectors: BTreeMap::new(),
        }
    }

    pub async fn from_config(config: &DatasourceConfig) -> Result<Self> {
        let engine = build_engine(&config.name, &config.execution_engine).await?;
        let mut datasource = Self::new(&config.name, engine);
        for (name, connector_config) in &config.data_connectors {
            let connector =
                build_connector(&config.name, name, connector_config, datasource.engine.clone())?;
            datasource.add_connector(connector)?;
        }
        info!(
            datasource = %datasource.name,
            engine = %datasource.engine.name(),
            connectors = datasource.connectors.len(),
            "Datasource configured"
        );
        Ok(datasource)
    }

    pub fn add_connector(&mut self, connector: Arc<dyn DataConnector>) -> Result<()> {
        if connector.datasource_name() != self.name {
            return Err(BatchError::InvalidConfig(format!(
                "data connector '{}' belongs to datasource '{}', not '{}'",
                connector.name(),
                connector.datasource_name(),
                self.name
            )));
        }
        self.connectors.insert(connector.name().to_string(), connector);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn engine(&self) -> &Arc<dyn ExecutionEngine> {
        &self.engine
    }

    pub fn connector(&self, name: &str) -> Result<&Arc<dyn DataConnector>> {
        self.connectors.get(name).ok_or_else(|| {
            BatchError::InvalidBatchKwargs(format!(
                "datasource '{}' has no data connector '{}'",
                self.name, name
            ))
        })
    }

    pub fn connector_names(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }

    /// Asset names per connector.
    pub async fn list_available_data_asset_names(
        &self,
    ) -> Result<BTreeMap<String, BTreeSet<String>>> {
        let mut names = BTreeMap::new();
        for (name, connector) in &self.connectors {
            names.insert(name.clone(), connector.list_available_data_asset_names().await?);
        }
        Ok(names)
    }

    pub async fn refresh(&self) -> Result<()> {
        for connector in self.connectors.values() {
            connector.refresh().await?;
        }
        Ok(())
    }

    pub async fn get_batch_definition_list(
        &self,
        request: &BatchRequest,
    ) -> Result<Vec<BatchDefinition>> {
        self.connector(&request.data_connector_name)?
            .get_batch_definition_list_from_batch_request(request)
            .await
    }

    /// Resolve, build and fetch every batch the request selects. An empty
    /// list means the asset exists but nothing matched.
    pub async fn get_batch_list(&self, request: &BatchRequest) -> Result<Vec<Batch>> {
        let result = self.run(request).await;
        match &result {
            Ok(batches) if batches.is_empty() => {
                transition(request, ResolutionState::NoMatch, None)
            }
            Ok(_) => {}
            Err(e) => transition(request, e.terminal_state(), Some(e)),
        }
        result
    }

    /// Exactly one batch. Zero matches is `NoMatch`; several is
    /// `AmbiguousBatchRequest` naming how many matched.
    pub async fn get_single_batch(&self, request: &BatchRequest) -> Result<Batch> {
        transition(request, ResolutionState::Requested, None);
        let mut definitions = match self.get_batch_definition_list(request).await {
            Ok(definitions) => definitions,
            Err(e) => {
                transition(request, e.terminal_state(), Some(&e));
                return Err(e);
            }
        };
        let err = match definitions.len() {
            1 => None,
            0 => Some(BatchError::NoMatch {
                connector: request.data_connector_name.clone(),
                asset: request.data_asset_name.clone(),
                identifiers: request.describe_identifiers(),
            }),
            matches => Some(BatchError::AmbiguousBatchRequest {
                connector: request.data_connector_name.clone(),
                asset: request.data_asset_name.clone(),
                identifiers: request.describe_identifiers(),
                matches,
            }),
        };
        if let Some(err) = err {
            transition(request, err.terminal_state(), Some(&err));
            return Err(err);
        }
        let definition = definitions.remove(0);
        self.fetch(request, definition).await.inspect_err(|e| {
            transition(request, e.terminal_state(), Some(e));
        })
    }

    pub async fn get_batch_fingerprint(&self, batch: &Batch) -> Result<BatchFingerprint> {
        self.engine.fingerprint(batch.data(), &batch.id()).await
    }

    async fn run(&self, request: &BatchRequest) -> Result<Vec<Batch>> {
        transition(request, ResolutionState::Requested, None);
        let definitions = self.get_batch_definition_list(request).await?;
        let mut batches = Vec::with_capacity(definitions.len());
        for definition in definitions {
            batches.push(self.fetch(request, definition).await?);
        }
        Ok(batches)
    }

    async fn fetch(&self, request: &BatchRequest, definition: BatchDefinition) -> Result<Batch> {
        debug!(definition = %definition, state = %ResolutionState::Resolved, "Batch state");
        let connector = self.connector(&definition.data_connector_name)?;
        let spec = connector
            .build_batch_spec_for_request(&definition, Some(request))?;
        debug!(
            definition = %definition,
            state = %ResolutionState::SpecBuilt,
            target = spec.target.kind(),
            "Batch state"
        );
        let (data, markers) = self.engine.get_batch_data_and_markers(&spec).await?;
        info!(
            datasource = %self.name,
            definition = %definition,
            state = %ResolutionState::Fetched,
            engine = %self.engine.name(),
            "Batch fetched"
        );
        Ok(Batch::new(Some(request.clone()), definition, spec, data, markers))
    }
}

fn transition(request: &BatchRequest, state: ResolutionState, error: Option<&BatchError>) {
    match error {
        Some(e) => warn!(
            datasource = %request.datasource_name,
            connector = %request.data_connector_name,
            asset = %request.data_asset_name,
            state = %state,
            error = %e,
            "Batch request ended"
        ),
        None => debug!(
            datasource = %request.datasource_name,
            connector = %request.data_connector_name,
            asset = %request.data_asset_name,
            state = %state,
            "Batch state"
        ),
    }
}
