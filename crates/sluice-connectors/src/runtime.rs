//! Connector for data supplied with the request itself.

use std::collections::BTreeSet;

use async_trait::async_trait;
use sluice_core::{
    BatchDefinition, BatchError, BatchIdentifiers, BatchRequest, BatchSpec, IdentifierSelector,
    ReaderOptions, Result, RuntimeParameters, SpecTarget,
};
use tracing::debug;

use crate::factory::ConnectorKind;
use crate::resolve::{check_request, effective_sampling};
use crate::DataConnector;

/// Resolves every request to exactly one definition. There is no inventory:
/// the data reference travels in the request's `runtime_parameters`.
pub struct RuntimeDataConnector {
    name: String,
    datasource_name: String,
    /// Identifier keys requests may use to label their batch.
    batch_identifiers: BTreeSet<String>,
    reader_options: ReaderOptions,
}

impl RuntimeDataConnector {
    pub fn new(
        datasource_name: impl Into<String>,
        name: impl Into<String>,
        batch_identifiers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            name: name.into(),
            datasource_name: datasource_name.into(),
            batch_identifiers: batch_identifiers.into_iter().map(Into::into).collect(),
            reader_options: ReaderOptions::default(),
        }
    }

    pub fn with_reader_options(mut self, options: ReaderOptions) -> Self {
        self.reader_options = options;
        self
    }

    fn identifiers(&self, request: &BatchRequest) -> Result<BatchIdentifiers> {
        let mut identifiers = BatchIdentifiers::new();
        for (key, selector) in &request.batch_identifiers {
            if !self.batch_identifiers.contains(key) {
                return Err(BatchError::InvalidBatchKwargs(format!(
                    "batch identifier '{}' is not configured on runtime data connector '{}' \
                     (allowed: {:?})",
                    key, self.name, self.batch_identifiers
                )));
            }
            match selector {
                IdentifierSelector::Value(value) => {
                    identifiers.insert(key.clone(), value.clone());
                }
                IdentifierSelector::Predicate(_) => {
                    return Err(BatchError::InvalidBatchKwargs(format!(
                        "runtime batch identifier '{}' must be a value, not a predicate",
                        key
                    )))
                }
            }
        }
        Ok(identifiers)
    }
}

#[async_trait]
impl DataConnector for RuntimeDataConnector {
    fn name(&self) -> &str {
        &self.name
    }

    fn datasource_name(&self) -> &str {
        &self.datasource_name
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Runtime
    }

    async fn list_available_data_asset_names(&self) -> Result<BTreeSet<String>> {
        Ok(BTreeSet::new())
    }

    async fn get_batch_definition_list_from_batch_request(
        &self,
        request: &BatchRequest,
    ) -> Result<Vec<BatchDefinition>> {
        check_request(self, request)?;
        if request.runtime_parameters.is_none() {
            return Err(BatchError::InvalidBatchKwargs(format!(
                "runtime data connector '{}' requires runtime_parameters",
                self.name
            )));
        }
        let identifiers = self.identifiers(request)?;
        debug!(connector = %self.name, asset = %request.data_asset_name, "Runtime definition");
        Ok(vec![BatchDefinition::new(
            &self.datasource_name,
            &self.name,
            &request.data_asset_name,
            identifiers,
        )])
    }

    fn build_batch_spec_for_request(
        &self,
        definition: &BatchDefinition,
        request: Option<&BatchRequest>,
    ) -> Result<BatchSpec> {
        let parameters = request
            .and_then(|r| r.runtime_parameters.as_ref())
            .ok_or_else(|| {
                BatchError::InvalidBatchSpec(format!(
                    "runtime batch '{}' can only be built from its request's runtime_parameters",
                    definition.data_asset_name
                ))
            })?;
        let target = match parameters {
            RuntimeParameters::Query(query) => SpecTarget::query(query.clone()),
            RuntimeParameters::Path(path) => SpecTarget::Path {
                path: path.clone(),
                reader_method: None,
                reader_options: self.reader_options.clone(),
            },
            RuntimeParameters::BatchData(dataset) => SpecTarget::InMemory(dataset.clone()),
        };
        let spec = BatchSpec::new(
            &definition.data_asset_name,
            definition.batch_identifiers.clone(),
            target,
        )
        .with_sampling(effective_sampling(None, request));
        spec.validate()?;
        Ok(spec)
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sluice_core::{FilterCondition, FilterOp, FilterValue, IdentifierValue};

    fn connector() -> RuntimeDataConnector {
        RuntimeDataConnector::new("warehouse", "adhoc", ["run_id", "pipeline_stage"])
    }

    fn request() -> BatchRequest {
        BatchRequest::new("warehouse", "adhoc", "daily_counts")
            .with_runtime_parameters(RuntimeParameters::Query(
                "SELECT 1 AS n".to_string(),
            ))
            .with_identifier("run_id", 42)
    }

    #[tokio::test]
    async fn test_single_definition_from_request() {
        let connector = connector();
        let definitions = connector
            .get_batch_definition_list_from_batch_request(&request())
            .await
            .unwrap();
        assert_eq!(definitions.len(), 1);
        assert_eq!(
            definitions[0].batch_identifiers.get("run_id"),
            Some(&IdentifierValue::Int(42))
        );
        assert!(connector.list_available_data_asset_names().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spec_from_runtime_query() {
        let connector = connector();
        let request = request();
        let definitions = connector
            .get_batch_definition_list_from_batch_request(&request)
            .await
            .unwrap();
        let spec = connector
            .build_batch_spec_for_request(&definitions[0], Some(&request))
            .unwrap();
        assert!(matches!(spec.target, SpecTarget::Query { ref query } if query == "SELECT 1 AS n"));

        let err = connector.build_batch_spec(&definitions[0]).unwrap_err();
        assert!(matches!(err, BatchError::InvalidBatchSpec(_)));
    }

    #[tokio::test]
    async fn test_unknown_identifier_key() {
        let request = request().with_identifier("airflow_run", "x");
        let err = connector()
            .get_batch_definition_list_from_batch_request(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidBatchKwargs(_)));
    }

    #[tokio::test]
    async fn test_predicate_rejected() {
        let request = request().with_predicate(
            "run_id",
            FilterCondition::new(FilterOp::Gt, FilterValue::Number(1.0)),
        );
        let err = connector()
            .get_batch_definition_list_from_batch_request(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidBatchKwargs(_)));
    }

    #[tokio::test]
    async fn test_missing_runtime_parameters() {
        let request = BatchRequest::new("warehouse", "adhoc", "daily_counts");
        let err = connector()
            .get_batch_definition_list_from_batch_request(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::InvalidBatchKwargs(_)));
    }
}
