//! Request and definition checks shared by the connectors.

use std::collections::BTreeSet;

use sluice_core::{BatchDefinition, BatchError, BatchRequest, Result, SamplingMethod};

use crate::inventory::Inventory;
use crate::DataConnector;

/// Reject malformed requests and requests addressed to another connector.
pub(crate) fn check_request<C: DataConnector + ?Sized>(
    connector: &C,
    request: &BatchRequest,
) -> Result<()> {
    request.validate()?;
    if request.datasource_name != connector.datasource_name() {
        return Err(BatchError::InvalidBatchKwargs(format!(
            "request for datasource '{}' sent to datasource '{}'",
            request.datasource_name,
            connector.datasource_name()
        )));
    }
    if request.data_connector_name != connector.name() {
        return Err(BatchError::InvalidBatchKwargs(format!(
            "request for data connector '{}' sent to data connector '{}'",
            request.data_connector_name,
            connector.name()
        )));
    }
    Ok(())
}

pub(crate) fn definitions_from_inventory<C: DataConnector + ?Sized>(
    connector: &C,
    inventory: &Inventory,
    request: &BatchRequest,
) -> Result<Vec<BatchDefinition>> {
    let partitions = inventory
        .partitions(&request.data_asset_name)
        .ok_or_else(|| BatchError::AssetNotFound {
            connector: connector.name().to_string(),
            asset: request.data_asset_name.clone(),
        })?;
    // Partitions are kept sorted by identifiers.
    let definitions: Vec<BatchDefinition> = partitions
        .iter()
        .filter(|p| request.matches(&p.batch_identifiers))
        .map(|p| {
            BatchDefinition::new(
                connector.datasource_name(),
                connector.name(),
                &request.data_asset_name,
                p.batch_identifiers.clone(),
            )
        })
        .collect();
    Ok(request.select(definitions))
}

/// Reject definitions produced by another connector, or carrying identifier
/// keys other than `keys`.
pub(crate) fn check_definition<C: DataConnector + ?Sized>(
    connector: &C,
    definition: &BatchDefinition,
    keys: &[String],
) -> Result<()> {
    if definition.datasource_name != connector.datasource_name()
        || definition.data_connector_name != connector.name()
    {
        return Err(BatchError::InvalidBatchSpec(format!(
            "definition {} does not belong to data connector '{}'",
            definition,
            connector.name()
        )));
    }
    if definition.data_asset_name.is_empty() {
        return Err(BatchError::InvalidBatchSpec(format!(
            "definition {} names no data asset",
            definition
        )));
    }
    let given: BTreeSet<&str> = definition.batch_identifiers.keys().map(String::as_str).collect();
    let expected: BTreeSet<&str> = keys.iter().map(String::as_str).collect();
    if given != expected {
        return Err(BatchError::InvalidBatchSpec(format!(
            "definition {} has identifier keys {:?}, expected {:?}",
            definition, given, expected
        )));
    }
    Ok(())
}

/// Request-level sampling wins over the asset's configured sampling.
pub(crate) fn effective_sampling(
    configured: Option<&SamplingMethod>,
    request: Option<&BatchRequest>,
) -> Option<SamplingMethod> {
    request
        .and_then(|r| r.sampling.clone())
        .or_else(|| configured.cloned())
}
