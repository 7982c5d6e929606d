//! Typed errors shared by every sluice crate.

use thiserror::Error;

use crate::resolution::ResolutionState;
use crate::spec::{display_capabilities, Capability};

/// Failures surfaced while resolving a batch request into fetched data.
///
/// An empty resolution is not an error: connectors return an empty
/// definition list when a known asset has no matching partition. Only
/// callers that need exactly one batch turn it into `NoMatch`.
#[derive(Debug, Error)]
pub enum BatchError {
    /// A loose kwargs map or a batch request is missing a required element.
    #[error("invalid batch kwargs: {0}")]
    InvalidBatchKwargs(String),

    /// A fetch specification could not be built or is malformed.
    #[error("invalid batch spec: {0}")]
    InvalidBatchSpec(String),

    /// Batch markers are missing their load timestamp.
    #[error("invalid batch id: {0}")]
    InvalidBatchId(String),

    #[error("data asset '{asset}' is not known to data connector '{connector}'")]
    AssetNotFound { connector: String, asset: String },

    /// A known asset had no partition matching the request where exactly one
    /// batch was required.
    #[error(
        "batch request for data asset '{asset}' on data connector '{connector}' \
         matched no batch (identifiers: {identifiers})"
    )]
    NoMatch {
        connector: String,
        asset: String,
        identifiers: String,
    },

    /// The request under-specifies identifiers where exactly one batch was required.
    #[error(
        "batch request for data asset '{asset}' on data connector '{connector}' \
         matched {matches} batches where exactly one was required (identifiers: {identifiers})"
    )]
    AmbiguousBatchRequest {
        connector: String,
        asset: String,
        identifiers: String,
        matches: usize,
    },

    #[error(
        "execution engine '{engine}' ({capability}) cannot consume a batch spec tagged [{}]",
        display_capabilities(.spec_capabilities)
    )]
    EngineCapabilityMismatch {
        engine: String,
        capability: Capability,
        spec_capabilities: Vec<Capability>,
    },

    /// Invalid datasource, connector or engine configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Listing files or tables for a connector's inventory failed.
    #[error("partition discovery failed for data connector '{connector}': {message}")]
    Discovery { connector: String, message: String },

    /// The backend rejected or failed a call.
    #[error("execution engine '{engine}' failed: {message}")]
    Engine { engine: String, message: String },

    #[error("execution engine '{engine}' timed out after {seconds}s")]
    Timeout { engine: String, seconds: u64 },
}

impl BatchError {
    /// Wrap a backend failure for the named engine.
    pub fn engine(engine: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BatchError::Engine {
            engine: engine.into(),
            message: err.to_string(),
        }
    }

    /// Wrap a listing failure for the named connector.
    pub fn discovery(connector: impl Into<String>, err: impl std::fmt::Display) -> Self {
        BatchError::Discovery {
            connector: connector.into(),
            message: err.to_string(),
        }
    }

    /// The terminal resolution state this failure leaves a request in.
    pub fn terminal_state(&self) -> ResolutionState {
        match self {
            BatchError::AssetNotFound { .. } => ResolutionState::AssetNotFound,
            BatchError::NoMatch { .. } => ResolutionState::NoMatch,
            BatchError::AmbiguousBatchRequest { .. } => ResolutionState::AmbiguousRequest,
            BatchError::InvalidBatchKwargs(_)
            | BatchError::InvalidBatchSpec(_)
            | BatchError::InvalidBatchId(_) => ResolutionState::InvalidSpec,
            BatchError::EngineCapabilityMismatch { .. } => ResolutionState::CapabilityMismatch,
            BatchError::InvalidConfig(_)
            | BatchError::Discovery { .. }
            | BatchError::Engine { .. }
            | BatchError::Timeout { .. } => ResolutionState::Failed,
        }
    }
}

/// Result alias used across sluice.
pub type Result<T> = std::result::Result<T, BatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_mismatch_lists_spec_tags() {
        let err = BatchError::EngineCapabilityMismatch {
            engine: "warehouse".to_string(),
            capability: Capability::Relational,
            spec_capabilities: vec![Capability::InMemory, Capability::Distributed],
        };
        assert_eq!(
            err.to_string(),
            "execution engine 'warehouse' (relational) cannot consume a batch spec tagged [in_memory, distributed]"
        );
    }

    #[test]
    fn asset_not_found_names_connector_and_asset() {
        let err = BatchError::AssetNotFound {
            connector: "configured".to_string(),
            asset: "missing".to_string(),
        };
        assert!(err.to_string().contains("'missing'"));
        assert!(err.to_string().contains("'configured'"));
    }

    #[test]
    fn terminal_states() {
        assert_eq!(
            BatchError::InvalidBatchSpec("x".into()).terminal_state(),
            ResolutionState::InvalidSpec
        );
        assert_eq!(
            BatchError::AmbiguousBatchRequest {
                connector: "c".into(),
                asset: "a".into(),
                identifiers: "{}".into(),
                matches: 2,
            }
            .terminal_state(),
            ResolutionState::AmbiguousRequest
        );
        assert_eq!(
            BatchError::NoMatch {
                connector: "c".into(),
                asset: "a".into(),
                identifiers: "{}".into(),
            }
            .terminal_state(),
            ResolutionState::NoMatch
        );
        assert_eq!(
            BatchError::engine("pg", "boom").terminal_state(),
            ResolutionState::Failed
        );
    }
}
