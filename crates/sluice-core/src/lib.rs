//! Sluice Core - batch identity, fetch specs and sampling/splitting policy
//!
//! Pure types shared by the engine adapters and data connectors. Nothing in
//! this crate performs I/O.

pub mod batch;
pub mod error;
pub mod filter;
pub mod resolution;
pub mod sampling;
pub mod spec;
pub mod splitting;
pub mod sql;

pub use batch::{
    BatchDefinition, BatchFingerprint, BatchIdentifiers, BatchIndex, BatchMarkers, BatchRequest,
    IdentifierSelector, IdentifierValue, InMemoryDataset, RuntimeParameters,
};
pub use error::{BatchError, Result};
pub use filter::{FilterCondition, FilterOp, FilterValue};
pub use resolution::ResolutionState;
pub use sampling::SamplingMethod;
pub use spec::{
    parse_s3_uri, BatchSpec, Capability, ReaderMethod, ReaderOptions, SpecTarget, TableRef,
};
pub use splitting::SplitterMethod;
pub use sql::SqlDialect;
