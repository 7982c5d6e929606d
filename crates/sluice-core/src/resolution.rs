//! States a batch request moves through on its way to fetched data.

use std::fmt;

/// `Requested -> Resolved -> SpecBuilt -> Fetched` on success. Every other
/// variant is terminal. `NoMatch` is a valid empty resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionState {
    Requested,
    Resolved,
    SpecBuilt,
    Fetched,
    AssetNotFound,
    NoMatch,
    AmbiguousRequest,
    InvalidSpec,
    CapabilityMismatch,
    /// Backend, discovery or configuration failure.
    Failed,
}

impl ResolutionState {
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            ResolutionState::Requested | ResolutionState::Resolved | ResolutionState::SpecBuilt
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ResolutionState::Fetched | ResolutionState::NoMatch)
    }
}

impl fmt::Display for ResolutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionState::Requested => "requested",
            ResolutionState::Resolved => "resolved",
            ResolutionState::SpecBuilt => "spec_built",
            ResolutionState::Fetched => "fetched",
            ResolutionState::AssetNotFound => "asset_not_found",
            ResolutionState::NoMatch => "no_match",
            ResolutionState::AmbiguousRequest => "ambiguous_request",
            ResolutionState::InvalidSpec => "invalid_spec",
            ResolutionState::CapabilityMismatch => "capability_mismatch",
            ResolutionState::Failed => "failed",
        };
        f.write_str(name)
    }
}
