//! Top-level error types for pipeline runs.
//!
//! The runtime draws a hard line between two kinds of failure:
//!
//! - **Degradations** (LLM timeouts, provider errors, failed analysts,
//!   stalled debates) are *data*. They are captured as status-bearing state
//!   patches and the run still returns a [`DecisionReport`](crate::report::DecisionReport),
//!   possibly with `decision = ERROR`.
//! - **Programming errors** (invalid topology, a node writing outside its
//!   declared write-set, two patches writing the same scalar in one merge
//!   batch, malformed inputs) abort the run with a [`PipelineError`]
//!   diagnostic.
//!
//! Layer-specific errors (`StateError`, `NodeError`, `ToolError`,
//! `LlmError`, `ProviderError`) live next to the code that produces them and
//! convert into `PipelineError` only when they represent a contract breach.

use crate::state::StateError;
use thiserror::Error;

/// Convenience result type using [`PipelineError`].
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Errors that abort a run instead of degrading it.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Graph structure is invalid (missing stage, dangling edge, bad entry).
    #[error("graph validation failed: {0}")]
    Validation(String),

    /// A node wrote outside its declared write-set, or a conditional edge
    /// routed to a target outside its declared branches.
    #[error("contract violation in '{node}': {detail}")]
    ContractViolation {
        /// Stage or node that broke its contract.
        node: String,
        /// What went wrong.
        detail: String,
    },

    /// State-store contract breach (conflicting scalar write, undeclared
    /// field, type mismatch against the declared schema).
    #[error(transparent)]
    State(#[from] StateError),

    /// The run hit its node-invocation ceiling. The driver converts this
    /// into an `ERROR` decision with a diagnostic instead of panicking or
    /// looping forever on a cyclic conditional edge.
    #[error("recursion limit {limit} exceeded at '{node}'")]
    RecursionLimit {
        /// Node whose invocation crossed the limit.
        node: String,
        /// The configured ceiling.
        limit: u32,
    },

    /// Caller-supplied input failed validation before the graph started.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration could not be loaded or is internally inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl PipelineError {
    /// Shorthand for a contract violation with context.
    pub fn contract(node: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::ContractViolation {
            node: node.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_violation_formats_node_and_detail() {
        let err = PipelineError::contract("market_analyst", "wrote undeclared field 'foo'");
        let msg = err.to_string();
        assert!(msg.contains("market_analyst"));
        assert!(msg.contains("undeclared field"));
    }
}
