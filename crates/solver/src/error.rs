use thiserror::Error;

use crate::trust_region::SolveStatus;
use crate::variable::{ObjectId, PlacementKind, VariableKey};

/// Errors produced while building or solving a placement problem.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("invalid selection: {reason}")]
    Selection { reason: String },

    #[error("equality constraints form a cycle through {variable}")]
    CyclicAlias { variable: VariableKey },

    #[error("constraint {constraint} has no enabled axes")]
    Underdetermined { constraint: String },

    #[error("division by zero in {operation}")]
    DivisionSingularity { operation: &'static str },

    #[error(
        "solver did not converge ({status:?}) after {iterations} iterations (gradient norm: {gradient_norm:e})"
    )]
    DidNotConverge {
        status: SolveStatus,
        iterations: usize,
        gradient_norm: f64,
    },

    #[error("unknown object: {object}")]
    UnknownObject { object: ObjectId },

    #[error("placement {object}.{kind} was not registered for this solve")]
    MissingPlacement { object: ObjectId, kind: PlacementKind },

    #[error("variable registry misuse: {reason}")]
    RegistryState { reason: &'static str },

    #[error("document error: {0}")]
    Document(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SolverError>;
