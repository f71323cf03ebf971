//! Error taxonomy of the kernel core.

use crate::models::MachineId;
use crate::query::QueryError;
use crate::resolver::ResolveError;
use crate::store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    #[error("validation failure: {reason}")]
    ValidationFailure { reason: String },
    #[error("unknown message kind: {0}")]
    UnknownMessageKind(String),
    #[error("no targets resolved")]
    TargetResolutionEmpty,
    #[error("dispatch to {machine_id} failed: {reason}")]
    DispatchFailure { machine_id: MachineId, reason: String },
    #[error("persistence unavailable: {0}")]
    PersistenceUnavailable(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl From<StoreError> for KernelError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => KernelError::NotFound { entity, id },
            other => KernelError::PersistenceUnavailable(other.to_string()),
        }
    }
}

impl From<ResolveError> for KernelError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::InvalidQuery(e) => KernelError::InvalidQuery(e.to_string()),
            ResolveError::GroupNotFound(id) => KernelError::NotFound { entity: "group", id },
            ResolveError::Store(e) => e.into(),
        }
    }
}

impl From<QueryError> for KernelError {
    fn from(err: QueryError) -> Self {
        KernelError::InvalidQuery(err.to_string())
    }
}

pub type KernelResult<T> = Result<T, KernelError>;
