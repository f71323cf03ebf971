//! Target resolution: turns a [`TargetSpec`] into the concrete machines a job
//! or a group view applies to.
//!
//! Resolution always works on a snapshot taken from the state cache (or the
//! gateway while the cache is cold). The predicate runs after the snapshot is
//! taken, with no lock held.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

use crate::cache::StateCache;
use crate::models::{GroupId, GroupType, Machine, MachineId};
use crate::query::{Predicate, QueryCompiler, QueryError};
use crate::store::{PersistenceGateway, StoreError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "target_type", rename_all = "snake_case")]
pub enum TargetSpec {
    Static {
        machine_ids: Vec<MachineId>,
    },
    Dynamic {
        #[serde(default)]
        group_id: Option<GroupId>,
        /// Either an inline JSON document or a string holding one.
        #[serde(default)]
        dynamic_query: Option<Value>,
    },
}

impl TargetSpec {
    pub fn machines<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<MachineId>,
    {
        TargetSpec::Static { machine_ids: ids.into_iter().map(Into::into).collect() }
    }

    pub fn query(query: Value) -> Self {
        TargetSpec::Dynamic { group_id: None, dynamic_query: Some(query) }
    }

    pub fn group(group_id: impl Into<GroupId>) -> Self {
        TargetSpec::Dynamic { group_id: Some(group_id.into()), dynamic_query: None }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    InvalidQuery(#[from] QueryError),
    #[error("group not found: {0}")]
    GroupNotFound(GroupId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lenient JSON parse: empty or malformed input yields `None`, never an error.
pub fn parse_json_maybe(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

#[derive(Default)]
pub struct TargetResolver {
    compiler: QueryCompiler,
}

impl TargetResolver {
    pub fn new(compiler: QueryCompiler) -> Self {
        Self { compiler }
    }

    pub fn compiler(&self) -> &QueryCompiler {
        &self.compiler
    }

    /// Compiles a stored or inline query; strings go through [`parse_json_maybe`].
    pub fn compile(&self, query: Option<&Value>) -> Result<Predicate, QueryError> {
        match query {
            Some(Value::String(raw)) => self.compiler.compile(parse_json_maybe(raw).as_ref()),
            other => self.compiler.compile(other),
        }
    }

    /// Replaces a group reference by what the group stands for: its stored
    /// query for a dynamic group, its member list for a static one.
    pub async fn expand(
        &self,
        spec: &TargetSpec,
        gateway: &dyn PersistenceGateway,
    ) -> Result<TargetSpec, ResolveError> {
        let group_id = match spec {
            TargetSpec::Dynamic { group_id: Some(group_id), dynamic_query: None } => group_id,
            other => return Ok(other.clone()),
        };
        let group = gateway
            .get_group(group_id)
            .await?
            .ok_or_else(|| ResolveError::GroupNotFound(group_id.clone()))?;
        let expanded = match group.group_type {
            GroupType::Dynamic => TargetSpec::Dynamic {
                group_id: Some(group.id),
                dynamic_query: group.query.map(Value::String),
            },
            GroupType::Static => {
                let members = gateway.list_group_members(&group.id).await?;
                TargetSpec::machines(members.into_iter().map(|m| m.machine_id))
            }
        };
        Ok(expanded)
    }

    /// Expands, snapshots and evaluates.
    pub async fn resolve(
        &self,
        spec: &TargetSpec,
        cache: &StateCache,
        gateway: &dyn PersistenceGateway,
    ) -> Result<Vec<Arc<Machine>>, ResolveError> {
        let spec = self.expand(spec, gateway).await?;
        let snapshot = cache.list_machines(gateway).await?;
        self.resolve_in(&spec, &snapshot)
    }

    /// Pure resolution against an already taken snapshot.
    pub fn resolve_in(
        &self,
        spec: &TargetSpec,
        snapshot: &[Arc<Machine>],
    ) -> Result<Vec<Arc<Machine>>, ResolveError> {
        match spec {
            TargetSpec::Static { machine_ids } => {
                let mut seen = HashSet::new();
                let resolved: Vec<Arc<Machine>> = machine_ids
                    .iter()
                    .filter(|id| seen.insert(*id))
                    .filter_map(|id| snapshot.iter().find(|m| &m.id == id).cloned())
                    .collect();
                if resolved.len() < seen.len() {
                    debug!(requested = seen.len(), resolved = resolved.len(), "unknown machine ids dropped");
                }
                Ok(resolved)
            }
            TargetSpec::Dynamic { dynamic_query, .. } => {
                let predicate = self.compile(dynamic_query.as_ref())?;
                Ok(snapshot.iter().filter(|m| predicate.matches(m)).cloned().collect())
            }
        }
    }
}
