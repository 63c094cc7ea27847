use std::fmt;

use serde::{Deserialize, Serialize};

/// Deterministic identity of an ingest workflow.
///
/// Derived from `(tenant, table, object_path)` so that redelivery of the same notification maps to
/// the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(String);

impl WorkflowId {
    /// The identity of the ingest workflow for one object of a table.
    pub fn for_ingest(tenant_id: &str, table: &str, object_path: &str) -> Self {
        Self(format!("ingest/{tenant_id}/{table}/{object_path}"))
    }

    /// Wrap an already formatted identity, e.g. one given on the command line.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Input of one ingest workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestRequest {
    pub tenant_id: String,
    pub table: String,
    /// Bucket the raw object landed in.
    pub source: String,
    /// Bucket the transformed data is written to.
    pub destination: String,
    /// Full key of the raw object within `source`.
    pub location: String,
    /// The part of `location` following the `tenant_id=../table=../` prefix.
    pub object_path: String,
}

impl IngestRequest {
    pub fn workflow_id(&self) -> WorkflowId {
        WorkflowId::for_ingest(&self.tenant_id, &self.table, &self.object_path)
    }

    pub fn transform_request(&self) -> TransformRequest {
        TransformRequest {
            tenant_id: self.tenant_id.clone(),
            table: self.table.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            location: self.location.clone(),
        }
    }
}

/// Parameters handed to the transformation binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRequest {
    pub tenant_id: String,
    pub table: String,
    pub source: String,
    pub destination: String,
    pub location: String,
}
