//! Stack-output and resource data model.
//!
//! These types are the serialized shape of the control plane's view of the
//! provisioned stack: the raw resource records reported by the infra driver,
//! plus the bucket/namespace/table selection the service front hands out.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of provisioned resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// The bucket holding all table data for a stack
    TableBucket,
    /// The namespace grouping tables within the bucket
    Namespace,
    /// One managed table, backed by a top-level data directory
    Table,
}

/// One resource record as reported by the infra driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Resource kind
    #[serde(rename = "type")]
    pub resource_type: ResourceType,
    /// Normalized resource name
    pub name: String,
    /// Driver-specific outputs (location, ARN-like identifiers, format)
    pub outputs: serde_json::Value,
}

/// Snapshot of the provisioned stack, assembled by the control-plane owner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackOutputs {
    pub project_name: String,
    pub stack_name: String,
    /// All resource records, unfiltered
    pub resources: Vec<ResourceRecord>,
    /// The stack's table bucket, if materialized
    pub table_bucket: Option<ResourceRecord>,
    /// The stack's table namespace, if materialized
    pub table_namespace: Option<ResourceRecord>,
    /// Table records only
    pub tables: Vec<ResourceRecord>,
}

impl StackOutputs {
    /// Build a snapshot from raw records, selecting the bucket, namespace and
    /// tables out of the full list by resource type.
    pub fn from_records(
        project_name: impl Into<String>,
        stack_name: impl Into<String>,
        resources: Vec<ResourceRecord>,
    ) -> Self {
        let table_bucket = resources
            .iter()
            .find(|r| r.resource_type == ResourceType::TableBucket)
            .cloned();
        let table_namespace = resources
            .iter()
            .find(|r| r.resource_type == ResourceType::Namespace)
            .cloned();
        let tables = resources
            .iter()
            .filter(|r| r.resource_type == ResourceType::Table)
            .cloned()
            .collect();

        Self {
            project_name: project_name.into(),
            stack_name: stack_name.into(),
            resources,
            table_bucket,
            table_namespace,
            tables,
        }
    }
}

/// A registered data resource as tracked by the control-plane owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceInfo {
    /// Normalized resource name
    pub name: String,
    /// Storage location reported by the driver, if any
    pub location: Option<String>,
    /// Rows ingested through the local loop
    pub row_count: u64,
    /// When the resource was registered with the control plane
    pub registered_at: DateTime<Utc>,
}

/// Normalize a raw directory or project name into a resource name: lowercase,
/// with every non-alphanumeric character replaced by `_`.
pub fn normalize_resource_name(raw: &str) -> String {
    raw.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}
