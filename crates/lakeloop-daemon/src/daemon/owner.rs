//! Control-plane owner: the single context allowed to touch stack state.
//!
//! The underlying [`InfraDriver`] is unsafe to call concurrently, so every
//! mutation and query funnels through [`ControlPlaneOwner`] methods, invoked
//! only from the owner loop (and from one-shot CLI commands, where the whole
//! process is that one context).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use lakeloop_core::config::ProjectConfig;
use lakeloop_core::stack::{
    ResourceInfo, ResourceRecord, ResourceType, StackOutputs, normalize_resource_name,
};

/// Control-plane and driver failures.
#[derive(Debug, Error)]
pub enum DriverError {
    /// I/O error against the driver's state store
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Corrupt state store
    #[error("stack state parse error: {0}")]
    Parse(#[from] serde_json::Error),

    /// Query for a resource the control plane does not know
    #[error("unknown resource: {0}")]
    UnknownResource(String),

    /// A path that does not name a resource directory
    #[error("path has no resource name: {0}")]
    InvalidPath(PathBuf),

    /// Malformed job request
    #[error("invalid job request: {0}")]
    InvalidJob(String),

    /// Any other driver-side failure
    #[error("driver failure: {0}")]
    Failed(String),
}

/// Opaque infrastructure driver. May block on slow network calls; must only
/// ever be invoked from one context at a time.
pub trait InfraDriver: Send {
    /// Provision the stack's base resources (bucket and namespace).
    fn materialize(&mut self) -> Result<(), DriverError>;

    /// Re-read provisioned state from the backing store.
    fn refresh(&mut self) -> Result<(), DriverError>;

    /// Tear down every provisioned resource.
    fn destroy(&mut self) -> Result<(), DriverError>;

    /// Provision one table resource under the stack's namespace.
    fn register_resource(&mut self, name: &str) -> Result<ResourceRecord, DriverError>;

    /// All provisioned resource records.
    fn records(&self) -> &[ResourceRecord];

    fn project_name(&self) -> &str;

    fn stack_name(&self) -> &str;
}

/// On-disk shape of the local driver's stack state.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StackStateFile {
    resources: Vec<ResourceRecord>,
}

/// Local stand-in for a cloud driver: provisioning writes resource records to
/// `<project>/.lakeloop/stack.json`, so the dev loop and the one-shot
/// commands work without credentials.
pub struct LocalDriver {
    project_name: String,
    project_slug: String,
    stack_name: String,
    region: String,
    state_path: PathBuf,
    resources: Vec<ResourceRecord>,
}

impl LocalDriver {
    pub fn new(config: &ProjectConfig) -> Result<Self, DriverError> {
        let state_path = config.state_dir().join("stack.json");
        let mut driver = Self {
            project_name: config.project_name.clone(),
            project_slug: config.project_slug.clone(),
            stack_name: config.stack_name.clone(),
            region: config.region.clone(),
            state_path,
            resources: Vec::new(),
        };
        // Pick up state left by a previous run
        if driver.state_path.exists() {
            driver.refresh()?;
        }
        Ok(driver)
    }

    fn bucket_name(&self) -> String {
        format!("{}tables", self.project_slug)
    }

    fn namespace_name(&self) -> String {
        format!("{}namespace", self.project_slug)
    }

    fn has(&self, resource_type: ResourceType, name: &str) -> bool {
        self.resources
            .iter()
            .any(|r| r.resource_type == resource_type && r.name == name)
    }

    /// Bucket and namespace are created lazily, before the first table.
    fn ensure_base_resources(&mut self) {
        let bucket = self.bucket_name();
        if !self.has(ResourceType::TableBucket, &bucket) {
            info!("Provisioning table bucket: {bucket}");
            self.resources.push(ResourceRecord {
                resource_type: ResourceType::TableBucket,
                name: bucket.clone(),
                outputs: json!({
                    "name": bucket,
                    "region": self.region,
                    "location": format!("local://{bucket}"),
                }),
            });
        }

        let namespace = self.namespace_name();
        if !self.has(ResourceType::Namespace, &namespace) {
            info!("Provisioning namespace: {namespace}");
            self.resources.push(ResourceRecord {
                resource_type: ResourceType::Namespace,
                name: namespace.clone(),
                outputs: json!({
                    "namespace": namespace,
                    "bucket": bucket,
                }),
            });
        }
    }

    fn persist(&self) -> Result<(), DriverError> {
        let io_err = |source| DriverError::Io {
            path: self.state_path.clone(),
            source,
        };
        if let Some(parent) = self.state_path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let state = StackStateFile {
            resources: self.resources.clone(),
        };
        let contents = serde_json::to_string_pretty(&state)?;
        std::fs::write(&self.state_path, contents).map_err(io_err)
    }
}

impl InfraDriver for LocalDriver {
    fn materialize(&mut self) -> Result<(), DriverError> {
        self.ensure_base_resources();
        self.persist()
    }

    fn refresh(&mut self) -> Result<(), DriverError> {
        let contents = std::fs::read_to_string(&self.state_path).map_err(|source| {
            DriverError::Io {
                path: self.state_path.clone(),
                source,
            }
        })?;
        let state: StackStateFile = serde_json::from_str(&contents)?;
        self.resources = state.resources;
        debug!(
            "Refreshed stack state: {} resource(s) from {}",
            self.resources.len(),
            self.state_path.display()
        );
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), DriverError> {
        info!("Destroying stack {} ({} resources)", self.stack_name, self.resources.len());
        self.resources.clear();
        if self.state_path.exists() {
            std::fs::remove_file(&self.state_path).map_err(|source| DriverError::Io {
                path: self.state_path.clone(),
                source,
            })?;
        }
        Ok(())
    }

    fn register_resource(&mut self, name: &str) -> Result<ResourceRecord, DriverError> {
        self.ensure_base_resources();

        if let Some(existing) = self
            .resources
            .iter()
            .find(|r| r.resource_type == ResourceType::Table && r.name == name)
        {
            return Ok(existing.clone());
        }

        let bucket = self.bucket_name();
        let namespace = self.namespace_name();
        let record = ResourceRecord {
            resource_type: ResourceType::Table,
            name: name.to_string(),
            outputs: json!({
                "name": name,
                "format": "ICEBERG",
                "location": format!("local://{bucket}/{namespace}/{name}"),
            }),
        };
        self.resources.push(record.clone());
        self.persist()?;
        info!("Provisioned table: {name}");
        Ok(record)
    }

    fn records(&self) -> &[ResourceRecord] {
        &self.resources
    }

    fn project_name(&self) -> &str {
        &self.project_name
    }

    fn stack_name(&self) -> &str {
        &self.stack_name
    }
}

/// Owner of all mutable control-plane state.
pub struct ControlPlaneOwner {
    driver: Box<dyn InfraDriver>,
    data_root: PathBuf,
    resources: BTreeMap<String, ResourceInfo>,
}

impl ControlPlaneOwner {
    pub fn new(driver: Box<dyn InfraDriver>, data_root: PathBuf) -> Self {
        let mut owner = Self {
            driver,
            data_root,
            resources: BTreeMap::new(),
        };
        owner.seed_from_driver();
        owner
    }

    /// Rebuild the registry from table records the driver already knows.
    fn seed_from_driver(&mut self) {
        for record in self.driver.records() {
            if record.resource_type != ResourceType::Table {
                continue;
            }
            self.resources
                .entry(record.name.clone())
                .or_insert_with(|| info_from_record(record));
        }
    }

    /// One-time synchronous materialization: provision the base resources and
    /// register a table for every data directory already present.
    pub fn materialize(&mut self) -> Result<(), DriverError> {
        self.driver.materialize()?;

        for path in self.top_level_dirs()? {
            self.register_resource_for_path(&path)?;
        }
        Ok(())
    }

    pub fn refresh(&mut self) -> Result<(), DriverError> {
        self.driver.refresh()?;
        self.resources.clear();
        self.seed_from_driver();
        Ok(())
    }

    pub fn destroy(&mut self) -> Result<(), DriverError> {
        self.driver.destroy()?;
        self.resources.clear();
        Ok(())
    }

    /// Register the resource backing a data directory. Registering the same
    /// normalized name twice yields the one existing resource.
    pub fn register_resource_for_path(&mut self, path: &Path) -> Result<ResourceInfo, DriverError> {
        let raw = path
            .file_name()
            .and_then(|s| s.to_str())
            .ok_or_else(|| DriverError::InvalidPath(path.to_path_buf()))?;
        let name = normalize_resource_name(raw);

        if let Some(existing) = self.resources.get(&name) {
            debug!("Resource {name} already registered");
            return Ok(existing.clone());
        }

        let record = self.driver.register_resource(&name)?;
        let info = info_from_record(&record);
        info!("Registered resource {name} for {}", path.display());
        self.resources.insert(name, info.clone());
        Ok(info)
    }

    /// Snapshot of the provisioned stack.
    pub fn stack_outputs(&self) -> StackOutputs {
        StackOutputs::from_records(
            self.driver.project_name(),
            self.driver.stack_name(),
            self.driver.records().to_vec(),
        )
    }

    pub fn resource_info(&self, name: &str) -> Result<ResourceInfo, DriverError> {
        let name = normalize_resource_name(name);
        self.resources
            .get(&name)
            .cloned()
            .ok_or(DriverError::UnknownResource(name))
    }

    /// Append records to a registered resource.
    pub fn ingest_records(&mut self, resource: &str, records: &[Value]) -> Result<usize, DriverError> {
        let name = normalize_resource_name(resource);
        let info = self
            .resources
            .get_mut(&name)
            .ok_or(DriverError::UnknownResource(name))?;
        info.row_count += records.len() as u64;
        debug!(
            "Ingested {} record(s) into {} (total {})",
            records.len(),
            info.name,
            info.row_count
        );
        Ok(records.len())
    }

    /// Kick off a named processing job. Job execution itself is external;
    /// the control plane validates the request and mints a run id.
    pub fn trigger_job(&mut self, job: &str, arguments: &Value) -> Result<Uuid, DriverError> {
        if job.trim().is_empty() {
            return Err(DriverError::InvalidJob("empty job name".to_string()));
        }
        if let Some(resource) = arguments.get("resource").and_then(Value::as_str) {
            let name = normalize_resource_name(resource);
            if !self.resources.contains_key(&name) {
                return Err(DriverError::UnknownResource(name));
            }
        }
        let run_id = Uuid::new_v4();
        info!("Triggered job {job} (run {run_id})");
        Ok(run_id)
    }

    /// Data directories present on disk but not yet registered.
    pub fn pending_resources(&self) -> Result<Vec<String>, DriverError> {
        let mut pending = Vec::new();
        for path in self.top_level_dirs()? {
            if let Some(raw) = path.file_name().and_then(|s| s.to_str()) {
                let name = normalize_resource_name(raw);
                if !self.resources.contains_key(&name) {
                    pending.push(name);
                }
            }
        }
        Ok(pending)
    }

    fn top_level_dirs(&self) -> Result<Vec<PathBuf>, DriverError> {
        let io_err = |source| DriverError::Io {
            path: self.data_root.clone(),
            source,
        };
        let mut dirs = Vec::new();
        if !self.data_root.exists() {
            return Ok(dirs);
        }
        for entry in std::fs::read_dir(&self.data_root).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let path = entry.path();
            if path.is_dir() {
                dirs.push(path);
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

fn info_from_record(record: &ResourceRecord) -> ResourceInfo {
    ResourceInfo {
        name: record.name.clone(),
        location: record
            .outputs
            .get("location")
            .and_then(Value::as_str)
            .map(String::from),
        row_count: 0,
        registered_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lakeloop_core::config::{ConfigOverrides, resolve_config};
    use tempfile::TempDir;

    fn test_setup() -> (TempDir, ProjectConfig) {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("lakeloop.toml"),
            "project_name = \"demo\"",
        )
        .unwrap();
        std::fs::create_dir_all(temp.path().join("data")).unwrap();
        let config = resolve_config(&ConfigOverrides::default(), temp.path()).unwrap();
        (temp, config)
    }

    fn test_owner(config: &ProjectConfig) -> ControlPlaneOwner {
        let driver = LocalDriver::new(config).unwrap();
        ControlPlaneOwner::new(Box::new(driver), config.data_dir.clone())
    }

    #[test]
    fn materialize_provisions_base_and_existing_dirs() {
        let (_temp, config) = test_setup();
        std::fs::create_dir_all(config.data_dir.join("orders")).unwrap();
        std::fs::create_dir_all(config.data_dir.join("users")).unwrap();

        let mut owner = test_owner(&config);
        owner.materialize().unwrap();

        let outputs = owner.stack_outputs();
        assert_eq!(outputs.project_name, "demo");
        assert_eq!(outputs.table_bucket.unwrap().name, "demotables");
        assert_eq!(outputs.table_namespace.unwrap().name, "demonamespace");
        assert_eq!(outputs.tables.len(), 2);
    }

    #[test]
    fn register_twice_yields_one_resource() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);

        owner
            .register_resource_for_path(&config.data_dir.join("orders"))
            .unwrap();
        owner
            .register_resource_for_path(&config.data_dir.join("orders"))
            .unwrap();
        // Same normalized name through a different raw spelling
        owner
            .register_resource_for_path(&config.data_dir.join("Orders"))
            .unwrap();

        assert_eq!(owner.stack_outputs().tables.len(), 1);
    }

    #[test]
    fn resource_name_is_normalized() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);

        let info = owner
            .register_resource_for_path(&config.data_dir.join("Raw-Events.v2"))
            .unwrap();
        assert_eq!(info.name, "raw_events_v2");
        assert!(info.location.as_deref().unwrap().contains("raw_events_v2"));
    }

    #[test]
    fn unknown_resource_query_fails() {
        let (_temp, config) = test_setup();
        let owner = test_owner(&config);

        let err = owner.resource_info("nope").unwrap_err();
        assert!(matches!(err, DriverError::UnknownResource(_)));
    }

    #[test]
    fn ingest_bumps_row_count() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);
        owner
            .register_resource_for_path(&config.data_dir.join("orders"))
            .unwrap();

        let records = vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})];
        let count = owner.ingest_records("orders", &records).unwrap();
        assert_eq!(count, 3);
        assert_eq!(owner.resource_info("orders").unwrap().row_count, 3);
    }

    #[test]
    fn trigger_job_validates_resource_argument() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);
        owner
            .register_resource_for_path(&config.data_dir.join("orders"))
            .unwrap();

        owner
            .trigger_job("retl", &json!({"resource": "orders"}))
            .unwrap();

        let err = owner
            .trigger_job("retl", &json!({"resource": "missing"}))
            .unwrap_err();
        assert!(matches!(err, DriverError::UnknownResource(_)));

        let err = owner.trigger_job("", &json!({})).unwrap_err();
        assert!(matches!(err, DriverError::InvalidJob(_)));
    }

    #[test]
    fn state_survives_driver_restart() {
        let (_temp, config) = test_setup();
        {
            let mut owner = test_owner(&config);
            owner
                .register_resource_for_path(&config.data_dir.join("orders"))
                .unwrap();
        }

        // Fresh driver and owner over the same project
        let owner = test_owner(&config);
        assert_eq!(owner.resource_info("orders").unwrap().name, "orders");
        assert_eq!(owner.stack_outputs().tables.len(), 1);
    }

    #[test]
    fn destroy_clears_state() {
        let (_temp, config) = test_setup();
        let mut owner = test_owner(&config);
        owner.materialize().unwrap();
        owner
            .register_resource_for_path(&config.data_dir.join("orders"))
            .unwrap();

        owner.destroy().unwrap();
        assert!(owner.stack_outputs().resources.is_empty());
        assert!(matches!(
            owner.resource_info("orders").unwrap_err(),
            DriverError::UnknownResource(_)
        ));
    }

    #[test]
    fn pending_resources_lists_unregistered_dirs() {
        let (_temp, config) = test_setup();
        std::fs::create_dir_all(config.data_dir.join("orders")).unwrap();
        std::fs::create_dir_all(config.data_dir.join("users")).unwrap();

        let mut owner = test_owner(&config);
        owner
            .register_resource_for_path(&config.data_dir.join("orders"))
            .unwrap();

        assert_eq!(owner.pending_resources().unwrap(), vec!["users"]);
    }
}
