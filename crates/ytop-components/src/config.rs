//! Config Provider: per-component server configuration payloads
//!
//! Payloads are JSON documents rendered from the cluster spec. Rendering is
//! deterministic (object keys are sorted), so an unchanged spec always yields
//! the same bytes and a deployed payload can be compared to a fresh one.

#[cfg(test)]
use mockall::automock;
use serde_json::{json, Map, Value};

use ytop_common::crd::{InstanceSpec, LocationType, LogWriterType};
use ytop_common::{Error, Result};

use crate::cluster::ClusterInfo;
use crate::kind::{ComponentId, ComponentKind};

/// Produces configuration payloads for components
#[cfg_attr(test, automock)]
pub trait ConfigProvider: Send + Sync {
    /// Render the payload of a component
    ///
    /// `overrides` is the raw override document for this component's config
    /// file, when the cluster references an overrides artifact that has one.
    fn generate(
        &self,
        id: &ComponentId,
        cluster: &ClusterInfo,
        overrides: Option<String>,
    ) -> Result<String>;

    /// Whether a deployed payload is stale relative to a desired one
    fn needs_reload(&self, deployed: &str, desired: &str) -> bool;
}

/// JSON config provider
#[derive(Clone, Debug, Default)]
pub struct JsonConfigProvider;

impl JsonConfigProvider {
    fn base(&self, id: &ComponentId, cluster: &ClusterInfo, instance: &InstanceSpec) -> Value {
        let spec = &cluster.spec;
        let ns = cluster.namespace.as_str();
        let masters = ComponentId::single(ComponentKind::PrimaryMaster)
            .pod_addresses(ns, spec.primary_masters.instance.instance_count);
        let discovery = ComponentId::single(ComponentKind::Discovery)
            .pod_addresses(ns, spec.discovery.instance_count);

        json!({
            "rpc_port": id.kind.rpc_port(),
            "monitoring_port": id.kind.monitoring_port(),
            "cluster_connection": {
                "cluster_name": cluster.name,
                "primary_master": {
                    "addresses": masters,
                    "cell_id": cell_id(spec.primary_masters.cell_tag),
                },
                "discovery_connection": {
                    "addresses": discovery,
                },
            },
            "logging": logging(instance),
        })
    }

    fn role_section(&self, id: &ComponentId, cluster: &ClusterInfo, instance: &InstanceSpec) -> Value {
        let paths = |t: LocationType| -> Vec<Value> {
            instance
                .locations
                .iter()
                .filter(|l| l.location_type == t)
                .map(|l| json!({ "path": l.path }))
                .collect()
        };
        let first_path = |t: LocationType| -> Value {
            instance
                .locations
                .iter()
                .find(|l| l.location_type == t)
                .map(|l| Value::String(l.path.clone()))
                .unwrap_or(Value::Null)
        };

        match id.kind {
            ComponentKind::PrimaryMaster => json!({
                "primary_master": {
                    "cell_tag": cluster.spec.primary_masters.cell_tag,
                },
                "changelogs": { "path": first_path(LocationType::MasterChangelogs) },
                "snapshots": { "path": first_path(LocationType::MasterSnapshots) },
            }),
            ComponentKind::DataNode => json!({
                "data_node": {
                    "store_locations": paths(LocationType::ChunkStore),
                },
            }),
            ComponentKind::ExecNode => json!({
                "data_node": {
                    "cache_locations": paths(LocationType::ChunkCache),
                },
                "exec_agent": {
                    "slot_manager": { "locations": paths(LocationType::Slots) },
                },
            }),
            ComponentKind::HttpProxy | ComponentKind::RpcProxy => json!({
                "role": id.group.as_deref().unwrap_or(ytop_common::crd::DEFAULT_GROUP),
            }),
            ComponentKind::Ui => json!({
                "proxy": ComponentId::single(ComponentKind::HttpProxy)
                    .headless_service_name(),
            }),
            ComponentKind::Discovery | ComponentKind::Scheduler | ComponentKind::ControllerAgent => {
                json!({})
            }
        }
    }
}

impl ConfigProvider for JsonConfigProvider {
    fn generate(
        &self,
        id: &ComponentId,
        cluster: &ClusterInfo,
        overrides: Option<String>,
    ) -> Result<String> {
        let instance = cluster.instance_spec(id).ok_or_else(|| {
            Error::config(id.name(), "component is no longer declared in the spec")
        })?;

        let mut doc = self.base(id, cluster, instance);
        merge(&mut doc, self.role_section(id, cluster, instance));

        if let Some(raw) = overrides {
            let patch: Value = serde_json::from_str(&raw)
                .map_err(|e| Error::config(id.name(), format!("invalid overrides: {e}")))?;
            if !patch.is_object() {
                return Err(Error::config(id.name(), "overrides must be a JSON object"));
            }
            merge(&mut doc, patch);
        }

        serde_json::to_string_pretty(&doc).map_err(|e| Error::config(id.name(), e.to_string()))
    }

    fn needs_reload(&self, deployed: &str, desired: &str) -> bool {
        match (
            serde_json::from_str::<Value>(deployed),
            serde_json::from_str::<Value>(desired),
        ) {
            (Ok(a), Ok(b)) => a != b,
            _ => deployed != desired,
        }
    }
}

/// Deep-merge `patch` into `base`; objects merge key by key, anything else replaces
fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

fn cell_id(cell_tag: u16) -> String {
    format!("{:x}-ffffffff-{:x}0259-ffffffff", u32::from(cell_tag), cell_tag)
}

fn logging(instance: &InstanceSpec) -> Value {
    let mut rules = Vec::new();
    let mut writers = Map::new();
    for logger in &instance.loggers {
        let writer = match logger.writer_type {
            LogWriterType::File => json!({
                "type": "file",
                "file_name": format!("{}/{}.log", log_dir(instance), logger.name),
            }),
            LogWriterType::Stderr => json!({ "type": "stderr" }),
        };
        writers.insert(logger.name.clone(), writer);
        rules.push(json!({
            "min_level": format!("{:?}", logger.min_log_level).to_lowercase(),
            "writers": [logger.name],
        }));
    }
    json!({ "rules": rules, "writers": writers })
}

fn log_dir(instance: &InstanceSpec) -> &str {
    instance
        .locations
        .iter()
        .find(|l| l.location_type == LocationType::Logs)
        .map(|l| l.path.as_str())
        .unwrap_or("/var/log")
}
