//! Ytsaurus Custom Resource Definition
//!
//! A Ytsaurus resource describes one managed cluster: the image every server
//! runs, and an instance spec per role. Roles that may be split into groups
//! (proxies, data nodes, exec nodes) are lists of named groups.

use std::collections::BTreeSet;

use k8s_openapi::api::core::v1::LocalObjectReference;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClusterState, Condition, InstanceSpec, UpdateState};
use crate::Error;

/// Group name used when a group does not set one
pub const DEFAULT_GROUP: &str = "default";

/// Specification for a Ytsaurus cluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "cluster.ytsaurus.tech",
    version = "v1",
    kind = "Ytsaurus",
    plural = "ytsaurus",
    shortname = "yt",
    status = "YtsaurusStatus",
    namespaced,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Update","type":"string","jsonPath":".status.updateStatus.state"}"#,
    printcolumn = r#"{"name":"Message","type":"string","jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct YtsaurusSpec {
    /// Image used by every server role unless the role overrides it
    pub core_image: String,

    /// Image used by the UI when the UI spec does not override it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_image: Option<String>,

    /// Pull secrets attached to every pod
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// Secret holding the admin credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_credentials: Option<NamedRef>,

    /// ConfigMap whose entries are merged over generated server configs,
    /// keyed by config file name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_overrides: Option<NamedRef>,

    /// Allow updates that recreate every component, including the ones that
    /// cannot be updated on their own
    #[serde(default)]
    pub enable_full_update: bool,

    /// When false the operator leaves the cluster alone
    #[serde(default = "default_true")]
    pub is_managed: bool,

    /// Discovery servers
    pub discovery: InstanceSpec,

    /// Primary master cell
    pub primary_masters: MastersSpec,

    /// Schedulers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedulers: Option<InstanceSpec>,

    /// Controller agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller_agents: Option<InstanceSpec>,

    /// HTTP proxy groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub http_proxies: Vec<ProxiesSpec>,

    /// RPC proxy groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rpc_proxies: Vec<ProxiesSpec>,

    /// Data node groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_nodes: Vec<NodesSpec>,

    /// Exec node groups
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exec_nodes: Vec<NodesSpec>,

    /// Web UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<InstanceSpec>,
}

fn default_true() -> bool {
    true
}

fn default_group() -> String {
    DEFAULT_GROUP.to_string()
}

/// Reference to a namespaced object by name
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct NamedRef {
    /// Object name
    pub name: String,
}

/// Primary master cell
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MastersSpec {
    /// Cell tag of the primary master cell
    pub cell_tag: u16,

    /// Master instances
    #[serde(flatten)]
    pub instance: InstanceSpec,
}

/// One group of proxies sharing a role
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxiesSpec {
    /// Proxy role; also the group name
    #[serde(default = "default_group")]
    pub role: String,

    /// Proxy instances
    #[serde(flatten)]
    pub instance: InstanceSpec,
}

/// One group of data or exec nodes
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodesSpec {
    /// Group name
    #[serde(default = "default_group")]
    pub name: String,

    /// Node instances
    #[serde(flatten)]
    pub instance: InstanceSpec,
}

impl YtsaurusSpec {
    /// Validate the cluster specification
    ///
    /// Only checks what the reconciler relies on; schema-level checks are
    /// left to the API server.
    pub fn validate(&self, cluster: &str) -> Result<(), Error> {
        if self.core_image.trim().is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "spec.coreImage",
                "core image cannot be empty",
            ));
        }

        if self.primary_masters.instance.instance_count < 1 {
            return Err(Error::validation_for_field(
                cluster,
                "spec.primaryMasters.instanceCount",
                "at least one primary master is required",
            ));
        }

        let counts = [
            ("spec.discovery", Some(&self.discovery)),
            ("spec.schedulers", self.schedulers.as_ref()),
            ("spec.controllerAgents", self.controller_agents.as_ref()),
            ("spec.ui", self.ui.as_ref()),
        ];
        for (field, instance) in counts {
            if let Some(instance) = instance {
                if instance.instance_count < 0 {
                    return Err(Error::validation_for_field(
                        cluster,
                        format!("{field}.instanceCount"),
                        "instance count cannot be negative",
                    ));
                }
            }
        }

        validate_groups(
            cluster,
            "spec.httpProxies",
            self.http_proxies.iter().map(|p| (&p.role, &p.instance)),
        )?;
        validate_groups(
            cluster,
            "spec.rpcProxies",
            self.rpc_proxies.iter().map(|p| (&p.role, &p.instance)),
        )?;
        validate_groups(
            cluster,
            "spec.dataNodes",
            self.data_nodes.iter().map(|n| (&n.name, &n.instance)),
        )?;
        validate_groups(
            cluster,
            "spec.execNodes",
            self.exec_nodes.iter().map(|n| (&n.name, &n.instance)),
        )?;

        if self.ui.is_some() && self.http_proxies.is_empty() {
            return Err(Error::validation_for_field(
                cluster,
                "spec.ui",
                "the UI needs at least one HTTP proxy group",
            ));
        }

        Ok(())
    }
}

fn validate_groups<'a>(
    cluster: &str,
    field: &str,
    groups: impl Iterator<Item = (&'a String, &'a InstanceSpec)>,
) -> Result<(), Error> {
    let mut seen = BTreeSet::new();
    for (name, instance) in groups {
        if !is_dns_label(name) {
            return Err(Error::validation_for_field(
                cluster,
                field,
                format!("group name '{name}' must be a lowercase DNS label"),
            ));
        }
        if !seen.insert(name.as_str()) {
            return Err(Error::validation_for_field(
                cluster,
                field,
                format!("duplicate group name '{name}'"),
            ));
        }
        if instance.instance_count < 0 {
            return Err(Error::validation_for_field(
                cluster,
                field,
                format!("group '{name}' has a negative instance count"),
            ));
        }
    }
    Ok(())
}

fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 40
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Reported status of one component
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSummary {
    /// Component name
    pub name: String,
    /// Sync status (Ready, Pending, Blocked, ...)
    pub sync_status: String,
    /// Why the component is not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Progress of the current update wave
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    /// Stage of the update sub-protocol
    #[serde(default)]
    pub state: UpdateState,

    /// Components flagged for this wave
    ///
    /// Always serialized: status is merge-patched, so an omitted list would
    /// keep the previous wave's entries.
    #[serde(default)]
    pub components: Vec<String>,

    /// Per-component progress markers
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl UpdateStatus {
    /// True when the named component belongs to the current wave
    pub fn is_flagged(&self, component: &str) -> bool {
        self.components.iter().any(|c| c == component)
    }
}

/// Status for a Ytsaurus cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct YtsaurusStatus {
    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Macro lifecycle state
    #[serde(default)]
    pub state: ClusterState,

    /// Human-readable summary of the most specific blocking reason
    #[serde(default)]
    pub message: Option<String>,

    /// Conditions representing the cluster state
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Status of every component, in dependency order
    #[serde(default)]
    pub components: Vec<ComponentSummary>,

    /// Progress of the current update wave
    #[serde(default)]
    pub update_status: UpdateStatus,
}

impl Ytsaurus {
    /// Current cluster state, `Creating` when no status was written yet
    pub fn cluster_state(&self) -> ClusterState {
        self.status.as_ref().map(|s| s.state).unwrap_or_default()
    }
}
