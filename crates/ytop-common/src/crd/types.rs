//! Shared types used by the Ytsaurus CRD

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, PersistentVolumeClaimSpec, ResourceRequirements, Toleration, Volume, VolumeMount,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Macro lifecycle of a Ytsaurus cluster
///
/// Transitions within one update cycle are monotone:
/// `Running -> Reconfiguration -> Updated -> Running`.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ClusterState {
    /// Components are being created for the first time
    #[default]
    Creating,
    /// All components converged, no update in flight
    Running,
    /// A coordinated rolling update is in progress
    #[serde(alias = "Updating")]
    Reconfiguration,
    /// The update wave finished; the next tick returns to Running
    Updated,
    /// The spec could not be realized at creation time
    CreationFailed,
}

impl ClusterState {
    /// States in which a new update wave may be started
    pub fn is_ready_to_update(self) -> bool {
        matches!(self, Self::Running | Self::Updated)
    }
}

impl std::fmt::Display for ClusterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Reconfiguration => write!(f, "Reconfiguration"),
            Self::Updated => write!(f, "Updated"),
            Self::CreationFailed => write!(f, "CreationFailed"),
        }
    }
}

/// Stage of the update sub-protocol while the cluster is in Reconfiguration
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum UpdateState {
    /// No update in flight
    #[default]
    None,
    /// Drainable flagged components are being quiesced
    WaitingForDrain,
    /// Flagged workload sets are being scaled to zero
    WaitingForPodsRemoval,
    /// Flagged workload sets are being recreated from the current spec
    WaitingForPodsCreation,
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::WaitingForDrain => write!(f, "WaitingForDrain"),
            Self::WaitingForPodsRemoval => write!(f, "WaitingForPodsRemoval"),
            Self::WaitingForPodsCreation => write!(f, "WaitingForPodsCreation"),
        }
    }
}

/// Condition status following Kubernetes conventions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

/// Kubernetes-style condition for status reporting
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Condition {
    /// Type of condition (e.g., AllComponentsReady, yt-data-node-ssdPodsRemoved)
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,

    /// Machine-readable reason for the condition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    #[serde(rename = "lastTransitionTime")]
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    /// Create a new condition with the current timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
        }
    }

    /// Same type, status, reason and message; the timestamp is ignored
    pub fn same_as(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Insert or replace a condition, keeping the old timestamp when nothing changed
///
/// Returns true when the condition list was modified.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) -> bool {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        if existing.same_as(&condition) {
            return false;
        }
        *existing = condition;
        return true;
    }
    conditions.push(condition);
    true
}

/// True when a condition of the given type exists with status True
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
}

/// Kind of a storage location prepared before the server starts
#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum LocationType {
    /// Chunk store of a data node
    ChunkStore,
    /// Chunk cache of an exec node
    ChunkCache,
    /// Sandbox directories for jobs
    Slots,
    /// Master changelogs
    MasterChangelogs,
    /// Master snapshots
    MasterSnapshots,
    /// Server logs
    Logs,
}

/// Storage location a server expects to exist at startup
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocationSpec {
    /// What the location is used for
    pub location_type: LocationType,
    /// Absolute path inside the container
    pub path: String,
}

/// Minimum log level of a logger
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Very verbose
    Trace,
    /// Debug output
    Debug,
    /// Normal operation
    #[default]
    Info,
    /// Errors only
    Error,
}

/// Where a logger writes
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogWriterType {
    /// A file under the logs location
    #[default]
    File,
    /// Container stderr
    Stderr,
}

/// Logger configuration passed through to the server config
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoggerSpec {
    /// Logger name, used for the file name
    pub name: String,
    /// Minimum level written
    #[serde(default)]
    pub min_log_level: LogLevel,
    /// Output destination
    #[serde(default)]
    pub writer_type: LogWriterType,
}

/// Volume claim template attached to a workload set
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    /// Claim name, referenced by volume mounts
    pub name: String,
    /// Claim spec
    pub spec: PersistentVolumeClaimSpec,
}

/// Per-role instance specification
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    /// Number of replicas
    #[serde(default = "default_instance_count")]
    pub instance_count: i32,

    /// Image override; the cluster core image is used when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,

    /// Resource requests and limits of the server container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Extra pod volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,

    /// Volume mounts of the server and init containers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,

    /// Volume claim templates of the workload set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,

    /// Storage locations prepared before the server starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<LocationSpec>,

    /// Pod affinity rules
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Node selector
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Pod tolerations
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Loggers written by the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub loggers: Vec<LoggerSpec>,
}

fn default_instance_count() -> i32 {
    1
}

impl InstanceSpec {
    /// Instance spec with the given replica count and defaults elsewhere
    pub fn with_count(instance_count: i32) -> Self {
        Self {
            instance_count,
            ..Default::default()
        }
    }
}
