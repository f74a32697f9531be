//! Custom Resource Definitions for ytop
//!
//! This module contains the Ytsaurus CRD and the types it is built from.

mod types;
mod ytsaurus;

pub use types::{
    is_condition_true, set_condition, ClusterState, Condition, ConditionStatus, InstanceSpec,
    LocationSpec, LocationType, LogLevel, LogWriterType, LoggerSpec, UpdateState,
    VolumeClaimTemplate,
};
pub use ytsaurus::{
    ComponentSummary, MastersSpec, NamedRef, NodesSpec, ProxiesSpec, UpdateStatus, Ytsaurus,
    YtsaurusSpec, YtsaurusStatus, DEFAULT_GROUP,
};
