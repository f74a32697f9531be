//! Reconciliation engine for ytop
//!
//! This crate turns a Ytsaurus spec into Kubernetes objects, one component at
//! a time:
//!
//! - **Accessor**: typed reads and server-side-apply writes of owned objects
//! - **Server**: the workload set, services and config artifact of a component
//! - **Component**: the per-component state machine and its dependency order
//! - **Update**: the drain / pods removal / pods creation wave protocol
//! - **Reconciler**: one tick over all components plus the cluster state machine

pub mod accessor;
pub mod cluster;
pub mod component;
pub mod config;
pub mod kind;
pub mod reconciler;
pub mod server;
pub mod status;
pub mod update;

#[cfg(test)]
pub(crate) mod testing;

pub use accessor::{KubeResourceAccessor, ResourceAccessor};
pub use cluster::{ClusterInfo, ClusterRecord};
pub use component::{build_components, Component};
pub use config::{ConfigProvider, JsonConfigProvider};
pub use kind::{ComponentId, ComponentKind};
pub use reconciler::{AggregateStatus, ClusterEvent, Reconciler, TickOutcome, ALL_COMPONENTS_READY};
pub use status::{ComponentStatus, SyncStatus};
pub use update::{NoopQuiescer, Quiescer};
