//! Update orchestration: the per-component sub-protocol of an update wave
//!
//! Flagged components move through drain, pods removal and pods creation in
//! lockstep; the stage is cluster-wide and lives in `status.updateStatus`.
//! Progress of each component is recorded as a condition so a restarted
//! operator resumes where the previous one stopped.

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use tracing::info;

use ytop_common::crd::{is_condition_true, UpdateState, UpdateStatus};
use ytop_common::Result;

use crate::cluster::ClusterInfo;
use crate::component::{Decision, Step};
use crate::kind::ComponentId;
use crate::server::ManagedServer;
use crate::status::{ComponentStatus, SyncStatus};

/// Condition recorded once a component was drained
pub fn drained_condition(component: &str) -> String {
    format!("{component}Drained")
}

/// Condition recorded once a component's pods were removed
pub fn pods_removed_condition(component: &str) -> String {
    format!("{component}PodsRemoved")
}

/// Quiesces drainable components before their pods are removed
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Quiescer: Send + Sync {
    /// Ask a component to stop taking work; `Ok(true)` once it is drained
    async fn drain(&self, cluster: &ClusterInfo, component: &ComponentId) -> Result<bool>;
}

/// Quiescer that reports every component as drained immediately
pub struct NoopQuiescer;

#[async_trait]
impl Quiescer for NoopQuiescer {
    async fn drain(&self, cluster: &ClusterInfo, component: &ComponentId) -> Result<bool> {
        info!(cluster = %cluster.name, component = %component, "no quiescer configured, treating as drained");
        Ok(true)
    }
}

/// Decision for a component while the cluster is in Reconfiguration
///
/// `None` means the normal rules apply.
pub(crate) fn update_decision(
    name: &str,
    server: &ManagedServer,
    update: &UpdateStatus,
) -> Option<Decision> {
    if !update.is_flagged(name) {
        return server.need_update().then(|| {
            Decision::status_only(ComponentStatus::waiting(
                SyncStatus::NeedRestart,
                "waiting for the next update wave",
            ))
        });
    }

    match update.state {
        UpdateState::WaitingForDrain => {
            let drained = is_condition_true(&update.conditions, &drained_condition(name));
            if server.id().kind.is_drainable() && !drained {
                Some(Decision {
                    status: ComponentStatus::waiting(SyncStatus::Updating, "draining"),
                    step: Step::Drain,
                })
            } else {
                Some(Decision::status_only(ComponentStatus::waiting(
                    SyncStatus::Updating,
                    "waiting for drain",
                )))
            }
        }
        UpdateState::WaitingForPodsRemoval => {
            let removed = is_condition_true(&update.conditions, &pods_removed_condition(name));
            if removed || server.are_pods_removed() {
                Some(Decision::status_only(ComponentStatus::waiting(
                    SyncStatus::Updating,
                    "pods removed",
                )))
            } else {
                Some(Decision {
                    status: ComponentStatus::waiting(SyncStatus::Updating, "removing pods"),
                    step: Step::RemovePods,
                })
            }
        }
        UpdateState::WaitingForPodsCreation | UpdateState::None => None,
    }
}
