//! Cluster Reconciler: one Fetch → Status → Sync pass over all components
//!
//! The reconciler takes the persisted [`ClusterRecord`] and returns the next
//! one; it holds no state across ticks. Every tick rebuilds the components
//! from the spec, fetches them concurrently, evaluates them in dependency
//! order and, unless this is a dry run, executes the chosen steps and drives
//! the cluster state machine.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::try_join_all;
use tracing::{debug, info, instrument, warn};

use ytop_common::crd::{
    is_condition_true, set_condition, ClusterState, Condition, ConditionStatus, UpdateState,
    UpdateStatus,
};
use ytop_common::Result;

use crate::accessor::ResourceAccessor;
use crate::cluster::{ClusterInfo, ClusterRecord};
use crate::component::{build_components, Component, Decision, EvalContext, Step};
use crate::config::ConfigProvider;
use crate::status::{ComponentStatus, SyncStatus};
use crate::update::{drained_condition, pods_removed_condition, Quiescer};

/// Type of the aggregate readiness condition
pub const ALL_COMPONENTS_READY: &str = "AllComponentsReady";

/// A cluster state transition worth announcing
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterEvent {
    /// Every component became Ready after creation
    ClusterRunning,
    /// The spec could not be realized
    CreationFailed(String),
    /// An update wave started for these components
    UpdateStarted(Vec<String>),
    /// Every flagged component is Ready again
    UpdateFinished,
    /// These components need a full update, which is disabled
    FullUpdateBlocked(Vec<String>),
}

/// Folded status of all components
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateStatus {
    /// True iff every component is Ready
    pub ready: bool,
    /// The first non-ready component in dependency order and its reason
    pub message: String,
}

impl AggregateStatus {
    fn fold(statuses: &[(String, ComponentStatus)]) -> Self {
        match statuses.iter().find(|(_, s)| !s.is_ready()) {
            None => Self {
                ready: true,
                message: "All components are ready".to_string(),
            },
            Some((name, status)) => Self {
                ready: false,
                message: format!("{name}: {status}"),
            },
        }
    }

    fn not_ready(message: impl Into<String>) -> Self {
        Self {
            ready: false,
            message: message.into(),
        }
    }

    /// The `AllComponentsReady` condition
    pub fn condition(&self) -> Condition {
        let (status, reason) = if self.ready {
            (ConditionStatus::True, "AllReady")
        } else {
            (ConditionStatus::False, "NotReady")
        };
        Condition::new(ALL_COMPONENTS_READY, status, reason, self.message.clone())
    }
}

/// Result of one tick
#[derive(Clone, Debug)]
pub struct TickOutcome {
    /// Next lifecycle record to persist
    pub record: ClusterRecord,
    /// Status of every component, in dependency order
    pub components: Vec<(String, ComponentStatus)>,
    /// Folded status
    pub aggregate: AggregateStatus,
    /// Transitions made by this tick
    pub events: Vec<ClusterEvent>,
}

/// Drives one cluster toward its spec
pub struct Reconciler {
    accessor: Arc<dyn ResourceAccessor>,
    config: Arc<dyn ConfigProvider>,
    quiescer: Arc<dyn Quiescer>,
    dry_run: bool,
}

impl Reconciler {
    /// Create a reconciler; a dry-run reconciler only computes statuses
    pub fn new(
        accessor: Arc<dyn ResourceAccessor>,
        config: Arc<dyn ConfigProvider>,
        quiescer: Arc<dyn Quiescer>,
        dry_run: bool,
    ) -> Self {
        Self {
            accessor,
            config,
            quiescer,
            dry_run,
        }
    }

    /// Run one reconciliation tick
    ///
    /// Fetch and sync errors are returned as-is and leave the record
    /// unchanged; the next tick retries from scratch.
    #[instrument(skip_all, fields(cluster = %cluster.name, state = %record.state, dry_run = self.dry_run))]
    pub async fn tick(&self, cluster: Arc<ClusterInfo>, record: ClusterRecord) -> Result<TickOutcome> {
        let mut record = record;
        let mut events = Vec::new();

        if let Err(e) = cluster.spec.validate(&cluster.name) {
            if !matches!(
                record.state,
                ClusterState::Creating | ClusterState::CreationFailed
            ) {
                return Err(e);
            }
            let message = e.to_string();
            if !self.dry_run && record.state == ClusterState::Creating {
                warn!(error = %message, "cluster spec cannot be realized");
                record.state = ClusterState::CreationFailed;
                events.push(ClusterEvent::CreationFailed(message.clone()));
            }
            return Ok(TickOutcome {
                record,
                components: Vec::new(),
                aggregate: AggregateStatus::not_ready(message),
                events,
            });
        }

        if record.state == ClusterState::CreationFailed && !self.dry_run {
            info!("cluster spec is valid again, retrying creation");
            record.state = ClusterState::Creating;
        }

        let mut components = build_components(
            cluster.clone(),
            self.accessor.clone(),
            self.config.clone(),
            self.quiescer.clone(),
        )?;
        try_join_all(components.iter_mut().map(|c| c.fetch())).await?;

        let decisions = evaluate(&components, &record, self.dry_run);
        let statuses: Vec<(String, ComponentStatus)> = components
            .iter()
            .zip(&decisions)
            .map(|(c, d)| (c.name().to_string(), d.status.clone()))
            .collect();
        for (name, status) in &statuses {
            debug!(component = %name, status = %status, "evaluated component");
        }
        let mut aggregate = AggregateStatus::fold(&statuses);

        if self.dry_run {
            return Ok(TickOutcome {
                record,
                components: statuses,
                aggregate,
                events,
            });
        }

        match record.state {
            ClusterState::Creating => {
                execute_all(&mut components, &decisions).await?;
                if aggregate.ready {
                    info!("all components are ready, cluster is running");
                    record.state = ClusterState::Running;
                    events.push(ClusterEvent::ClusterRunning);
                }
            }
            ClusterState::Updated => {
                info!("update wave complete, returning to running");
                record = ClusterRecord::in_state(ClusterState::Running);
                execute_all(&mut components, &decisions).await?;
            }
            ClusterState::Running => {
                let need_full = names_with(&statuses, SyncStatus::NeedFullUpdate);
                let need_local = names_with(&statuses, SyncStatus::NeedLocalUpdate);

                let flagged = if !need_full.is_empty() && cluster.spec.enable_full_update {
                    statuses.iter().map(|(name, _)| name.clone()).collect()
                } else {
                    need_local
                };

                if !need_full.is_empty() && !cluster.spec.enable_full_update {
                    warn!(components = ?need_full, "full update required but enableFullUpdate is off");
                    aggregate = AggregateStatus::not_ready(format!(
                        "full update required for {} but enableFullUpdate is off",
                        need_full.join(", ")
                    ));
                    events.push(ClusterEvent::FullUpdateBlocked(need_full));
                }

                if flagged.is_empty() {
                    execute_all(&mut components, &decisions).await?;
                } else {
                    let drain = components
                        .iter()
                        .any(|c| c.kind().is_drainable() && flagged.iter().any(|f| f == c.name()));
                    let stage = if drain {
                        UpdateState::WaitingForDrain
                    } else {
                        UpdateState::WaitingForPodsRemoval
                    };
                    info!(components = ?flagged, stage = %stage, "starting update wave");
                    record.state = ClusterState::Reconfiguration;
                    record.update_status = UpdateStatus {
                        state: stage,
                        components: flagged.clone(),
                        conditions: Vec::new(),
                    };
                    events.push(ClusterEvent::UpdateStarted(flagged));
                }
            }
            ClusterState::Reconfiguration => {
                let conditions = execute_all(&mut components, &decisions).await?;
                for condition in conditions {
                    set_condition(&mut record.update_status.conditions, condition);
                }
                if advance_update(&components, &statuses, &mut record) {
                    events.push(ClusterEvent::UpdateFinished);
                }
            }
            ClusterState::CreationFailed => {}
        }

        Ok(TickOutcome {
            record,
            components: statuses,
            aggregate,
            events,
        })
    }
}

/// Decide every component in order; each sees the statuses decided before it
fn evaluate(components: &[Component], record: &ClusterRecord, dry_run: bool) -> Vec<Decision> {
    let mut statuses = BTreeMap::new();
    let mut decisions = Vec::with_capacity(components.len());
    for component in components {
        let decision = component.decide(&EvalContext {
            state: record.state,
            update: &record.update_status,
            statuses: &statuses,
            dry_run,
        });
        statuses.insert(component.name().to_string(), decision.status.clone());
        decisions.push(decision);
    }
    decisions
}

/// Execute every step, in dependency order; returns the progress conditions
async fn execute_all(components: &mut [Component], decisions: &[Decision]) -> Result<Vec<Condition>> {
    let mut conditions = Vec::new();
    for (component, decision) in components.iter_mut().zip(decisions) {
        if decision.step == Step::None {
            continue;
        }
        debug!(component = %component.name(), step = decision.step.as_str(), "executing step");
        if let Some(condition) = component.execute(decision.step, false).await? {
            conditions.push(condition);
        }
    }
    Ok(conditions)
}

fn names_with(statuses: &[(String, ComponentStatus)], status: SyncStatus) -> Vec<String> {
    statuses
        .iter()
        .filter(|(_, s)| s.sync_status == status)
        .map(|(name, _)| name.clone())
        .collect()
}

/// Move the update wave forward; returns true when the wave finished
fn advance_update(
    components: &[Component],
    statuses: &[(String, ComponentStatus)],
    record: &mut ClusterRecord,
) -> bool {
    let update = &mut record.update_status;
    let flagged: Vec<&Component> = components
        .iter()
        .filter(|c| update.is_flagged(c.name()))
        .collect();

    if update.state == UpdateState::WaitingForPodsRemoval {
        for component in &flagged {
            if component.server().are_pods_removed() {
                set_condition(
                    &mut update.conditions,
                    Condition::new(
                        pods_removed_condition(component.name()),
                        ConditionStatus::True,
                        "PodsRemoved",
                        format!("{} has no pods left", component.name()),
                    ),
                );
            }
        }
    }

    let conditions = &update.conditions;
    match update.state {
        UpdateState::WaitingForDrain => {
            let drained = flagged
                .iter()
                .filter(|c| c.kind().is_drainable())
                .all(|c| is_condition_true(conditions, &drained_condition(c.name())));
            if drained {
                info!("flagged components drained, removing pods");
                update.state = UpdateState::WaitingForPodsRemoval;
            }
            false
        }
        UpdateState::WaitingForPodsRemoval => {
            let removed = flagged
                .iter()
                .all(|c| is_condition_true(conditions, &pods_removed_condition(c.name())));
            if removed {
                info!("flagged pods removed, recreating");
                update.state = UpdateState::WaitingForPodsCreation;
            }
            false
        }
        UpdateState::WaitingForPodsCreation | UpdateState::None => {
            let ready = flagged.iter().all(|c| {
                statuses
                    .iter()
                    .any(|(name, s)| name == c.name() && s.is_ready())
            });
            if ready {
                info!("every flagged component is ready, update finished");
                record.state = ClusterState::Updated;
                record.update_status.state = UpdateState::None;
            }
            ready
        }
    }
}
