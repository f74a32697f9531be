//! Component: the unit of reconciliation
//!
//! Evaluation is split in two. [`Component::decide`] is a pure function of the
//! observed state and the statuses computed earlier in the tick; it returns
//! the status plus the [`Step`] a live run would take. [`Component::execute`]
//! performs that step. `status()` is `decide()` without the step, so dry runs
//! can never write.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ytop_common::crd::{ClusterState, Condition, ConditionStatus, UpdateStatus};
use ytop_common::{metrics, Error, Result};

use crate::accessor::ResourceAccessor;
use crate::cluster::ClusterInfo;
use crate::config::ConfigProvider;
use crate::kind::{ComponentId, ComponentKind};
use crate::server::ManagedServer;
use crate::status::{ComponentStatus, SyncStatus};
use crate::update::{drained_condition, update_decision, Quiescer};

/// Action a live run takes for a component
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    /// Nothing to write
    None,
    /// Write every owned object
    Sync,
    /// Scale the workload set to zero
    RemovePods,
    /// Quiesce the component
    Drain,
}

impl Step {
    /// Metrics label
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Sync => "sync",
            Self::RemovePods => "remove_pods",
            Self::Drain => "drain",
        }
    }
}

/// Result of evaluating a component
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Status to report
    pub status: ComponentStatus,
    /// Step a live run takes
    pub step: Step,
}

impl Decision {
    /// Decision that writes nothing
    pub fn status_only(status: ComponentStatus) -> Self {
        Self {
            status,
            step: Step::None,
        }
    }
}

/// Everything a component's decision reads besides its own observed state
#[derive(Clone, Copy, Debug)]
pub struct EvalContext<'a> {
    /// Cluster state at the start of the tick
    pub state: ClusterState,
    /// Current update wave
    pub update: &'a UpdateStatus,
    /// Statuses computed earlier in this tick, keyed by component name
    pub statuses: &'a BTreeMap<String, ComponentStatus>,
    /// Whether executing steps is allowed
    pub dry_run: bool,
}

/// One reconciled role of the managed cluster
pub struct Component {
    name: String,
    server: ManagedServer,
    dependencies: Vec<String>,
    quiescer: Arc<dyn Quiescer>,
    cluster: Arc<ClusterInfo>,
}

impl Component {
    /// Wrap a managed server
    pub fn new(
        server: ManagedServer,
        dependencies: Vec<String>,
        quiescer: Arc<dyn Quiescer>,
        cluster: Arc<ClusterInfo>,
    ) -> Self {
        Self {
            name: server.id().name(),
            server,
            dependencies,
            quiescer,
            cluster,
        }
    }

    /// Stable component name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role
    pub fn kind(&self) -> ComponentKind {
        self.server.id().kind
    }

    /// Names of the components this one waits for
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Whether this component can be recreated on its own
    pub fn is_updatable(&self) -> bool {
        self.kind().is_updatable()
    }

    /// The managed server
    pub fn server(&self) -> &ManagedServer {
        &self.server
    }

    /// Read observed state
    pub async fn fetch(&mut self) -> Result<()> {
        self.server.fetch().await
    }

    /// Evaluate the component; first matching rule wins
    ///
    /// Rule 1 runs before the dependency check, so a component can become an
    /// update candidate while one of its dependencies is not running.
    pub fn decide(&self, ctx: &EvalContext<'_>) -> Decision {
        let server = &self.server;

        if ctx.state.is_ready_to_update() && server.need_update() {
            let status = if self.is_updatable() {
                SyncStatus::NeedLocalUpdate
            } else {
                SyncStatus::NeedFullUpdate
            };
            return Decision::status_only(ComponentStatus::simple(status));
        }

        if ctx.state == ClusterState::Reconfiguration {
            if let Some(decision) = update_decision(&self.name, server, ctx.update) {
                return decision;
            }
        }

        for dependency in &self.dependencies {
            let running = ctx
                .statuses
                .get(dependency)
                .is_some_and(|s| s.sync_status.is_running());
            if !running {
                return Decision::status_only(ComponentStatus::waiting(
                    SyncStatus::Blocked,
                    dependency.clone(),
                ));
            }
        }

        if let Some(err) = server.config_error() {
            return Decision::status_only(ComponentStatus::waiting(
                SyncStatus::Blocked,
                format!("config: {err}"),
            ));
        }

        if server.need_sync() {
            return Decision {
                status: ComponentStatus::waiting(SyncStatus::Pending, "components"),
                step: Step::Sync,
            };
        }

        if !server.are_pods_ready() {
            return Decision::status_only(ComponentStatus::waiting(SyncStatus::Blocked, "pods"));
        }

        Decision::status_only(ComponentStatus::ready())
    }

    /// Dry evaluation
    pub fn status(&self, ctx: &EvalContext<'_>) -> ComponentStatus {
        self.decide(ctx).status
    }

    /// Live evaluation: decide, then execute the chosen step
    pub async fn sync(&mut self, ctx: &EvalContext<'_>) -> Result<Option<Condition>> {
        let decision = self.decide(ctx);
        self.execute(decision.step, ctx.dry_run).await
    }

    /// Perform a step; returns a progress condition to record, if any
    pub async fn execute(&mut self, step: Step, dry_run: bool) -> Result<Option<Condition>> {
        if dry_run && step != Step::None {
            return Err(Error::invariant(
                "executor",
                format!("dry run of {} attempted {}", self.name, step.as_str()),
            ));
        }

        let condition = match step {
            Step::None => return Ok(None),
            Step::Sync => {
                self.server.sync().await?;
                None
            }
            Step::RemovePods => {
                self.server.remove_pods().await?;
                None
            }
            Step::Drain => {
                let drained = self
                    .quiescer
                    .drain(&self.cluster, self.server.id())
                    .await?;
                drained.then(|| {
                    Condition::new(
                        drained_condition(&self.name),
                        ConditionStatus::True,
                        "Drained",
                        format!("{} was drained", self.name),
                    )
                })
            }
        };
        metrics::record_component_action(&self.name, step.as_str());
        Ok(condition)
    }
}

/// Build every component the spec declares, in dependency order
pub fn build_components(
    cluster: Arc<ClusterInfo>,
    accessor: Arc<dyn ResourceAccessor>,
    config: Arc<dyn ConfigProvider>,
    quiescer: Arc<dyn Quiescer>,
) -> Result<Vec<Component>> {
    let spec = &cluster.spec;
    let master = ComponentId::single(ComponentKind::PrimaryMaster).name();

    let mut plan: Vec<(ComponentId, Vec<String>)> = vec![
        (ComponentId::single(ComponentKind::Discovery), Vec::new()),
        (ComponentId::single(ComponentKind::PrimaryMaster), Vec::new()),
    ];

    let on_master = || vec![master.clone()];
    for group in &spec.data_nodes {
        plan.push((ComponentId::grouped(ComponentKind::DataNode, &group.name), on_master()));
    }
    let exec_nodes: Vec<ComponentId> = spec
        .exec_nodes
        .iter()
        .map(|g| ComponentId::grouped(ComponentKind::ExecNode, &g.name))
        .collect();
    for id in &exec_nodes {
        plan.push((id.clone(), on_master()));
    }
    let http_proxies: Vec<ComponentId> = spec
        .http_proxies
        .iter()
        .map(|g| ComponentId::grouped(ComponentKind::HttpProxy, &g.role))
        .collect();
    for id in &http_proxies {
        plan.push((id.clone(), on_master()));
    }
    for group in &spec.rpc_proxies {
        plan.push((ComponentId::grouped(ComponentKind::RpcProxy, &group.role), on_master()));
    }
    if spec.controller_agents.is_some() {
        plan.push((ComponentId::single(ComponentKind::ControllerAgent), on_master()));
    }
    if spec.schedulers.is_some() {
        let mut deps = on_master();
        deps.extend(exec_nodes.iter().map(ComponentId::name));
        plan.push((ComponentId::single(ComponentKind::Scheduler), deps));
    }
    if spec.ui.is_some() {
        let deps = http_proxies.iter().map(ComponentId::name).collect();
        plan.push((ComponentId::single(ComponentKind::Ui), deps));
    }

    let components = plan
        .into_iter()
        .map(|(id, deps)| {
            let server =
                ManagedServer::new(id, cluster.clone(), accessor.clone(), config.clone())?;
            Ok(Component::new(server, deps, quiescer.clone(), cluster.clone()))
        })
        .collect::<Result<Vec<_>>>()?;

    validate_order(&components)?;
    Ok(components)
}

/// Every dependency must name a component that comes earlier
pub fn validate_order(components: &[Component]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for component in components {
        for dependency in component.dependencies() {
            if !seen.contains(dependency.as_str()) {
                return Err(Error::invariant(
                    "ordering",
                    format!(
                        "{} depends on {dependency}, which is not evaluated before it",
                        component.name()
                    ),
                ));
            }
        }
        if !seen.insert(component.name()) {
            return Err(Error::invariant(
                "ordering",
                format!("duplicate component {}", component.name()),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JsonConfigProvider;
    use crate::testing::{minimal_spec, sample_spec, FakeAccessor, NAMESPACE};
    use crate::update::{pods_removed_condition, MockQuiescer, NoopQuiescer};
    use ytop_common::crd::{UpdateState, YtsaurusSpec};

    struct Fixture {
        accessor: Arc<FakeAccessor>,
        components: Vec<Component>,
    }

    fn fixture(spec: YtsaurusSpec) -> Fixture {
        let accessor = Arc::new(FakeAccessor::default());
        let components = build(spec, accessor.clone());
        Fixture {
            accessor,
            components,
        }
    }

    fn build(spec: YtsaurusSpec, accessor: Arc<FakeAccessor>) -> Vec<Component> {
        build_components(
            Arc::new(ClusterInfo::new("yt", NAMESPACE, spec)),
            accessor,
            Arc::new(JsonConfigProvider),
            Arc::new(NoopQuiescer),
        )
        .unwrap()
    }

    fn find<'a>(components: &'a mut [Component], name: &str) -> &'a mut Component {
        components.iter_mut().find(|c| c.name() == name).unwrap()
    }

    fn ctx<'a>(
        state: ClusterState,
        update: &'a UpdateStatus,
        statuses: &'a BTreeMap<String, ComponentStatus>,
    ) -> EvalContext<'a> {
        EvalContext {
            state,
            update,
            statuses,
            dry_run: false,
        }
    }

    fn ready(names: &[&str]) -> BTreeMap<String, ComponentStatus> {
        names
            .iter()
            .map(|n| (n.to_string(), ComponentStatus::ready()))
            .collect()
    }

    #[test]
    fn components_are_built_in_dependency_order() {
        let f = fixture(sample_spec());
        let names: Vec<&str> = f.components.iter().map(Component::name).collect();
        assert_eq!(
            names,
            vec![
                "yt-discovery",
                "yt-master",
                "yt-data-node-ssd",
                "yt-exec-node",
                "yt-http-proxy",
                "yt-controller-agent",
                "yt-scheduler",
            ]
        );
        let scheduler = f.components.iter().find(|c| c.name() == "yt-scheduler").unwrap();
        assert_eq!(scheduler.dependencies(), ["yt-master", "yt-exec-node"]);
    }

    #[test]
    fn ui_depends_on_http_proxies() {
        let mut spec = sample_spec();
        spec.ui = Some(ytop_common::crd::InstanceSpec::with_count(1));
        let f = fixture(spec);
        let ui = f.components.last().unwrap();
        assert_eq!(ui.name(), "yt-ui");
        assert_eq!(ui.dependencies(), ["yt-http-proxy"]);
    }

    #[test]
    fn out_of_order_dependencies_are_an_invariant_violation() {
        let mut components = fixture(minimal_spec()).components;
        components.reverse();
        components[0].dependencies = vec!["yt-discovery".to_string()];
        let err = validate_order(&components).unwrap_err();
        assert!(err.is_invariant_violation());
    }

    /// Scenario A: a component with no dependencies and no objects converges
    /// through Pending and Blocked("pods") to Ready
    #[tokio::test]
    async fn story_fresh_component_converges() {
        let mut f = fixture(minimal_spec());
        let update = UpdateStatus::default();
        let statuses = BTreeMap::new();
        let ctx = ctx(ClusterState::Creating, &update, &statuses);
        let ds = find(&mut f.components, "yt-discovery");

        ds.fetch().await.unwrap();
        assert_eq!(
            ds.status(&ctx),
            ComponentStatus::waiting(SyncStatus::Pending, "components")
        );
        ds.sync(&ctx).await.unwrap();
        assert!(f.accessor.stateful_set("ds").is_some());

        ds.fetch().await.unwrap();
        assert_eq!(
            ds.status(&ctx),
            ComponentStatus::waiting(SyncStatus::Blocked, "pods")
        );

        f.accessor.settle();
        ds.fetch().await.unwrap();
        assert_eq!(ds.status(&ctx), ComponentStatus::ready());
    }

    /// Scenario B: a blocked dependency blocks its dependents without a sync
    #[tokio::test]
    async fn story_blocked_dependency_blocks_dependent() {
        let mut f = fixture(sample_spec());
        let update = UpdateStatus::default();
        let statuses = BTreeMap::from([(
            "yt-master".to_string(),
            ComponentStatus::waiting(SyncStatus::Blocked, "pods"),
        )]);
        let ctx = ctx(ClusterState::Creating, &update, &statuses);
        let ca = find(&mut f.components, "yt-controller-agent");
        ca.fetch().await.unwrap();

        let decision = ca.decide(&ctx);
        assert_eq!(
            decision.status,
            ComponentStatus::waiting(SyncStatus::Blocked, "yt-master")
        );
        assert_eq!(decision.step, Step::None);

        ca.sync(&ctx).await.unwrap();
        assert!(f.accessor.written_refs().is_empty());
    }

    #[tokio::test]
    async fn missing_dependency_status_blocks() {
        let mut f = fixture(sample_spec());
        let update = UpdateStatus::default();
        let statuses = BTreeMap::new();
        let ctx = ctx(ClusterState::Creating, &update, &statuses);
        let sch = find(&mut f.components, "yt-scheduler");
        sch.fetch().await.unwrap();
        assert_eq!(
            sch.status(&ctx),
            ComponentStatus::waiting(SyncStatus::Blocked, "yt-master")
        );
    }

    #[tokio::test]
    async fn stale_but_running_dependency_does_not_block() {
        let mut f = fixture(sample_spec());
        let update = UpdateStatus::default();
        let statuses = BTreeMap::from([(
            "yt-master".to_string(),
            ComponentStatus::simple(SyncStatus::NeedLocalUpdate),
        )]);
        let ctx = ctx(ClusterState::Running, &update, &statuses);
        let ca = find(&mut f.components, "yt-controller-agent");
        ca.fetch().await.unwrap();
        assert_eq!(ca.status(&ctx).sync_status, SyncStatus::Pending);
    }

    async fn converge(f: &mut Fixture) {
        let update = UpdateStatus::default();
        let all: Vec<String> = f.components.iter().map(|c| c.name().to_string()).collect();
        let names: Vec<&str> = all.iter().map(String::as_str).collect();
        let statuses = ready(&names);
        let ctx = ctx(ClusterState::Creating, &update, &statuses);
        for c in f.components.iter_mut() {
            c.fetch().await.unwrap();
            c.sync(&ctx).await.unwrap();
        }
        f.accessor.settle();
        for c in f.components.iter_mut() {
            c.fetch().await.unwrap();
            assert!(c.status(&ctx).is_ready(), "{} not ready", c.name());
        }
    }

    /// The update check runs before the dependency check: a drifted
    /// component is an update candidate even while its dependency is down
    #[tokio::test]
    async fn story_update_candidate_even_when_dependency_is_blocked() {
        let mut f = fixture(sample_spec());
        converge(&mut f).await;

        let mut spec = sample_spec();
        spec.controller_agents = Some(ytop_common::crd::InstanceSpec {
            image: Some("ytsaurus/ytsaurus:24.1".to_string()),
            ..ytop_common::crd::InstanceSpec::with_count(1)
        });
        let mut components = build(spec, f.accessor.clone());
        let update = UpdateStatus::default();
        let statuses = BTreeMap::from([(
            "yt-master".to_string(),
            ComponentStatus::waiting(SyncStatus::Blocked, "pods"),
        )]);

        let ca = find(&mut components, "yt-controller-agent");
        ca.fetch().await.unwrap();
        assert_eq!(
            ca.status(&ctx(ClusterState::Running, &update, &statuses)),
            ComponentStatus::simple(SyncStatus::NeedLocalUpdate)
        );
        // Outside the ready-to-update states the dependency check wins
        assert_eq!(
            ca.status(&ctx(ClusterState::Creating, &update, &statuses)),
            ComponentStatus::waiting(SyncStatus::Blocked, "yt-master")
        );
    }

    #[tokio::test]
    async fn drifted_master_needs_full_update() {
        let mut f = fixture(minimal_spec());
        converge(&mut f).await;

        let mut spec = minimal_spec();
        spec.core_image = "ytsaurus/ytsaurus:24.1".to_string();
        let mut components = build(spec, f.accessor.clone());
        let update = UpdateStatus::default();
        let statuses = BTreeMap::new();
        let ms = find(&mut components, "yt-master");
        ms.fetch().await.unwrap();
        assert_eq!(
            ms.status(&ctx(ClusterState::Running, &update, &statuses)).sync_status,
            SyncStatus::NeedFullUpdate
        );
    }

    #[tokio::test]
    async fn status_is_repeatable() {
        let mut f = fixture(sample_spec());
        converge(&mut f).await;
        let update = UpdateStatus::default();
        let statuses = ready(&["yt-master"]);
        let ctx = ctx(ClusterState::Running, &update, &statuses);
        let dn = find(&mut f.components, "yt-data-node-ssd");
        let first = dn.decide(&ctx);
        assert_eq!(dn.decide(&ctx), first);
        assert_eq!(first.status, ComponentStatus::ready());
    }

    #[tokio::test]
    async fn dry_run_execution_is_an_invariant_violation() {
        let mut f = fixture(minimal_spec());
        let update = UpdateStatus::default();
        let statuses = BTreeMap::new();
        let ctx = EvalContext {
            dry_run: true,
            ..ctx(ClusterState::Creating, &update, &statuses)
        };
        let ds = find(&mut f.components, "yt-discovery");
        ds.fetch().await.unwrap();

        let err = ds.sync(&ctx).await.unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(f.accessor.written_refs().is_empty());
    }

    #[tokio::test]
    async fn config_error_blocks_without_sync() {
        let mut spec = minimal_spec();
        spec.config_overrides = Some(ytop_common::crd::NamedRef {
            name: "missing".to_string(),
        });
        let mut f = fixture(spec);
        let update = UpdateStatus::default();
        let statuses = BTreeMap::new();
        let ctx = ctx(ClusterState::Creating, &update, &statuses);
        let ds = find(&mut f.components, "yt-discovery");
        ds.fetch().await.unwrap();

        let decision = ds.decide(&ctx);
        assert_eq!(decision.status.sync_status, SyncStatus::Blocked);
        assert!(decision.status.reason.unwrap().starts_with("config: "));
        assert_eq!(decision.step, Step::None);
    }

    #[tokio::test]
    async fn flagged_drainable_component_is_drained_first() {
        let mut f = fixture(sample_spec());
        converge(&mut f).await;
        let update = UpdateStatus {
            state: UpdateState::WaitingForDrain,
            components: vec!["yt-data-node-ssd".to_string(), "yt-scheduler".to_string()],
            conditions: Vec::new(),
        };
        let statuses = ready(&["yt-master", "yt-exec-node"]);
        let ctx = ctx(ClusterState::Reconfiguration, &update, &statuses);

        let dn = find(&mut f.components, "yt-data-node-ssd");
        assert_eq!(dn.decide(&ctx).step, Step::Drain);
        let condition = dn.sync(&ctx).await.unwrap().unwrap();
        assert_eq!(condition.type_, "yt-data-node-ssdDrained");

        let sch = find(&mut f.components, "yt-scheduler");
        let decision = sch.decide(&ctx);
        assert_eq!(decision.status.sync_status, SyncStatus::Updating);
        assert_eq!(decision.step, Step::None);
    }

    #[tokio::test]
    async fn unfinished_drain_records_nothing() {
        let mut f = fixture(sample_spec());
        converge(&mut f).await;
        let mut quiescer = MockQuiescer::new();
        quiescer.expect_drain().times(1).returning(|_, _| Ok(false));
        let dn = find(&mut f.components, "yt-data-node-ssd");
        dn.quiescer = Arc::new(quiescer);

        assert!(dn.execute(Step::Drain, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn flagged_component_pods_are_removed_then_recreated() {
        let mut f = fixture(sample_spec());
        converge(&mut f).await;
        let mut update = UpdateStatus {
            state: UpdateState::WaitingForPodsRemoval,
            components: vec!["yt-scheduler".to_string()],
            conditions: Vec::new(),
        };
        let statuses = ready(&["yt-master", "yt-exec-node"]);

        let sch = find(&mut f.components, "yt-scheduler");
        let live = ctx(ClusterState::Reconfiguration, &update, &statuses);
        assert_eq!(sch.decide(&live).step, Step::RemovePods);
        sch.sync(&live).await.unwrap();
        assert_eq!(
            f.accessor
                .stateful_set("sch")
                .and_then(|s| s.spec)
                .and_then(|s| s.replicas),
            Some(0)
        );

        f.accessor.settle();
        sch.fetch().await.unwrap();
        let after = ctx(ClusterState::Reconfiguration, &update, &statuses);
        assert!(sch.server().are_pods_removed());
        assert_eq!(
            sch.decide(&after),
            Decision::status_only(ComponentStatus::waiting(SyncStatus::Updating, "pods removed"))
        );

        update.state = UpdateState::WaitingForPodsCreation;
        update.conditions.push(Condition::new(
            pods_removed_condition("yt-scheduler"),
            ConditionStatus::True,
            "PodsRemoved",
            "",
        ));
        let creation = ctx(ClusterState::Reconfiguration, &update, &statuses);
        assert_eq!(sch.decide(&creation).step, Step::Sync);
    }

    #[tokio::test]
    async fn unflagged_stale_component_waits_for_next_wave() {
        let mut f = fixture(sample_spec());
        converge(&mut f).await;

        let mut spec = sample_spec();
        spec.http_proxies[0].instance.image = Some("proxy:2".to_string());
        let mut components = build(spec, f.accessor.clone());
        let update = UpdateStatus {
            state: UpdateState::WaitingForPodsRemoval,
            components: vec!["yt-scheduler".to_string()],
            conditions: Vec::new(),
        };
        let statuses = ready(&["yt-master"]);
        let hp = find(&mut components, "yt-http-proxy");
        hp.fetch().await.unwrap();
        let status = hp.status(&ctx(ClusterState::Reconfiguration, &update, &statuses));
        assert_eq!(status.sync_status, SyncStatus::NeedRestart);
        assert!(status.sync_status.is_running());
    }
}
