//! Ytsaurus controller implementation
//!
//! `reconcile` runs one reconciler tick for a Ytsaurus resource and writes the
//! resulting status back. The tick itself is stateless: everything carried
//! between ticks lives in `status.state` and `status.updateStatus`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use ytop_common::crd::{set_condition, ClusterState, ComponentSummary, Ytsaurus, YtsaurusStatus};
use ytop_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use ytop_common::metrics::{self, ReconcileTimer};
use ytop_common::{Error, FIELD_MANAGER};
use ytop_components::{
    ClusterEvent, ClusterInfo, ClusterRecord, ConfigProvider, JsonConfigProvider,
    KubeResourceAccessor, NoopQuiescer, Quiescer, Reconciler, ResourceAccessor, TickOutcome,
};

/// Tunables of the controller loop
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Only compute statuses; never write owned objects
    pub dry_run: bool,
    /// Requeue interval of a running cluster with every component ready
    pub requeue_ready: Duration,
    /// Requeue interval while the cluster is converging
    pub requeue_progress: Duration,
    /// Requeue interval after a retryable error
    pub requeue_error: Duration,
    /// Upper bound on one reconciler tick
    pub tick_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            requeue_ready: Duration::from_secs(60),
            requeue_progress: Duration::from_secs(5),
            requeue_error: Duration::from_secs(30),
            tick_timeout: Duration::from_secs(120),
        }
    }
}

/// Writes the status subresource of a Ytsaurus resource
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Merge-patch the status, conditioned on `resource_version` when given
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &YtsaurusStatus,
    ) -> Result<(), Error>;
}

/// Status store backed by the API server
pub struct KubeStatusStore {
    client: Client,
}

impl KubeStatusStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn patch_status(
        &self,
        name: &str,
        namespace: &str,
        resource_version: Option<String>,
        status: &YtsaurusStatus,
    ) -> Result<(), Error> {
        let api: Api<Ytsaurus> = Api::namespaced(self.client.clone(), namespace);
        let mut patch = serde_json::json!({ "status": status });
        // A stale resourceVersion makes the API server answer 409
        if let Some(rv) = resource_version {
            patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
        }

        api.patch_status(
            name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        Ok(())
    }
}

/// Shared state of the Ytsaurus controller
pub struct Context {
    reconciler: Reconciler,
    observer: Reconciler,
    status: Arc<dyn StatusStore>,
    events: Arc<dyn EventPublisher>,
    config: ControllerConfig,
}

impl Context {
    /// Create a context talking to the API server
    pub fn new(client: Client, config: ControllerConfig) -> Self {
        Self::with_parts(
            Arc::new(KubeResourceAccessor::new(client.clone())),
            Arc::new(KubeStatusStore::new(client.clone())),
            Arc::new(KubeEventPublisher::new(client, FIELD_MANAGER)),
            config,
        )
    }

    /// Create a context from explicit collaborators
    pub fn with_parts(
        accessor: Arc<dyn ResourceAccessor>,
        status: Arc<dyn StatusStore>,
        events: Arc<dyn EventPublisher>,
        config: ControllerConfig,
    ) -> Self {
        let provider: Arc<dyn ConfigProvider> = Arc::new(JsonConfigProvider);
        let quiescer: Arc<dyn Quiescer> = Arc::new(NoopQuiescer);
        Self {
            reconciler: Reconciler::new(
                accessor.clone(),
                provider.clone(),
                quiescer.clone(),
                config.dry_run,
            ),
            observer: Reconciler::new(accessor, provider, quiescer, true),
            status,
            events,
            config,
        }
    }

    /// Create a context for testing with the given accessor and status store
    #[cfg(test)]
    pub fn for_testing(accessor: Arc<dyn ResourceAccessor>, status: Arc<dyn StatusStore>) -> Self {
        Self::with_parts(
            accessor,
            status,
            Arc::new(ytop_common::events::NoopEventPublisher),
            ControllerConfig::default(),
        )
    }
}

/// Reconcile a Ytsaurus resource
#[instrument(skip(yt, ctx), fields(cluster = %yt.name_any(), namespace = %yt.namespace().unwrap_or_default()))]
pub async fn reconcile(yt: Arc<Ytsaurus>, ctx: Arc<Context>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start(yt.name_any());
    let result = reconcile_cluster(&yt, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(e.category()),
    }
    result
}

async fn reconcile_cluster(yt: &Ytsaurus, ctx: &Context) -> Result<Action, Error> {
    let cluster = Arc::new(ClusterInfo::from_resource(yt)?);
    let record = ClusterRecord::from_status(yt.status.as_ref());
    debug!(state = %record.state, "reconciling cluster");

    let reconciler = if ctx.config.dry_run || !yt.spec.is_managed {
        if !yt.spec.is_managed {
            debug!("cluster is not managed, reporting status only");
        }
        &ctx.observer
    } else {
        &ctx.reconciler
    };

    let outcome = match tokio::time::timeout(
        ctx.config.tick_timeout,
        reconciler.tick(cluster.clone(), record),
    )
    .await
    {
        Ok(outcome) => outcome?,
        Err(_) => {
            return Err(Error::accessor(
                format!("Ytsaurus/{}/{}", cluster.namespace, cluster.name),
                format!("tick exceeded {:?}", ctx.config.tick_timeout),
            ))
        }
    };

    let status = build_status(yt.status.as_ref(), yt.meta().generation, &outcome);
    if yt.status.as_ref() == Some(&status) {
        debug!("status unchanged, skipping write");
    } else {
        ctx.status
            .patch_status(&cluster.name, &cluster.namespace, yt.resource_version(), &status)
            .await?;
        publish_events(yt, ctx, &outcome.events).await;
    }

    metrics::set_cluster_state(&cluster.name, status.state);

    match status.state {
        ClusterState::CreationFailed => Ok(Action::await_change()),
        ClusterState::Running if outcome.aggregate.ready => {
            Ok(Action::requeue(ctx.config.requeue_ready))
        }
        _ => Ok(Action::requeue(ctx.config.requeue_progress)),
    }
}

/// Status to persist after a tick
///
/// Conditions not owned by the tick are carried over from the previous
/// status; an unchanged aggregate keeps its transition time.
pub fn build_status(
    previous: Option<&YtsaurusStatus>,
    generation: Option<i64>,
    outcome: &TickOutcome,
) -> YtsaurusStatus {
    let mut conditions = previous.map(|s| s.conditions.clone()).unwrap_or_default();
    set_condition(&mut conditions, outcome.aggregate.condition());

    YtsaurusStatus {
        observed_generation: generation,
        state: outcome.record.state,
        message: Some(outcome.aggregate.message.clone()),
        conditions,
        components: outcome
            .components
            .iter()
            .map(|(name, status)| ComponentSummary {
                name: name.clone(),
                sync_status: status.sync_status.to_string(),
                reason: status.reason.clone(),
            })
            .collect(),
        update_status: outcome.record.update_status.clone(),
    }
}

async fn publish_events(yt: &Ytsaurus, ctx: &Context, events: &[ClusterEvent]) {
    let object = yt.object_ref(&());
    for event in events {
        let (type_, reason, action, note) = match event {
            ClusterEvent::ClusterRunning => (
                EventType::Normal,
                reasons::CLUSTER_RUNNING,
                actions::RECONCILE,
                "All components are ready".to_string(),
            ),
            ClusterEvent::CreationFailed(message) => (
                EventType::Warning,
                reasons::CREATION_FAILED,
                actions::RECONCILE,
                message.clone(),
            ),
            ClusterEvent::UpdateStarted(components) => (
                EventType::Normal,
                reasons::UPDATE_STARTED,
                actions::UPDATE,
                format!("Updating {}", components.join(", ")),
            ),
            ClusterEvent::UpdateFinished => (
                EventType::Normal,
                reasons::UPDATE_FINISHED,
                actions::UPDATE,
                "Every updated component is ready".to_string(),
            ),
            ClusterEvent::FullUpdateBlocked(components) => (
                EventType::Warning,
                reasons::FULL_UPDATE_BLOCKED,
                actions::UPDATE,
                format!(
                    "{} need a full update; set enableFullUpdate to proceed",
                    components.join(", ")
                ),
            ),
        };
        info!(reason, note = %note, "cluster event");
        ctx.events
            .publish(&object, type_, reason, action, Some(note))
            .await;
    }
}

/// Error policy for the Ytsaurus controller
///
/// Retryable errors requeue with a fixed delay, write conflicts sooner.
/// Validation and invariant failures wait for a spec change.
pub fn error_policy(yt: Arc<Ytsaurus>, error: &Error, ctx: Arc<Context>) -> Action {
    if error.is_invariant_violation() {
        error!(?error, cluster = %yt.name_any(), "invariant violated, aborting tick");
    } else if error.is_retryable() {
        warn!(error = %error, cluster = %yt.name_any(), "reconciliation failed, retrying");
    } else {
        error!(?error, cluster = %yt.name_any(), "reconciliation failed");
    }

    if error.is_conflict() {
        Action::requeue(ctx.config.requeue_progress)
    } else if error.is_retryable() {
        Action::requeue(ctx.config.requeue_error)
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use k8s_openapi::api::core::v1::ObjectReference;
    use rstest::rstest;
    use ytop_common::crd::{InstanceSpec, MastersSpec, YtsaurusSpec};
    use ytop_components::accessor::{ManagedObject, ObjectRef};

    /// Object store that never runs pods
    #[derive(Default)]
    struct MemoryAccessor {
        objects: Mutex<BTreeMap<ObjectRef, ManagedObject>>,
        writes: Mutex<usize>,
    }

    #[async_trait]
    impl ResourceAccessor for MemoryAccessor {
        async fn fetch(&self, object: &ObjectRef) -> Result<Option<ManagedObject>, Error> {
            Ok(self.objects.lock().unwrap().get(object).cloned())
        }

        async fn create_or_update(&self, object: &ManagedObject) -> Result<(), Error> {
            let r = object.object_ref()?;
            self.objects.lock().unwrap().insert(r, object.clone());
            *self.writes.lock().unwrap() += 1;
            Ok(())
        }

        async fn exists(&self, object: &ObjectRef) -> Result<bool, Error> {
            Ok(self.objects.lock().unwrap().contains_key(object))
        }
    }

    #[derive(Default)]
    struct RecordingStatusStore {
        written: Mutex<Vec<YtsaurusStatus>>,
    }

    #[async_trait]
    impl StatusStore for RecordingStatusStore {
        async fn patch_status(
            &self,
            _name: &str,
            _namespace: &str,
            _resource_version: Option<String>,
            status: &YtsaurusStatus,
        ) -> Result<(), Error> {
            self.written.lock().unwrap().push(status.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingEvents {
        reasons: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EventPublisher for RecordingEvents {
        async fn publish(
            &self,
            _resource_ref: &ObjectReference,
            _type_: EventType,
            reason: &str,
            _action: &str,
            _note: Option<String>,
        ) {
            self.reasons.lock().unwrap().push(reason.to_string());
        }
    }

    fn minimal_spec() -> YtsaurusSpec {
        YtsaurusSpec {
            core_image: "ytsaurus/ytsaurus:23.2".to_string(),
            ui_image: None,
            image_pull_secrets: Vec::new(),
            admin_credentials: None,
            config_overrides: None,
            enable_full_update: false,
            is_managed: true,
            discovery: InstanceSpec::with_count(1),
            primary_masters: MastersSpec {
                cell_tag: 1,
                instance: InstanceSpec::with_count(3),
            },
            schedulers: None,
            controller_agents: None,
            http_proxies: Vec::new(),
            rpc_proxies: Vec::new(),
            data_nodes: Vec::new(),
            exec_nodes: Vec::new(),
            ui: None,
        }
    }

    fn sample_cluster(spec: YtsaurusSpec) -> Ytsaurus {
        let mut yt = Ytsaurus::new("yt", spec);
        yt.metadata.namespace = Some("prod".to_string());
        yt.metadata.generation = Some(3);
        yt.metadata.resource_version = Some("100".to_string());
        yt
    }

    /// Story: a new cluster gets its first status with per-component progress
    #[tokio::test]
    async fn story_new_cluster_reports_creation_progress() {
        let mut store = MockStatusStore::new();
        store
            .expect_patch_status()
            .withf(|name, namespace, rv, status| {
                name.to_string() == "yt"
                    && namespace.to_string() == "prod"
                    && rv.as_deref() == Some("100")
                    && status.state == ClusterState::Creating
                    && status.observed_generation == Some(3)
                    && status.components.len() == 2
            })
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        let accessor = Arc::new(MemoryAccessor::default());
        let ctx = Arc::new(Context::for_testing(accessor.clone(), Arc::new(store)));

        let action = reconcile(Arc::new(sample_cluster(minimal_spec())), ctx)
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
        assert!(*accessor.writes.lock().unwrap() > 0);
    }

    #[tokio::test]
    async fn unchanged_status_is_not_rewritten() {
        let store = Arc::new(RecordingStatusStore::default());
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MemoryAccessor::default()),
            store.clone(),
        ));
        let mut yt = sample_cluster(minimal_spec());

        for _ in 0..3 {
            reconcile(Arc::new(yt.clone()), ctx.clone()).await.unwrap();
            yt.status = store.written.lock().unwrap().last().cloned();
        }

        let written = store.written.lock().unwrap();
        assert_eq!(written.len(), 2);
        let last = &written[1];
        assert_eq!(last.message.as_deref(), Some("yt-discovery: Blocked (pods)"));
        assert_eq!(last.components[1].name, "yt-master");
        assert_eq!(last.components[1].sync_status, "Blocked");
        assert_eq!(last.conditions.len(), 1);
    }

    #[tokio::test]
    async fn unmanaged_cluster_is_only_observed() {
        let store = Arc::new(RecordingStatusStore::default());
        let accessor = Arc::new(MemoryAccessor::default());
        let ctx = Arc::new(Context::for_testing(accessor.clone(), store.clone()));
        let mut spec = minimal_spec();
        spec.is_managed = false;

        reconcile(Arc::new(sample_cluster(spec)), ctx).await.unwrap();

        assert_eq!(*accessor.writes.lock().unwrap(), 0);
        let written = store.written.lock().unwrap();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].components[0].sync_status, "Pending");
    }

    #[tokio::test]
    async fn dry_run_controller_never_writes_objects() {
        let store = Arc::new(RecordingStatusStore::default());
        let accessor = Arc::new(MemoryAccessor::default());
        let config = ControllerConfig {
            dry_run: true,
            ..ControllerConfig::default()
        };
        let ctx = Arc::new(Context::with_parts(
            accessor.clone(),
            store.clone(),
            Arc::new(ytop_common::events::NoopEventPublisher),
            config,
        ));

        reconcile(Arc::new(sample_cluster(minimal_spec())), ctx)
            .await
            .unwrap();
        assert_eq!(*accessor.writes.lock().unwrap(), 0);
        assert_eq!(store.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_spec_fails_creation_and_waits_for_change() {
        let store = Arc::new(RecordingStatusStore::default());
        let events = Arc::new(RecordingEvents::default());
        let ctx = Arc::new(Context::with_parts(
            Arc::new(MemoryAccessor::default()),
            store.clone(),
            events.clone(),
            ControllerConfig::default(),
        ));
        let mut spec = minimal_spec();
        spec.core_image = String::new();

        let action = reconcile(Arc::new(sample_cluster(spec)), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let written = store.written.lock().unwrap();
        assert_eq!(written[0].state, ClusterState::CreationFailed);
        assert!(written[0].components.is_empty());
        assert_eq!(
            *events.reasons.lock().unwrap(),
            vec![reasons::CREATION_FAILED.to_string()]
        );
    }

    #[tokio::test]
    async fn status_write_failures_propagate() {
        let mut store = MockStatusStore::new();
        store
            .expect_patch_status()
            .returning(|name, _, _, _| {
                Err(Error::accessor(format!("Ytsaurus/prod/{name}"), "timeout"))
            });
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MemoryAccessor::default()),
            Arc::new(store),
        ));

        let err = reconcile(Arc::new(sample_cluster(minimal_spec())), ctx)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn cluster_without_namespace_is_rejected() {
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MemoryAccessor::default()),
            Arc::new(MockStatusStore::new()),
        ));
        let yt = Ytsaurus::new("yt", minimal_spec());

        let err = reconcile(Arc::new(yt), ctx).await.unwrap_err();
        assert_eq!(err.category(), "validation");
    }

    #[rstest]
    #[case(Error::accessor("StatefulSet/prod/ms", "connection reset"), Action::requeue(Duration::from_secs(30)))]
    #[case(Error::validation("core image is empty"), Action::await_change())]
    #[case(Error::invariant("executor", "sync in dry run"), Action::await_change())]
    fn error_policy_requeues_only_retryable_errors(#[case] error: Error, #[case] expected: Action) {
        let ctx = Arc::new(Context::for_testing(
            Arc::new(MemoryAccessor::default()),
            Arc::new(MockStatusStore::new()),
        ));
        let yt = Arc::new(sample_cluster(minimal_spec()));
        assert_eq!(error_policy(yt, &error, ctx), expected);
    }
}
