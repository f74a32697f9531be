//! Managed Server: the objects realizing one component
//!
//! A server owns a workload set, a headless service, a monitoring service and
//! a config artifact. It reads them through the accessor, answers the
//! predicates the component state machine needs, and rebuilds them from the
//! instance spec.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, PersistentVolumeClaim, PodSpec,
    PodTemplateSpec, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use ytop_common::crd::{InstanceSpec, LocationSpec};
use ytop_common::{
    Error, Result, CONFIG_MOUNT_POINT, CONFIG_VOLUME_NAME, PREPARE_LOCATIONS_CONTAINER_NAME,
    SERVER_CONTAINER_NAME,
};

use crate::accessor::{ManagedObject, ObjectKind, ObjectRef, ResourceAccessor};
use crate::cluster::ClusterInfo;
use crate::config::ConfigProvider;
use crate::kind::ComponentId;

/// Observed state, replaced as a whole by a successful fetch
#[derive(Clone, Debug, Default)]
struct Observed {
    stateful_set: Option<StatefulSet>,
    headless_service: Option<Service>,
    monitoring_service: Option<Service>,
    config_map: Option<ConfigMap>,
    desired_config: Option<std::result::Result<String, String>>,
}

/// The bundle of objects realizing one component
pub struct ManagedServer {
    id: ComponentId,
    cluster: Arc<ClusterInfo>,
    instance: InstanceSpec,
    accessor: Arc<dyn ResourceAccessor>,
    config: Arc<dyn ConfigProvider>,
    observed: Observed,
    built: Option<StatefulSet>,
}

impl ManagedServer {
    /// Create the server of a component declared in the cluster spec
    pub fn new(
        id: ComponentId,
        cluster: Arc<ClusterInfo>,
        accessor: Arc<dyn ResourceAccessor>,
        config: Arc<dyn ConfigProvider>,
    ) -> Result<Self> {
        let instance = cluster.instance_spec(&id).cloned().ok_or_else(|| {
            Error::invariant("components", format!("{id} is not declared in the spec"))
        })?;
        Ok(Self {
            id,
            cluster,
            instance,
            accessor,
            config,
            observed: Observed::default(),
            built: None,
        })
    }

    /// Identity of the component this server realizes
    pub fn id(&self) -> &ComponentId {
        &self.id
    }

    /// Desired replica count
    pub fn instance_count(&self) -> i32 {
        self.instance.instance_count
    }

    fn object_ref(&self, kind: ObjectKind, name: String) -> ObjectRef {
        ObjectRef::new(kind, self.cluster.namespace.clone(), name)
    }

    /// Reference of the workload set
    pub fn stateful_set_ref(&self) -> ObjectRef {
        self.object_ref(ObjectKind::StatefulSet, self.id.stateful_set_name())
    }

    fn headless_service_ref(&self) -> ObjectRef {
        self.object_ref(ObjectKind::Service, self.id.headless_service_name())
    }

    fn monitoring_service_ref(&self) -> ObjectRef {
        self.object_ref(ObjectKind::Service, self.id.monitoring_service_name())
    }

    fn config_map_ref(&self) -> ObjectRef {
        self.object_ref(ObjectKind::ConfigMap, self.id.config_map_name())
    }

    fn overrides_ref(&self) -> Option<ObjectRef> {
        self.cluster
            .spec
            .config_overrides
            .as_ref()
            .map(|r| self.object_ref(ObjectKind::ConfigMap, r.name.clone()))
    }

    async fn fetch_object(&self, object: Option<ObjectRef>) -> Result<Option<ManagedObject>> {
        match object {
            Some(object) => self.accessor.fetch(&object).await,
            None => Ok(None),
        }
    }

    /// Read every owned object and render the desired config
    ///
    /// Observed state is only replaced once every read succeeded.
    pub async fn fetch(&mut self) -> Result<()> {
        let sts_ref = self.stateful_set_ref();
        let headless_ref = self.headless_service_ref();
        let monitoring_ref = self.monitoring_service_ref();
        let cm_ref = self.config_map_ref();
        let overrides_ref = self.overrides_ref();

        let (sts, headless, monitoring, cm, overrides) = futures::try_join!(
            self.fetch_object(Some(sts_ref.clone())),
            self.fetch_object(Some(headless_ref.clone())),
            self.fetch_object(Some(monitoring_ref.clone())),
            self.fetch_object(Some(cm_ref.clone())),
            self.fetch_object(overrides_ref.clone()),
        )?;

        let stateful_set = sts.map(|o| o.into_stateful_set(&sts_ref)).transpose()?;
        let headless_service = headless.map(|o| o.into_service(&headless_ref)).transpose()?;
        let monitoring_service = monitoring
            .map(|o| o.into_service(&monitoring_ref))
            .transpose()?;
        let config_map = cm.map(|o| o.into_config_map(&cm_ref)).transpose()?;

        let desired_config = match (overrides_ref, overrides) {
            (Some(r), None) => Err(format!("overrides {r} not found")),
            (Some(r), Some(o)) => {
                let entry = o.into_config_map(&r)?.data.and_then(|mut data| {
                    data.remove(self.id.kind.config_file_name())
                });
                self.render_config(entry)
            }
            (None, _) => self.render_config(None),
        };

        self.observed = Observed {
            stateful_set,
            headless_service,
            monitoring_service,
            config_map,
            desired_config: Some(desired_config),
        };
        Ok(())
    }

    fn render_config(&self, overrides: Option<String>) -> std::result::Result<String, String> {
        self.config
            .generate(&self.id, &self.cluster, overrides)
            .map_err(|e| match e {
                Error::Config { message, .. } => message,
                other => other.to_string(),
            })
    }

    /// Why the desired config could not be rendered, if it could not
    pub fn config_error(&self) -> Option<&str> {
        match &self.observed.desired_config {
            Some(Ok(_)) => None,
            Some(Err(e)) => Some(e.as_str()),
            None => Some("observed state was not fetched"),
        }
    }

    fn desired_config(&self) -> Option<&str> {
        match &self.observed.desired_config {
            Some(Ok(payload)) => Some(payload.as_str()),
            _ => None,
        }
    }

    fn deployed_config(&self) -> Option<&str> {
        self.observed
            .config_map
            .as_ref()
            .and_then(|cm| cm.data.as_ref())
            .and_then(|data| data.get(self.id.kind.config_file_name()))
            .map(String::as_str)
    }

    /// Image of the main container of the observed workload set
    pub fn deployed_image(&self) -> Option<&str> {
        self.observed
            .stateful_set
            .as_ref()
            .and_then(|sts| sts.spec.as_ref())
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.containers.iter().find(|c| c.name == SERVER_CONTAINER_NAME))
            .and_then(|c| c.image.as_deref())
    }

    /// Image the workload set should run
    pub fn resolved_image(&self) -> String {
        self.cluster.image(&self.id, &self.instance)
    }

    /// Whether every owned object exists
    pub fn all_exist(&self) -> bool {
        let o = &self.observed;
        o.stateful_set.is_some()
            && o.headless_service.is_some()
            && o.monitoring_service.is_some()
            && o.config_map.is_some()
    }

    fn config_stale(&self, desired: &str) -> bool {
        match self.deployed_config() {
            Some(deployed) => self.config.needs_reload(deployed, desired),
            None => true,
        }
    }

    fn replicas_differ(&self) -> bool {
        let replicas = self
            .observed
            .stateful_set
            .as_ref()
            .and_then(|sts| sts.spec.as_ref())
            .and_then(|spec| spec.replicas);
        replicas != Some(self.instance.instance_count)
    }

    /// Objects must be written: config stale, something missing, or replicas off
    ///
    /// False while the config cannot be rendered; that case blocks the
    /// component before a sync would be attempted.
    pub fn need_sync(&self) -> bool {
        let Some(desired) = self.desired_config() else {
            return false;
        };
        !self.all_exist() || self.config_stale(desired) || self.replicas_differ()
    }

    /// The running deployment diverges from spec and must be recreated
    ///
    /// A component with missing objects needs creation, not an update.
    pub fn need_update(&self) -> bool {
        if !self.all_exist() {
            return false;
        }
        let Some(desired) = self.desired_config() else {
            return false;
        };
        self.deployed_image() != Some(self.resolved_image().as_str()) || self.config_stale(desired)
    }

    /// Pods observed the current generation and all replicas are ready and updated
    pub fn are_pods_ready(&self) -> bool {
        let Some(sts) = &self.observed.stateful_set else {
            return false;
        };
        let Some(status) = &sts.status else {
            return false;
        };
        let count = self.instance.instance_count;
        status.observed_generation.unwrap_or(0) >= sts.metadata.generation.unwrap_or(0)
            && status.ready_replicas.unwrap_or(0) == count
            && status.updated_replicas.unwrap_or(0) == count
    }

    /// The workload set exists, targets zero replicas and has converged to zero
    pub fn are_pods_removed(&self) -> bool {
        let Some(sts) = &self.observed.stateful_set else {
            return false;
        };
        let target = sts.spec.as_ref().and_then(|s| s.replicas);
        let observed = sts.status.as_ref().map_or(0, |s| s.replicas);
        target == Some(0) && observed == 0
    }

    /// Write config artifact, services and workload set
    ///
    /// One atomic write per object; a partial failure is repaired by the next
    /// sync since every object is rebuilt from spec.
    pub async fn sync(&mut self) -> Result<()> {
        let payload = match &self.observed.desired_config {
            Some(Ok(payload)) => payload.clone(),
            _ => {
                let reason = self.config_error().unwrap_or_default().to_string();
                return Err(Error::config(self.id.name(), reason));
            }
        };

        let objects = [
            ManagedObject::ConfigMap(self.build_config_map(payload)),
            ManagedObject::Service(self.build_headless_service()),
            ManagedObject::Service(self.build_monitoring_service()),
            ManagedObject::StatefulSet(self.rebuild_stateful_workload().clone()),
        ];
        for object in &objects {
            self.accessor.create_or_update(object).await?;
        }
        debug!(component = %self.id, "synced objects");
        Ok(())
    }

    /// Scale the workload set to zero
    pub async fn remove_pods(&mut self) -> Result<()> {
        let mut sts = self.rebuild_stateful_workload().clone();
        if let Some(spec) = sts.spec.as_mut() {
            spec.replicas = Some(0);
        }
        self.accessor
            .create_or_update(&ManagedObject::StatefulSet(sts))
            .await?;
        debug!(component = %self.id, "scaled workload set to zero");
        Ok(())
    }

    /// Desired workload set, built once per server
    pub fn build_stateful_workload(&mut self) -> &StatefulSet {
        let sts = match self.built.take() {
            Some(sts) => sts,
            None => self.desired_stateful_set(),
        };
        self.built.insert(sts)
    }

    /// Desired workload set, recomputed from the instance spec
    pub fn rebuild_stateful_workload(&mut self) -> &StatefulSet {
        let sts = self.desired_stateful_set();
        self.built.insert(sts)
    }

    fn desired_stateful_set(&self) -> StatefulSet {
        let id = &self.id;
        let cluster = &self.cluster;
        let instance = &self.instance;
        let image = self.resolved_image();
        let selector = cluster.selector_labels(id);

        let config_path = format!("{CONFIG_MOUNT_POINT}/{}", id.kind.config_file_name());
        let mut server_mounts = instance.volume_mounts.clone();
        server_mounts.push(VolumeMount {
            name: CONFIG_VOLUME_NAME.to_string(),
            mount_path: CONFIG_MOUNT_POINT.to_string(),
            read_only: Some(true),
            ..Default::default()
        });

        let mut volumes = instance.volumes.clone();
        volumes.push(Volume {
            name: CONFIG_VOLUME_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: id.config_map_name().into(),
                ..Default::default()
            }),
            ..Default::default()
        });

        let mut ports = vec![ContainerPort {
            name: Some("rpc".to_string()),
            container_port: id.kind.rpc_port(),
            ..Default::default()
        }];
        if id.kind.monitoring_port() != id.kind.rpc_port() {
            ports.push(ContainerPort {
                name: Some("monitoring".to_string()),
                container_port: id.kind.monitoring_port(),
                ..Default::default()
            });
        }

        let server = Container {
            name: SERVER_CONTAINER_NAME.to_string(),
            image: Some(image.clone()),
            command: Some(vec![
                id.kind.binary_path().to_string(),
                "--config".to_string(),
                config_path,
            ]),
            resources: instance.resources.clone(),
            volume_mounts: Some(server_mounts),
            ports: Some(ports),
            ..Default::default()
        };

        let prepare_locations = Container {
            name: PREPARE_LOCATIONS_CONTAINER_NAME.to_string(),
            image: Some(image),
            command: Some(vec![
                "bash".to_string(),
                "-c".to_string(),
                prepare_locations_command(&instance.locations),
            ]),
            volume_mounts: non_empty(instance.volume_mounts.clone()),
            ..Default::default()
        };

        let pod = PodSpec {
            containers: vec![server],
            init_containers: Some(vec![prepare_locations]),
            volumes: Some(volumes),
            image_pull_secrets: non_empty(cluster.spec.image_pull_secrets.clone()),
            set_hostname_as_fqdn: Some(true),
            affinity: instance.affinity.clone(),
            node_selector: (!instance.node_selector.is_empty())
                .then(|| instance.node_selector.clone()),
            tolerations: non_empty(instance.tolerations.clone()),
            ..Default::default()
        };

        let claims: Vec<PersistentVolumeClaim> = instance
            .volume_claim_templates
            .iter()
            .map(|t| PersistentVolumeClaim {
                metadata: ObjectMeta {
                    name: Some(t.name.clone()),
                    ..Default::default()
                },
                spec: Some(t.spec.clone()),
                ..Default::default()
            })
            .collect();

        StatefulSet {
            metadata: cluster.object_meta(id, id.stateful_set_name()),
            spec: Some(StatefulSetSpec {
                replicas: Some(instance.instance_count),
                service_name: id.headless_service_name().into(),
                pod_management_policy: Some("Parallel".to_string()),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(cluster.labels(id)),
                        ..Default::default()
                    }),
                    spec: Some(pod),
                },
                volume_claim_templates: non_empty(claims),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_headless_service(&self) -> Service {
        let id = &self.id;
        Service {
            metadata: self.cluster.object_meta(id, id.headless_service_name()),
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(self.cluster.selector_labels(id)),
                publish_not_ready_addresses: Some(true),
                ports: Some(vec![ServicePort {
                    name: Some("rpc".to_string()),
                    port: id.kind.rpc_port(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_monitoring_service(&self) -> Service {
        let id = &self.id;
        let port = id.kind.monitoring_port();
        Service {
            metadata: self.cluster.object_meta(id, id.monitoring_service_name()),
            spec: Some(ServiceSpec {
                selector: Some(self.cluster.selector_labels(id)),
                ports: Some(vec![ServicePort {
                    name: Some("ytsaurus-metrics".to_string()),
                    port,
                    target_port: Some(IntOrString::Int(port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_config_map(&self, payload: String) -> ConfigMap {
        let id = &self.id;
        ConfigMap {
            metadata: self.cluster.object_meta(id, id.config_map_name()),
            data: Some(BTreeMap::from([(
                id.kind.config_file_name().to_string(),
                payload,
            )])),
            ..Default::default()
        }
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

/// Shell command creating every storage location before the server starts
fn prepare_locations_command(locations: &[LocationSpec]) -> String {
    if locations.is_empty() {
        return "true".to_string();
    }
    locations
        .iter()
        .map(|l| format!("mkdir -p {}", shell_quote(&l.path)))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Single-quote a word for `bash -c`
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}
