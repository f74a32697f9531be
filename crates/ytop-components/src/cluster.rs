//! Per-tick view of one Ytsaurus cluster
//!
//! [`ClusterInfo`] is the read-only spec snapshot every component is built
//! from. [`ClusterRecord`] is the persisted lifecycle state, passed into the
//! reconciler and returned from it.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use ytop_common::crd::{
    ClusterState, InstanceSpec, UpdateStatus, Ytsaurus, YtsaurusSpec, YtsaurusStatus,
};
use ytop_common::{
    Error, Result, LABEL_CLUSTER, LABEL_COMPONENT, LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE,
};

use crate::kind::{ComponentId, ComponentKind};

/// Spec snapshot of a cluster for one tick
#[derive(Clone, Debug)]
pub struct ClusterInfo {
    /// Cluster name
    pub name: String,
    /// Namespace every owned object lives in
    pub namespace: String,
    /// Desired state
    pub spec: YtsaurusSpec,
    /// Controller owner reference stamped on every owned object
    pub owner: Option<OwnerReference>,
}

impl ClusterInfo {
    /// Snapshot a Ytsaurus resource
    pub fn from_resource(yt: &Ytsaurus) -> Result<Self> {
        let name = yt.name_any();
        let namespace = yt.namespace().ok_or_else(|| {
            Error::validation_for_field(&name, "metadata.namespace", "Ytsaurus must be namespaced")
        })?;
        Ok(Self {
            name,
            namespace,
            spec: yt.spec.clone(),
            owner: yt.controller_owner_ref(&()),
        })
    }

    /// Snapshot without an owner, for tests and dry runs
    pub fn new(name: impl Into<String>, namespace: impl Into<String>, spec: YtsaurusSpec) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            spec,
            owner: None,
        }
    }

    /// Instance spec of a component, `None` if the spec no longer declares it
    pub fn instance_spec(&self, id: &ComponentId) -> Option<&InstanceSpec> {
        let spec = &self.spec;
        let group = id.group.as_deref().unwrap_or(ytop_common::crd::DEFAULT_GROUP);
        match id.kind {
            ComponentKind::Discovery => Some(&spec.discovery),
            ComponentKind::PrimaryMaster => Some(&spec.primary_masters.instance),
            ComponentKind::Scheduler => spec.schedulers.as_ref(),
            ComponentKind::ControllerAgent => spec.controller_agents.as_ref(),
            ComponentKind::Ui => spec.ui.as_ref(),
            ComponentKind::HttpProxy => spec
                .http_proxies
                .iter()
                .find(|p| p.role == group)
                .map(|p| &p.instance),
            ComponentKind::RpcProxy => spec
                .rpc_proxies
                .iter()
                .find(|p| p.role == group)
                .map(|p| &p.instance),
            ComponentKind::DataNode => spec
                .data_nodes
                .iter()
                .find(|n| n.name == group)
                .map(|n| &n.instance),
            ComponentKind::ExecNode => spec
                .exec_nodes
                .iter()
                .find(|n| n.name == group)
                .map(|n| &n.instance),
        }
    }

    /// Effective image: role override, else the UI image for the UI, else the core image
    pub fn image(&self, id: &ComponentId, instance: &InstanceSpec) -> String {
        if let Some(image) = &instance.image {
            return image.clone();
        }
        match (id.kind, &self.spec.ui_image) {
            (ComponentKind::Ui, Some(ui)) => ui.clone(),
            _ => self.spec.core_image.clone(),
        }
    }

    /// Labels stamped on every object of a component
    pub fn labels(&self, id: &ComponentId) -> BTreeMap<String, String> {
        let mut labels = self.selector_labels(id);
        labels.insert(
            LABEL_MANAGED_BY.to_string(),
            LABEL_MANAGED_BY_VALUE.to_string(),
        );
        labels
    }

    /// Labels selecting the pods of a component
    pub fn selector_labels(&self, id: &ComponentId) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_CLUSTER.to_string(), self.name.clone()),
            (LABEL_COMPONENT.to_string(), id.name()),
        ])
    }

    /// Metadata for an owned object
    pub fn object_meta(&self, id: &ComponentId, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.labels(id)),
            owner_references: self.owner.clone().map(|o| vec![o]),
            ..Default::default()
        }
    }
}

/// Persisted lifecycle state of a cluster
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterRecord {
    /// Macro lifecycle state
    pub state: ClusterState,
    /// Progress of the current update wave
    pub update_status: UpdateStatus,
}

impl ClusterRecord {
    /// Record read back from a stored status; `Creating` when none was written
    pub fn from_status(status: Option<&YtsaurusStatus>) -> Self {
        status
            .map(|s| Self {
                state: s.state,
                update_status: s.update_status.clone(),
            })
            .unwrap_or_default()
    }

    /// Record in the given state with no update in flight
    pub fn in_state(state: ClusterState) -> Self {
        Self {
            state,
            update_status: UpdateStatus::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::sample_spec;

    #[test]
    fn grouped_instance_specs_are_found_by_group() {
        let cluster = ClusterInfo::new("yt", "ns", sample_spec());
        let ssd = ComponentId::grouped(ComponentKind::DataNode, "ssd");
        assert_eq!(cluster.instance_spec(&ssd).map(|i| i.instance_count), Some(3));

        let missing = ComponentId::grouped(ComponentKind::DataNode, "hdd");
        assert!(cluster.instance_spec(&missing).is_none());
    }

    #[test]
    fn role_image_overrides_core_image() {
        let mut spec = sample_spec();
        spec.schedulers = Some(InstanceSpec {
            image: Some("custom:1".to_string()),
            ..InstanceSpec::with_count(1)
        });
        spec.ui_image = Some("ui:2".to_string());
        let cluster = ClusterInfo::new("yt", "ns", spec);

        let sch = ComponentId::single(ComponentKind::Scheduler);
        let instance = cluster.instance_spec(&sch).cloned().unwrap_or_default();
        assert_eq!(cluster.image(&sch, &instance), "custom:1");

        let ui = ComponentId::single(ComponentKind::Ui);
        assert_eq!(cluster.image(&ui, &InstanceSpec::with_count(1)), "ui:2");

        let ms = ComponentId::single(ComponentKind::PrimaryMaster);
        assert_eq!(
            cluster.image(&ms, &InstanceSpec::with_count(1)),
            cluster.spec.core_image
        );
    }

    #[test]
    fn labels_carry_cluster_and_component() {
        let cluster = ClusterInfo::new("yt", "ns", sample_spec());
        let labels = cluster.labels(&ComponentId::single(ComponentKind::PrimaryMaster));
        assert_eq!(labels.get(LABEL_CLUSTER).map(String::as_str), Some("yt"));
        assert_eq!(labels.get(LABEL_COMPONENT).map(String::as_str), Some("yt-master"));
        assert_eq!(
            labels.get(LABEL_MANAGED_BY).map(String::as_str),
            Some(LABEL_MANAGED_BY_VALUE)
        );
    }

    #[test]
    fn missing_status_starts_in_creating() {
        let record = ClusterRecord::from_status(None);
        assert_eq!(record.state, ClusterState::Creating);
        assert!(record.update_status.components.is_empty());
    }
}
