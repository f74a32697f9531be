//! Test fixtures: a sample cluster spec and an in-memory accessor

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use serde_json::{Map, Value};

use ytop_common::crd::{
    InstanceSpec, MastersSpec, NodesSpec, ProxiesSpec, YtsaurusSpec, DEFAULT_GROUP,
};
use ytop_common::Result;

use crate::accessor::{ManagedObject, ObjectKind, ObjectRef, ResourceAccessor};

pub(crate) const NAMESPACE: &str = "prod";

/// Discovery, 3 masters, one of each single role, a default HTTP proxy group,
/// an `ssd` data node group and a default exec node group
pub(crate) fn sample_spec() -> YtsaurusSpec {
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
        schedulers: Some(InstanceSpec::with_count(1)),
        controller_agents: Some(InstanceSpec::with_count(1)),
        http_proxies: vec![ProxiesSpec {
            role: DEFAULT_GROUP.to_string(),
            instance: InstanceSpec::with_count(2),
        }],
        rpc_proxies: Vec::new(),
        data_nodes: vec![NodesSpec {
            name: "ssd".to_string(),
            instance: InstanceSpec::with_count(3),
        }],
        exec_nodes: vec![NodesSpec {
            name: DEFAULT_GROUP.to_string(),
            instance: InstanceSpec::with_count(2),
        }],
        ui: None,
    }
}

/// Spec with only discovery and masters
pub(crate) fn minimal_spec() -> YtsaurusSpec {
    YtsaurusSpec {
        schedulers: None,
        controller_agents: None,
        http_proxies: Vec::new(),
        data_nodes: Vec::new(),
        exec_nodes: Vec::new(),
        ..sample_spec()
    }
}

/// Apply an RFC 7386 merge patch the way the API server does for `Patch::Merge`
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    let Some(doc) = target.as_object_mut() else {
        return;
    };
    for (key, value) in fields {
        if value.is_null() {
            doc.remove(key);
        } else {
            merge_patch(doc.entry(key.clone()).or_insert(Value::Null), value);
        }
    }
}

/// In-memory object store behaving like the API server for the fields the
/// engine reads: generations bump on spec changes, status is only touched by
/// [`FakeAccessor::settle`].
#[derive(Default)]
pub(crate) struct FakeAccessor {
    objects: Mutex<BTreeMap<ObjectRef, ManagedObject>>,
    writes: Mutex<Vec<ObjectRef>>,
}

impl FakeAccessor {
    pub(crate) fn written_refs(&self) -> Vec<ObjectRef> {
        self.writes.lock().unwrap().clone()
    }

    pub(crate) fn clear_writes(&self) {
        self.writes.lock().unwrap().clear();
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<ObjectRef, ManagedObject> {
        self.objects.lock().unwrap().clone()
    }

    pub(crate) fn stateful_set(&self, name: &str) -> Option<StatefulSet> {
        let r = ObjectRef::new(ObjectKind::StatefulSet, NAMESPACE, name);
        match self.objects.lock().unwrap().get(&r) {
            Some(ManagedObject::StatefulSet(sts)) => Some(sts.clone()),
            _ => None,
        }
    }

    pub(crate) fn insert(&self, object: ManagedObject) {
        let r = object.object_ref().unwrap();
        self.objects.lock().unwrap().insert(r, object);
    }

    /// Every workload set converges to its desired replica count
    pub(crate) fn settle(&self) {
        self.settle_except(&[]);
    }

    /// Like [`settle`](Self::settle), but the named workload sets stay as they are
    pub(crate) fn settle_except(&self, stuck: &[&str]) {
        let mut objects = self.objects.lock().unwrap();
        for object in objects.values_mut() {
            let ManagedObject::StatefulSet(sts) = object else {
                continue;
            };
            if sts
                .metadata
                .name
                .as_deref()
                .is_some_and(|n| stuck.contains(&n))
            {
                continue;
            }
            let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
            sts.status = Some(StatefulSetStatus {
                replicas,
                ready_replicas: Some(replicas),
                updated_replicas: Some(replicas),
                observed_generation: sts.metadata.generation,
                ..Default::default()
            });
        }
    }
}

#[async_trait]
impl ResourceAccessor for FakeAccessor {
    async fn fetch(&self, object: &ObjectRef) -> Result<Option<ManagedObject>> {
        Ok(self.objects.lock().unwrap().get(object).cloned())
    }

    async fn create_or_update(&self, object: &ManagedObject) -> Result<()> {
        let r = object.object_ref()?;
        let mut objects = self.objects.lock().unwrap();
        let mut object = object.clone();
        if let ManagedObject::StatefulSet(new) = &mut object {
            match objects.get(&r) {
                Some(ManagedObject::StatefulSet(old)) => {
                    let generation = old.metadata.generation.unwrap_or(1);
                    new.metadata.generation = Some(if old.spec != new.spec {
                        generation + 1
                    } else {
                        generation
                    });
                    new.status = old.status.clone();
                }
                _ => new.metadata.generation = Some(1),
            }
        }
        objects.insert(r.clone(), object);
        self.writes.lock().unwrap().push(r);
        Ok(())
    }

    async fn exists(&self, object: &ObjectRef) -> Result<bool> {
        Ok(self.objects.lock().unwrap().contains_key(object))
    }
}
