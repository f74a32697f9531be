//! Resource Accessor: read/write access to the objects realizing a component
//!
//! The reconciliation engine only ever sees [`ResourceAccessor`]. The kube
//! implementation writes with server-side apply, so every write is a single
//! atomic request and repeating it with the same object is a no-op.

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use ytop_common::{Error, Result, FIELD_MANAGER};

/// Kind of an object owned by a component
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    /// Workload set
    StatefulSet,
    /// Headless or monitoring service
    Service,
    /// Config artifact
    ConfigMap,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatefulSet => f.write_str("StatefulSet"),
            Self::Service => f.write_str("Service"),
            Self::ConfigMap => f.write_str("ConfigMap"),
        }
    }
}

/// Reference to a namespaced object
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    /// Object kind
    pub kind: ObjectKind,
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectRef {
    /// Build a reference
    pub fn new(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// An object owned by a component
#[derive(Clone, Debug, PartialEq)]
pub enum ManagedObject {
    /// Workload set
    StatefulSet(StatefulSet),
    /// Service
    Service(Service),
    /// Config artifact
    ConfigMap(ConfigMap),
}

impl ManagedObject {
    /// Kind of the wrapped object
    pub fn kind(&self) -> ObjectKind {
        match self {
            Self::StatefulSet(_) => ObjectKind::StatefulSet,
            Self::Service(_) => ObjectKind::Service,
            Self::ConfigMap(_) => ObjectKind::ConfigMap,
        }
    }

    /// Reference of the wrapped object; objects without name or namespace are a bug
    pub fn object_ref(&self) -> Result<ObjectRef> {
        let (name, namespace) = match self {
            Self::StatefulSet(o) => (o.metadata.name.clone(), o.namespace()),
            Self::Service(o) => (o.metadata.name.clone(), o.namespace()),
            Self::ConfigMap(o) => (o.metadata.name.clone(), o.namespace()),
        };
        match (name, namespace) {
            (Some(name), Some(namespace)) => Ok(ObjectRef::new(self.kind(), namespace, name)),
            _ => Err(Error::invariant(
                "accessor",
                format!("{} built without name or namespace", self.kind()),
            )),
        }
    }

    /// Unwrap a workload set read through `object`
    pub fn into_stateful_set(self, object: &ObjectRef) -> Result<StatefulSet> {
        match self {
            Self::StatefulSet(sts) => Ok(sts),
            other => Err(kind_mismatch(object, other.kind())),
        }
    }

    /// Unwrap a service read through `object`
    pub fn into_service(self, object: &ObjectRef) -> Result<Service> {
        match self {
            Self::Service(svc) => Ok(svc),
            other => Err(kind_mismatch(object, other.kind())),
        }
    }

    /// Unwrap a config artifact read through `object`
    pub fn into_config_map(self, object: &ObjectRef) -> Result<ConfigMap> {
        match self {
            Self::ConfigMap(cm) => Ok(cm),
            other => Err(kind_mismatch(object, other.kind())),
        }
    }
}

fn kind_mismatch(object: &ObjectRef, got: ObjectKind) -> Error {
    Error::invariant("accessor", format!("fetch of {object} returned a {got}"))
}

/// Read/write access to the objects realizing components
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceAccessor: Send + Sync {
    /// Read an object; `Ok(None)` when it does not exist
    async fn fetch(&self, object: &ObjectRef) -> Result<Option<ManagedObject>>;

    /// Create or update an object in one atomic write
    async fn create_or_update(&self, object: &ManagedObject) -> Result<()>;

    /// Whether an object exists
    async fn exists(&self, object: &ObjectRef) -> Result<bool>;
}

/// Accessor backed by the Kubernetes API
pub struct KubeResourceAccessor {
    client: Client,
}

impl KubeResourceAccessor {
    /// Create an accessor using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn wrap_err(object: &ObjectRef, e: kube::Error) -> Error {
        match e {
            // Keep API errors intact so callers can classify them
            kube::Error::Api(_) => Error::from(e),
            other => Error::accessor(object.to_string(), other.to_string()),
        }
    }
}

#[async_trait]
impl ResourceAccessor for KubeResourceAccessor {
    async fn fetch(&self, object: &ObjectRef) -> Result<Option<ManagedObject>> {
        let client = self.client.clone();
        let ns = object.namespace.as_str();
        let name = object.name.as_str();
        let found = match object.kind {
            ObjectKind::StatefulSet => Api::<StatefulSet>::namespaced(client, ns)
                .get_opt(name)
                .await
                .map(|o| o.map(ManagedObject::StatefulSet)),
            ObjectKind::Service => Api::<Service>::namespaced(client, ns)
                .get_opt(name)
                .await
                .map(|o| o.map(ManagedObject::Service)),
            ObjectKind::ConfigMap => Api::<ConfigMap>::namespaced(client, ns)
                .get_opt(name)
                .await
                .map(|o| o.map(ManagedObject::ConfigMap)),
        };
        found.map_err(|e| Self::wrap_err(object, e))
    }

    async fn create_or_update(&self, object: &ManagedObject) -> Result<()> {
        let target = object.object_ref()?;
        let client = self.client.clone();
        let ns = target.namespace.as_str();
        let name = target.name.as_str();
        let params = PatchParams::apply(FIELD_MANAGER).force();

        let applied = match object {
            ManagedObject::StatefulSet(o) => Api::<StatefulSet>::namespaced(client, ns)
                .patch(name, &params, &Patch::Apply(o))
                .await
                .map(|_| ()),
            ManagedObject::Service(o) => Api::<Service>::namespaced(client, ns)
                .patch(name, &params, &Patch::Apply(o))
                .await
                .map(|_| ()),
            ManagedObject::ConfigMap(o) => Api::<ConfigMap>::namespaced(client, ns)
                .patch(name, &params, &Patch::Apply(o))
                .await
                .map(|_| ()),
        };
        applied.map_err(|e| Self::wrap_err(&target, e))?;

        debug!(object = %target, "applied object");
        Ok(())
    }

    async fn exists(&self, object: &ObjectRef) -> Result<bool> {
        Ok(self.fetch(object).await?.is_some())
    }
}
