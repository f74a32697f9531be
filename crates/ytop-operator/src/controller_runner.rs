//! Controller runner: builds the Ytsaurus controller future
//!
//! The controller watches Ytsaurus resources plus the StatefulSets, Services
//! and ConfigMaps they own, so a change to any owned object requeues its
//! cluster.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;

use ytop_common::crd::Ytsaurus;
use ytop_common::{LABEL_MANAGED_BY, LABEL_MANAGED_BY_VALUE};

use crate::controller::{error_policy, reconcile, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the Ytsaurus controller future
///
/// With `namespace` set, only that namespace is watched.
pub fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
    namespace: Option<&str>,
) -> Vec<Pin<Box<dyn Future<Output = ()> + Send>>> {
    let clusters: Api<Ytsaurus> = scoped_api(&client, namespace);
    let owned = WatcherConfig::default()
        .timeout(WATCH_TIMEOUT_SECS)
        .labels(&owned_objects_selector());

    tracing::info!(namespace = namespace.unwrap_or("*"), "- Ytsaurus controller");

    vec![Box::pin(
        Controller::new(clusters, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
            .owns(scoped_api::<StatefulSet>(&client, namespace), owned.clone())
            .owns(scoped_api::<Service>(&client, namespace), owned.clone())
            .owns(scoped_api::<ConfigMap>(&client, namespace), owned)
            .shutdown_on_signal()
            .run(reconcile, error_policy, ctx)
            .for_each(log_reconcile_result("Ytsaurus")),
    )]
}

/// Label selector matching only objects this operator applied
fn owned_objects_selector() -> String {
    format!("{LABEL_MANAGED_BY}={LABEL_MANAGED_BY_VALUE}")
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope> + Clone + DeserializeOwned + std::fmt::Debug,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
