//! Common types for ytop: CRDs, errors, events and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Field manager used for every server-side apply issued by the operator
pub const FIELD_MANAGER: &str = "ytop-operator";

/// Standard label carrying the managing controller
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value of [`LABEL_MANAGED_BY`] on every object the operator owns
pub const LABEL_MANAGED_BY_VALUE: &str = "ytop-operator";

/// Label carrying the owning Ytsaurus cluster name
pub const LABEL_CLUSTER: &str = "ytsaurus.tech/cluster-name";

/// Label carrying the component name (e.g. `yt-master`, `yt-data-node-ssd`)
pub const LABEL_COMPONENT: &str = "ytsaurus.tech/component";

/// Directory inside server containers where the config artifact is mounted
pub const CONFIG_MOUNT_POINT: &str = "/config";

/// Name of the main server container in every workload set
pub const SERVER_CONTAINER_NAME: &str = "ytserver";

/// Name of the init container preparing storage locations
pub const PREPARE_LOCATIONS_CONTAINER_NAME: &str = "prepare-locations";

/// Name of the pod volume backed by the config artifact
pub const CONFIG_VOLUME_NAME: &str = "config";
