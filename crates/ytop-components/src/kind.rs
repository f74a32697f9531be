//! Component kinds and the naming of the objects each component owns

use std::fmt;

use ytop_common::crd::DEFAULT_GROUP;

/// DNS suffix of in-cluster service names
pub const CLUSTER_DOMAIN: &str = "svc.cluster.local";

/// Role of a component in the managed cluster
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ComponentKind {
    /// Discovery servers
    Discovery,
    /// Primary master cell
    PrimaryMaster,
    /// Schedulers
    Scheduler,
    /// Controller agents
    ControllerAgent,
    /// HTTP proxies
    HttpProxy,
    /// RPC proxies
    RpcProxy,
    /// Data nodes
    DataNode,
    /// Exec nodes
    ExecNode,
    /// Web UI
    Ui,
}

impl ComponentKind {
    /// Value of the component label, also the component name prefix
    pub fn label(self) -> &'static str {
        match self {
            Self::Discovery => "yt-discovery",
            Self::PrimaryMaster => "yt-master",
            Self::Scheduler => "yt-scheduler",
            Self::ControllerAgent => "yt-controller-agent",
            Self::HttpProxy => "yt-http-proxy",
            Self::RpcProxy => "yt-rpc-proxy",
            Self::DataNode => "yt-data-node",
            Self::ExecNode => "yt-exec-node",
            Self::Ui => "yt-ui",
        }
    }

    /// Short prefix used for workload set and service names
    pub fn short_name(self) -> &'static str {
        match self {
            Self::Discovery => "ds",
            Self::PrimaryMaster => "ms",
            Self::Scheduler => "sch",
            Self::ControllerAgent => "ca",
            Self::HttpProxy => "hp",
            Self::RpcProxy => "rp",
            Self::DataNode => "dnd",
            Self::ExecNode => "end",
            Self::Ui => "ui",
        }
    }

    /// Server binary launched in the main container
    pub fn binary_path(self) -> &'static str {
        match self {
            Self::Discovery => "/usr/bin/ytserver-discovery",
            Self::PrimaryMaster => "/usr/bin/ytserver-master",
            Self::Scheduler => "/usr/bin/ytserver-scheduler",
            Self::ControllerAgent => "/usr/bin/ytserver-controller-agent",
            Self::HttpProxy => "/usr/bin/ytserver-http-proxy",
            Self::RpcProxy => "/usr/bin/ytserver-proxy",
            Self::DataNode | Self::ExecNode => "/usr/bin/ytserver-node",
            Self::Ui => "/opt/app/run.sh",
        }
    }

    /// Key of the payload inside the config artifact
    pub fn config_file_name(self) -> &'static str {
        match self {
            Self::Discovery => "ytserver-discovery.json",
            Self::PrimaryMaster => "ytserver-master.json",
            Self::Scheduler => "ytserver-scheduler.json",
            Self::ControllerAgent => "ytserver-controller-agent.json",
            Self::HttpProxy => "ytserver-http-proxy.json",
            Self::RpcProxy => "ytserver-rpc-proxy.json",
            Self::DataNode => "ytserver-data-node.json",
            Self::ExecNode => "ytserver-exec-node.json",
            Self::Ui => "ui.json",
        }
    }

    /// Port serving the component's main protocol
    pub fn rpc_port(self) -> i32 {
        match self {
            Self::Discovery => 9020,
            Self::PrimaryMaster => 9010,
            Self::Scheduler => 9011,
            Self::ControllerAgent => 9014,
            Self::HttpProxy => 80,
            Self::RpcProxy => 9013,
            Self::DataNode => 9012,
            Self::ExecNode => 9029,
            Self::Ui => 80,
        }
    }

    /// Port exposed through the monitoring service
    pub fn monitoring_port(self) -> i32 {
        match self {
            Self::Ui => 80,
            other => other.rpc_port() + 1000,
        }
    }

    /// Whether the component can be recreated on its own in an update wave
    ///
    /// Masters hold the cluster metadata; recreating them is a full update.
    pub fn is_updatable(self) -> bool {
        !matches!(self, Self::PrimaryMaster)
    }

    /// Whether the component must be quiesced before its pods are removed
    pub fn is_drainable(self) -> bool {
        matches!(self, Self::DataNode | Self::ExecNode)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of one component: its kind plus an optional group name
///
/// Every object name the component owns derives from this.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentId {
    /// Role
    pub kind: ComponentKind,
    /// Group name; `None` for ungrouped roles and the default group
    pub group: Option<String>,
}

impl ComponentId {
    /// Identity of an ungrouped component
    pub fn single(kind: ComponentKind) -> Self {
        Self { kind, group: None }
    }

    /// Identity of one group of a grouped role
    pub fn grouped(kind: ComponentKind, group: &str) -> Self {
        let group = (group != DEFAULT_GROUP).then(|| group.to_string());
        Self { kind, group }
    }

    fn with_group(&self, base: &str) -> String {
        match &self.group {
            Some(group) => format!("{base}-{group}"),
            None => base.to_string(),
        }
    }

    /// Stable component name, e.g. `yt-master` or `yt-data-node-ssd`
    pub fn name(&self) -> String {
        self.with_group(self.kind.label())
    }

    /// Name of the workload set
    pub fn stateful_set_name(&self) -> String {
        self.with_group(self.kind.short_name())
    }

    /// Name of the headless service; also the workload set's `serviceName`
    pub fn headless_service_name(&self) -> String {
        self.stateful_set_name()
    }

    /// Name of the monitoring service
    pub fn monitoring_service_name(&self) -> String {
        format!("{}-monitoring", self.stateful_set_name())
    }

    /// Name of the config artifact
    pub fn config_map_name(&self) -> String {
        format!("{}-config", self.name())
    }

    /// Stable per-pod addresses of the first `count` replicas
    pub fn pod_addresses(&self, namespace: &str, count: i32) -> Vec<String> {
        let sts = self.stateful_set_name();
        let svc = self.headless_service_name();
        let port = self.kind.rpc_port();
        (0..count.max(0))
            .map(|i| format!("{sts}-{i}.{svc}.{namespace}.{CLUSTER_DOMAIN}:{port}"))
            .collect()
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}
