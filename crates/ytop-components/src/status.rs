//! Component sync status

use std::fmt;

/// Outcome of evaluating one component
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Converged
    Ready,
    /// Objects are being written
    Pending,
    /// Waiting on a dependency, the config or pods
    Blocked,
    /// The running deployment is stale and can be recreated on its own
    NeedLocalUpdate,
    /// The running deployment is stale and needs a full cluster update
    NeedFullUpdate,
    /// Stale, but no update wave can pick it up right now
    NeedRestart,
    /// Going through the update sub-protocol
    Updating,
}

impl SyncStatus {
    /// Statuses under which dependents may proceed: the deployment is up,
    /// possibly stale
    pub fn is_running(self) -> bool {
        matches!(self, Self::Ready | Self::NeedLocalUpdate | Self::NeedRestart)
    }

    /// Label value and status surface string
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "Ready",
            Self::Pending => "Pending",
            Self::Blocked => "Blocked",
            Self::NeedLocalUpdate => "NeedLocalUpdate",
            Self::NeedFullUpdate => "NeedFullUpdate",
            Self::NeedRestart => "NeedRestart",
            Self::Updating => "Updating",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync status plus the reason a component is not ready
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ComponentStatus {
    /// Status
    pub sync_status: SyncStatus,
    /// What the component is waiting for
    pub reason: Option<String>,
}

impl ComponentStatus {
    /// Status without a reason
    pub fn simple(sync_status: SyncStatus) -> Self {
        Self {
            sync_status,
            reason: None,
        }
    }

    /// Status waiting on something
    pub fn waiting(sync_status: SyncStatus, reason: impl Into<String>) -> Self {
        Self {
            sync_status,
            reason: Some(reason.into()),
        }
    }

    /// Converged
    pub fn ready() -> Self {
        Self::simple(SyncStatus::Ready)
    }

    /// True when converged
    pub fn is_ready(&self) -> bool {
        self.sync_status == SyncStatus::Ready
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            Some(reason) => write!(f, "{} ({reason})", self.sync_status),
            None => write!(f, "{}", self.sync_status),
        }
    }
}
