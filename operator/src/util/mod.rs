use std::time::Duration;

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod patch;

pub(crate) mod colors;

mod error;

pub use error::*;

/// Requeue cadence for the Baton watch when nothing changes.
pub(crate) const PROBE_INTERVAL: Duration = Duration::from_secs(30);

/// Poll cadence of the pod readiness monitor.
pub(crate) const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "baton-operator";

/// Label the deployment controller stamps on pods of one template revision.
pub(crate) const POD_TEMPLATE_HASH: &str = "pod-template-hash";
