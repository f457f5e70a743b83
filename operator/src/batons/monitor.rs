use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::Client;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::strategy::{deployment_namespace, pod_phase, template_labels};
use crate::k8s;
use crate::util::{Error, MONITOR_POLL_INTERVAL, POD_TEMPLATE_HASH};

/// Outcome of inspecting one poll's worth of pods against the snapshot.
#[derive(Debug, PartialEq)]
pub enum Observation {
    /// No new pods yet, or a new pod is still unscheduled or Unknown.
    Wait,
    /// Every new pod is scheduled and past launch.
    Ready,
    /// A new pod reached the Failed phase.
    Failed(String),
}

/// Takes the name snapshot used as the "before" side of the new-pod diff.
pub fn snapshot_names(pods: &[Pod]) -> HashSet<String> {
    pods.iter().filter_map(|p| p.metadata.name.clone()).collect()
}

/// Classifies the pods that appeared since the snapshot was taken.
pub fn observe_new_pods(pods: &[Pod], snapshot: &HashSet<String>) -> Observation {
    let new: Vec<&Pod> = pods
        .iter()
        .filter(|p| p.metadata.name.as_ref().is_some_and(|n| !snapshot.contains(n)))
        .collect();
    if new.is_empty() {
        return Observation::Wait;
    }
    for pod in &new {
        match pod_phase(pod) {
            "Failed" => {
                return Observation::Failed(pod.metadata.name.clone().unwrap_or_default());
            }
            "Unknown" => return Observation::Wait,
            _ => {}
        }
        let scheduled = pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.as_deref())
            .is_some_and(|n| !n.is_empty());
        if !scheduled {
            return Observation::Wait;
        }
    }
    Observation::Ready
}

/// Blocks until every pod that appeared since `snapshot` has been assigned a
/// node and left launch, polling every 15 seconds up to `timeout`. A `hash`
/// narrows the listing to one template revision via the pod-template-hash
/// label, keeping the monitor blind to pods of other revisions. The
/// cancellation token pre-empts the sleep between polls.
pub async fn wait_until_ready(
    client: Client,
    deployment: &Deployment,
    hash: Option<&str>,
    snapshot: &HashSet<String>,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let namespace = deployment_namespace(deployment)?;
    let labels = template_labels(deployment);
    let deadline = Instant::now() + timeout;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Stopped),
            _ = tokio::time::sleep(MONITOR_POLL_INTERVAL) => {}
        }
        let mut pods = k8s::list_pods_by_labels(client.clone(), namespace, &labels).await?;
        if let Some(hash) = hash {
            pods.retain(|p| {
                p.metadata
                    .labels
                    .as_ref()
                    .and_then(|l| l.get(POD_TEMPLATE_HASH))
                    .map(String::as_str)
                    == Some(hash)
            });
        }
        match observe_new_pods(&pods, snapshot) {
            Observation::Ready => return Ok(()),
            Observation::Failed(pod) => return Err(Error::LaunchFailed { pod }),
            Observation::Wait => {}
        }
        if Instant::now() >= deadline {
            return Err(Error::MonitorTimeout {
                timeout_sec: timeout.as_secs() as u32,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use kube::api::ObjectMeta;

    fn pod(name: &str, node_name: &str, phase: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: (!node_name.is_empty()).then(|| node_name.to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn snapshot(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn waits_while_no_new_pod_has_appeared() {
        let pods = vec![pod("p1", "a1", "Running")];
        assert_eq!(observe_new_pods(&pods, &snapshot(&["p1"])), Observation::Wait);
    }

    #[test]
    fn waits_while_a_new_pod_is_unscheduled() {
        let pods = vec![pod("p1", "a1", "Running"), pod("p2", "", "Pending")];
        assert_eq!(observe_new_pods(&pods, &snapshot(&["p1"])), Observation::Wait);
    }

    #[test]
    fn waits_while_a_new_pod_is_unknown() {
        let pods = vec![pod("p2", "a1", "Unknown")];
        assert_eq!(observe_new_pods(&pods, &snapshot(&[])), Observation::Wait);
    }

    #[test]
    fn ready_once_every_new_pod_is_scheduled() {
        let pods = vec![
            pod("p1", "a1", "Running"),
            pod("p2", "b1", "Pending"),
            pod("p3", "b2", "Running"),
        ];
        assert_eq!(
            observe_new_pods(&pods, &snapshot(&["p1"])),
            Observation::Ready
        );
    }

    #[test]
    fn a_failed_launch_is_fatal() {
        let pods = vec![pod("p2", "b1", "Failed")];
        assert_eq!(
            observe_new_pods(&pods, &snapshot(&[])),
            Observation::Failed("p2".to_string())
        );
    }

    #[test]
    fn snapshot_collects_pod_names() {
        let pods = vec![pod("p1", "a1", "Running"), pod("p2", "", "Pending")];
        assert_eq!(snapshot_names(&pods), snapshot(&["p1", "p2"]));
    }
}
