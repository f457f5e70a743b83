use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::Client;
use std::collections::BTreeMap;

use baton_types::{Strategy, total_keep_pods};

use crate::k8s;
use crate::util::Error;

/// Nodes whose labels are a superset of the strategy's selector.
pub async fn match_nodes(client: Client, strategy: &Strategy) -> Result<Vec<Node>, Error> {
    k8s::list_nodes_by_labels(client, &strategy.node_selector).await
}

/// Matched nodes across all strategies, concatenated in strategy order.
pub async fn strategies_match_nodes(
    client: Client,
    strategies: &[Strategy],
) -> Result<Vec<Node>, Error> {
    let mut nodes = Vec::new();
    for strategy in strategies {
        nodes.extend(match_nodes(client.clone(), strategy).await?);
    }
    Ok(nodes)
}

/// Labels the deployment selects its pods with.
pub fn template_labels(deployment: &Deployment) -> BTreeMap<String, String> {
    deployment
        .spec
        .as_ref()
        .and_then(|s| s.template.metadata.as_ref())
        .and_then(|m| m.labels.clone())
        .unwrap_or_default()
}

pub fn pod_phase(pod: &Pod) -> &str {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default()
}

fn scheduled_on(pod: &Pod, nodes: &[Node]) -> bool {
    let node_name = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .unwrap_or_default();
    !node_name.is_empty()
        && nodes
            .iter()
            .any(|n| n.metadata.name.as_deref() == Some(node_name))
}

/// Pods scheduled on one of the given nodes, preserving list order.
pub fn pods_on_nodes(pods: &[Pod], nodes: &[Node]) -> Vec<Pod> {
    pods.iter()
        .filter(|p| scheduled_on(p, nodes))
        .cloned()
        .collect()
}

/// Running pods scheduled on one of the given nodes, preserving list order.
pub fn running_pods_on_nodes(pods: &[Pod], nodes: &[Node]) -> Vec<Pod> {
    pods.iter()
        .filter(|p| pod_phase(p) == "Running" && scheduled_on(p, nodes))
        .cloned()
        .collect()
}

/// Pods of the deployment currently scheduled onto the strategy's nodes, in
/// the order the API returned them.
pub async fn scheduled_pods(
    client: Client,
    strategy: &Strategy,
    deployment: &Deployment,
) -> Result<Vec<Pod>, Error> {
    let nodes = match_nodes(client.clone(), strategy).await?;
    let namespace = deployment_namespace(deployment)?;
    let pods =
        k8s::list_pods_by_labels(client, namespace, &template_labels(deployment)).await?;
    Ok(pods_on_nodes(&pods, &nodes))
}

/// Scheduled pods across all strategies, concatenated in strategy order.
pub async fn strategies_scheduled_pods(
    client: Client,
    strategies: &[Strategy],
    deployment: &Deployment,
) -> Result<Vec<Pod>, Error> {
    let mut pods = Vec::new();
    for strategy in strategies {
        pods.extend(scheduled_pods(client.clone(), strategy, deployment).await?);
    }
    Ok(pods)
}

pub fn deployment_namespace(deployment: &Deployment) -> Result<&str, Error> {
    deployment
        .metadata
        .namespace
        .as_deref()
        .ok_or_else(|| Error::UserInput("Deployment is missing metadata.namespace".to_string()))
}

pub fn deployment_name(deployment: &Deployment) -> Result<&str, Error> {
    deployment
        .metadata
        .name
        .as_deref()
        .ok_or_else(|| Error::UserInput("Deployment is missing metadata.name".to_string()))
}

/// The first pod that is not Running on a node some strategy matches.
/// Strategies are expected to partition the eligible node set, so a hit
/// means the spec and the cluster disagree.
pub fn find_stray_pod(pods: &[Pod], nodes: &[Node]) -> Option<String> {
    pods.iter()
        .find(|p| !(pod_phase(p) == "Running" && scheduled_on(p, nodes)))
        .map(|p| p.metadata.name.clone().unwrap_or_default())
}

/// The replica count to retry with when the strategies keep more pods than
/// the deployment currently runs.
pub fn bumped_replicas(total_keep: u32) -> i32 {
    total_keep as i32 + 1
}

/// Checks the strategy set against the cluster before a tick mutates
/// anything. Every pod of the deployment must be Running on a node some
/// strategy matches; and the deployment must run at least as many pods as
/// the strategies keep in total, otherwise replicas are raised to
/// `total + 1` and the tick is asked to start over.
pub async fn validate(
    client: Client,
    deployment: &Deployment,
    strategies: &[Strategy],
) -> Result<(), Error> {
    let namespace = deployment_namespace(deployment)?;
    let pods =
        k8s::list_pods_by_labels(client.clone(), namespace, &template_labels(deployment)).await?;
    let nodes = strategies_match_nodes(client.clone(), strategies).await?;

    let running = running_pods_on_nodes(&pods, &nodes);
    if running.len() != pods.len() {
        let stray = find_stray_pod(&pods, &nodes).unwrap_or_default();
        return Err(Error::StrayPod { pod: stray });
    }

    let total = total_keep_pods(strategies);
    if total as usize > running.len() {
        let name = deployment_name(deployment)?;
        let mut bumped = deployment.clone();
        let spec = bumped
            .spec
            .as_mut()
            .ok_or_else(|| Error::UserInput("Deployment has no spec".to_string()))?;
        spec.replicas = Some(bumped_replicas(total));
        k8s::update_deployment(client, &bumped)
            .await
            .map_err(|e| match e {
                Error::Kube { source } => Error::ReplicaUpdateFailed {
                    deployment: name.to_string(),
                    source,
                },
                other => other,
            })?;
        return Err(Error::InsufficientReplicas {
            deployment: name.to_string(),
            required: total,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pod(name: &str, node_name: &str, phase: &str) -> Pod {
        use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
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

    #[test]
    fn pods_follow_their_node_assignment() {
        let nodes = vec![node("a1"), node("a2")];
        let pods = vec![
            pod("p1", "a1", "Running"),
            pod("p2", "b1", "Running"),
            pod("p3", "a2", "Pending"),
            pod("p4", "", "Pending"),
        ];
        let on = pods_on_nodes(&pods, &nodes);
        let names: Vec<_> = on.iter().filter_map(|p| p.metadata.name.as_deref()).collect();
        assert_eq!(names, vec!["p1", "p3"]);
    }

    #[test]
    fn running_filter_drops_pending_pods() {
        let nodes = vec![node("a1"), node("a2")];
        let pods = vec![
            pod("p1", "a1", "Running"),
            pod("p3", "a2", "Pending"),
        ];
        let running = running_pods_on_nodes(&pods, &nodes);
        let names: Vec<_> = running
            .iter()
            .filter_map(|p| p.metadata.name.as_deref())
            .collect();
        assert_eq!(names, vec!["p1"]);
    }

    #[test]
    fn list_order_is_preserved() {
        let nodes = vec![node("a1")];
        let pods = vec![
            pod("p3", "a1", "Running"),
            pod("p1", "a1", "Running"),
            pod("p2", "a1", "Running"),
        ];
        let names: Vec<_> = pods_on_nodes(&pods, &nodes)
            .iter()
            .filter_map(|p| p.metadata.name.clone())
            .collect();
        assert_eq!(names, vec!["p3", "p1", "p2"]);
    }

    #[test]
    fn a_pod_off_every_strategy_node_is_stray() {
        let nodes = vec![node("a1"), node("b1")];
        let pods = vec![
            pod("p1", "a1", "Running"),
            pod("p2", "c1", "Running"),
            pod("p3", "b1", "Running"),
        ];
        assert_eq!(find_stray_pod(&pods, &nodes), Some("p2".to_string()));
    }

    #[test]
    fn a_non_running_pod_counts_as_stray() {
        let nodes = vec![node("a1")];
        let pods = vec![pod("p1", "a1", "Pending")];
        assert_eq!(find_stray_pod(&pods, &nodes), Some("p1".to_string()));
    }

    #[test]
    fn no_stray_when_everything_runs_on_strategy_nodes() {
        let nodes = vec![node("a1"), node("b1")];
        let pods = vec![pod("p1", "a1", "Running"), pod("p2", "b1", "Running")];
        assert_eq!(find_stray_pod(&pods, &nodes), None);
    }

    #[test]
    fn replica_bump_leaves_one_pod_of_slack() {
        // A deployment with one replica but two strategies keeping one pod
        // each retries with three replicas.
        assert_eq!(bumped_replicas(2), 3);
        assert_eq!(bumped_replicas(0), 1);
    }

    #[test]
    fn template_labels_come_from_the_pod_template() {
        use k8s_openapi::api::apps::v1::DeploymentSpec;
        use k8s_openapi::api::core::v1::PodTemplateSpec;
        let deployment = Deployment {
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(
                            [("app".to_string(), "web".to_string())].into_iter().collect(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(
            template_labels(&deployment),
            [("app".to_string(), "web".to_string())].into_iter().collect()
        );
        assert!(template_labels(&Deployment::default()).is_empty());
    }
}
