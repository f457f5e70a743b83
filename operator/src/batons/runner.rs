use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Node, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use k8s_openapi::jiff::Timestamp;
use kube::Client;
use owo_colors::OwoColorize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use baton_types::{Baton, BatonSpec, BatonStatus, Strategy};

use super::{monitor, strategy};
use crate::k8s::{self, cordon};
use crate::util::{
    Error, POD_TEMPLATE_HASH,
    colors::{FG1, FG2},
    patch::patch_status,
};

/// Periodic control loop for one managed workload. `spawn` is non-blocking;
/// `stop` cancels the loop and waits until the task has acknowledged, after
/// which no further mutation is issued.
pub struct StrategyRunner {
    baton: Baton,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl StrategyRunner {
    pub fn spawn(client: Client, baton: Baton) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(client, baton.clone(), cancel.clone()));
        StrategyRunner {
            baton,
            cancel,
            handle,
        }
    }

    /// The spec snapshot the runner was started with.
    pub fn spec(&self) -> &BatonSpec {
        &self.baton.spec
    }

    /// Sends the stop signal and blocks until the loop has observed it.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            eprintln!(
                "{}",
                format!("strategy runner task ended abnormally: {e}").red()
            );
        }
    }
}

async fn run_loop(client: Client, baton: Baton, cancel: CancellationToken) {
    let workload = format!(
        "{}/{}",
        baton.spec.workload.namespace, baton.spec.workload.name
    );
    let interval = Duration::from_secs(u64::from(baton.spec.interval_sec));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match run_strategies(&client, &baton, &cancel).await {
            Ok(()) => {}
            Err(Error::RestartTick) => {
                println!(
                    "🪄 {}{}",
                    workload.color(FG2),
                    " scaled out, restarting strategies on the next tick".color(FG1)
                );
            }
            Err(Error::Stopped) => return,
            Err(e) => {
                eprintln!("{}", format!("strategies for {workload} failed: {e}").red());
            }
        }
    }
}

/// One tick: validate, then the three passes in strict order. Any error
/// aborts the remainder; the next tick starts from scratch.
async fn run_strategies(
    client: &Client,
    baton: &Baton,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let spec = &baton.spec;
    let timeout = Duration::from_secs(u64::from(spec.monitor_timeout_sec));

    stamp_status(client, baton, |status| {
        status.last_run_started_at = Some(Time::from(Timestamp::now()));
    })
    .await;

    let deployment = k8s::get_deployment(
        client.clone(),
        &spec.workload.namespace,
        &spec.workload.name,
    )
    .await?;
    strategy::validate(client.clone(), &deployment, &spec.strategies).await?;

    scale_out_to_satisfy(client, &deployment, &spec.strategies, timeout, cancel).await?;
    migrate_surplus_out(client, &deployment, &spec.strategies, timeout, cancel).await?;
    migrate_shortage_in(client, &deployment, &spec.strategies, timeout, cancel).await?;

    stamp_status(client, baton, |status| {
        status.last_successful_run_at = Some(Time::from(Timestamp::now()));
    })
    .await;
    Ok(())
}

/// Status writes are advisory; a failure never aborts the tick.
async fn stamp_status(client: &Client, baton: &Baton, f: impl FnOnce(&mut BatonStatus)) {
    if let Err(e) = patch_status(client.clone(), baton, f).await {
        eprintln!("{}", format!("failed to update Baton status: {e}").yellow());
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), Error> {
    if cancel.is_cancelled() {
        Err(Error::Stopped)
    } else {
        Ok(())
    }
}

/// First pass: for every strategy short of its target, cordon everything
/// the other strategies match so the scheduler has nowhere else to go, grow
/// the deployment by one pod, and wait for it to land. The whole tick then
/// restarts so later passes see the new placement.
async fn scale_out_to_satisfy(
    client: &Client,
    deployment: &Deployment,
    strategies: &[Strategy],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let namespace = strategy::deployment_namespace(deployment)?;
    for (idx, strat) in strategies.iter().enumerate() {
        if strat.keep_pods() == 0 {
            continue;
        }
        ensure_active(cancel)?;
        let nodes = strategy::match_nodes(client.clone(), strat).await?;
        let pods = k8s::list_pods_by_labels(
            client.clone(),
            namespace,
            &strategy::template_labels(deployment),
        )
        .await?;
        if strategy::running_pods_on_nodes(&pods, &nodes).len() as u32 >= strat.keep_pods() {
            continue;
        }

        let steering =
            strategy::strategies_match_nodes(client.clone(), &other_strategies(strategies, idx))
                .await?;
        let cordoned = cordon_nodes(client, &steering).await;
        let result = grow_by_one(client, deployment, timeout, cancel).await;
        uncordon_nodes(client, &cordoned).await;
        result?;
        return Err(Error::RestartTick);
    }
    Ok(())
}

/// Everything but the strategy at `idx`, in declaration order.
fn other_strategies(strategies: &[Strategy], idx: usize) -> Vec<Strategy> {
    strategies
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != idx)
        .map(|(_, s)| s.clone())
        .collect()
}

async fn grow_by_one(
    client: &Client,
    deployment: &Deployment,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let namespace = strategy::deployment_namespace(deployment)?;
    let name = strategy::deployment_name(deployment)?;
    let pods = k8s::list_pods_by_labels(
        client.clone(),
        namespace,
        &strategy::template_labels(deployment),
    )
    .await?;
    let snapshot = monitor::snapshot_names(&pods);

    let mut grown = deployment.clone();
    let spec = grown
        .spec
        .as_mut()
        .ok_or_else(|| Error::UserInput("Deployment has no spec".to_string()))?;
    spec.replicas = Some(spec.replicas.unwrap_or(0) + 1);
    k8s::update_deployment(client.clone(), &grown)
        .await
        .map_err(|e| match e {
            Error::Kube { source } => Error::ReplicaUpdateFailed {
                deployment: name.to_string(),
                source,
            },
            other => other,
        })?;
    monitor::wait_until_ready(client.clone(), deployment, None, &snapshot, timeout, cancel).await
}

/// Second pass: shed pods above the target, strategy by strategy. The
/// strategy's own nodes stay cordoned for the whole sweep so replacements
/// cannot land back on them.
async fn migrate_surplus_out(
    client: &Client,
    deployment: &Deployment,
    strategies: &[Strategy],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    for strat in strategies {
        ensure_active(cancel)?;
        let pods = strategy::scheduled_pods(client.clone(), strat, deployment).await?;
        if !strat.is_surplus(&pods) {
            continue;
        }
        let nodes = strategy::match_nodes(client.clone(), strat).await?;
        let cordoned = cordon_nodes(client, &nodes).await;
        let result = relocate_pods(
            client,
            deployment,
            surplus_victims(&pods, strat.keep_pods()),
            timeout,
            cancel,
        )
        .await;
        uncordon_nodes(client, &cordoned).await;
        result?;
    }
    Ok(())
}

/// Third pass: fill strategies below their target by evicting donor pods
/// while every donor node is cordoned, leaving the scheduler only the
/// shorted group to place replacements on. Donors are the surplus
/// strategies, recounted freshly, plus the unconstrained ones.
async fn migrate_shortage_in(
    client: &Client,
    deployment: &Deployment,
    strategies: &[Strategy],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    for strat in strategies {
        ensure_active(cancel)?;
        let pods = strategy::scheduled_pods(client.clone(), strat, deployment).await?;
        if !strat.is_shortage(&pods) {
            continue;
        }

        let mut donors = Vec::new();
        for candidate in strategies {
            if candidate.keep_pods() == 0 {
                donors.push(candidate.clone());
                continue;
            }
            let candidate_pods =
                strategy::scheduled_pods(client.clone(), candidate, deployment).await?;
            if candidate.is_surplus(&candidate_pods) {
                donors.push(candidate.clone());
            }
        }

        let donor_nodes = strategy::strategies_match_nodes(client.clone(), &donors).await?;
        let cordoned = cordon_nodes(client, &donor_nodes).await;
        let victims =
            strategy::strategies_scheduled_pods(client.clone(), &donors, deployment).await;
        let result = match &victims {
            Ok(victims) => {
                relocate_pods(
                    client,
                    deployment,
                    shortage_victims(victims, strat.keep_pods()),
                    timeout,
                    cancel,
                )
                .await
            }
            Err(_) => Ok(()),
        };
        uncordon_nodes(client, &cordoned).await;
        victims?;
        result?;
    }
    Ok(())
}

/// The pods beyond the target, in the order the API returned them.
fn surplus_victims(pods: &[Pod], keep: u32) -> &[Pod] {
    let keep = (keep as usize).min(pods.len());
    &pods[keep..]
}

/// The first `keep` donor pods, preserving donor order. The count follows
/// the shorted strategy's full target rather than its shortfall.
fn shortage_victims(victims: &[Pod], keep: u32) -> &[Pod] {
    let keep = (keep as usize).min(victims.len());
    &victims[..keep]
}

/// Deletes each victim in turn and waits for its replacement before moving
/// on. The template-hash filter keeps the monitor blind to pods of older
/// revisions; the snapshot is taken immediately before each delete.
async fn relocate_pods(
    client: &Client,
    deployment: &Deployment,
    victims: &[Pod],
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<(), Error> {
    let namespace = strategy::deployment_namespace(deployment)?;
    let labels = strategy::template_labels(deployment);
    for pod in victims {
        ensure_active(cancel)?;
        let hash = pod
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(POD_TEMPLATE_HASH))
            .cloned();
        let pods = k8s::list_pods_by_labels(client.clone(), namespace, &labels).await?;
        let snapshot = monitor::snapshot_names(&pods);
        k8s::delete_pod(client.clone(), pod).await?;
        monitor::wait_until_ready(
            client.clone(),
            deployment,
            hash.as_deref(),
            &snapshot,
            timeout,
            cancel,
        )
        .await?;
    }
    Ok(())
}

/// Cordons every node in the slice, best-effort, and returns the names to
/// uncordon afterwards. A failed cordon is logged and the sweep continues
/// with the remaining nodes.
async fn cordon_nodes(client: &Client, nodes: &[Node]) -> Vec<String> {
    let mut cordoned = Vec::new();
    for node in nodes {
        let Some(name) = node.metadata.name.clone() else {
            continue;
        };
        match cordon::set_unschedulable(client.clone(), node.clone(), true).await {
            Ok(()) => cordoned.push(name),
            Err(e) => eprintln!("{}", format!("failed to cordon node {name}: {e}").red()),
        }
    }
    cordoned
}

/// Releases a pass's cordon set. Each node is re-fetched so the patch is
/// built against the current resource version. Failures are logged; the
/// node stays cordoned until a later tick passes over it again.
async fn uncordon_nodes(client: &Client, names: &[String]) {
    for name in names {
        let node = match k8s::get_node(client.clone(), name).await {
            Ok(node) => node,
            Err(e) => {
                eprintln!(
                    "{}",
                    format!("failed to re-fetch node {name} for uncordon: {e}").red()
                );
                continue;
            }
        };
        if let Err(e) = cordon::set_unschedulable(client.clone(), node, false).await {
            eprintln!("{}", format!("failed to uncordon node {name}: {e}").red());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn names(pods: &[Pod]) -> Vec<&str> {
        pods.iter().filter_map(|p| p.metadata.name.as_deref()).collect()
    }

    fn strategy(zone: &str, keep: Option<u32>) -> Strategy {
        Strategy {
            node_selector: BTreeMap::from([("zone".to_string(), zone.to_string())]),
            keep_pods: keep,
        }
    }

    #[test]
    fn surplus_victims_are_the_tail_in_list_order() {
        let pods = vec![pod("p1"), pod("p2"), pod("p3"), pod("p4")];
        assert_eq!(names(surplus_victims(&pods, 2)), vec!["p3", "p4"]);
    }

    #[test]
    fn no_surplus_victims_at_or_below_target() {
        let pods = vec![pod("p1"), pod("p2")];
        assert!(surplus_victims(&pods, 2).is_empty());
        assert!(surplus_victims(&pods, 5).is_empty());
    }

    #[test]
    fn shortage_victims_are_the_head_in_donor_order() {
        let pods = vec![pod("d1"), pod("d2"), pod("d3")];
        assert_eq!(names(shortage_victims(&pods, 2)), vec!["d1", "d2"]);
        assert_eq!(names(shortage_victims(&pods, 5)), vec!["d1", "d2", "d3"]);
    }

    #[test]
    fn other_strategies_excludes_only_the_current_one() {
        let strategies = vec![
            strategy("a", Some(2)),
            strategy("b", Some(1)),
            strategy("c", None),
        ];
        let others = other_strategies(&strategies, 1);
        assert_eq!(others.len(), 2);
        assert!(others[0].same_selector(&strategies[0]));
        assert!(others[1].same_selector(&strategies[2]));
    }
}
