use futures::stream::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    Api, Client, ResourceExt,
    runtime::{Controller, controller::Action},
};
use kube_leader_election::{LeaseLock, LeaseLockParams, LeaseLockResult};
use owo_colors::OwoColorize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

use baton_types::Baton;

use super::manager::RunnerManager;
use crate::util::{Error, PROBE_INTERVAL};

#[cfg(feature = "metrics")]
use crate::util::metrics::ControllerMetrics;

/// Entrypoint for the Baton controller.
pub async fn run(client: Client) -> Result<(), Error> {
    println!("{}", "⚙️ Starting Baton controller...".green());

    #[cfg(feature = "metrics")]
    let metrics = ControllerMetrics::new("operator");

    // Namespace where leader election runs. This keeps the Lease RBAC
    // namespaced even though the controller itself watches cluster-wide.
    let lease_namespace = std::env::var("NAMESPACE").unwrap_or_else(|_| "default".to_string());
    // Unique identity per replica (Downward API POD_NAME is ideal).
    // Fallback to hostname if not present.
    let holder_id = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("baton-operator-{}", uuid::Uuid::new_v4()));
    let lease_name = "baton-operator-lock".to_string();
    // TTL: how long leadership is considered valid without renewal.
    // Renew should happen well before TTL expires.
    let lease_ttl = Duration::from_secs(15);
    let renew_every = Duration::from_secs(5);
    let leadership = LeaseLock::new(
        client.clone(),
        &lease_namespace,
        LeaseLockParams {
            holder_id,
            lease_name,
            lease_ttl,
        },
    );

    let shutdown = CancellationToken::new();
    let shutdown_signal = shutdown.clone();
    tokio::spawn(async move {
        baton_common::shutdown::shutdown_signal().await;
        shutdown_signal.cancel();
    });
    baton_common::signal_ready();

    // Only the leader runs the dispatcher; on leadership loss the whole
    // session is torn down, runners included, and we go back to standby.
    let mut session: Option<DispatchSession> = None;
    let mut tick = tokio::time::interval(renew_every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some(session) = session.take() {
                    session.teardown().await;
                }
                break Ok(());
            }
            _ = tick.tick() => {}
        }
        let lease = match leadership.try_acquire_or_renew().await {
            Ok(l) => l,
            Err(e) => {
                // If we can't talk to the apiserver / update the Lease,
                // assume we are not safe to lead.
                eprintln!("leader election renew/acquire failed: {e}");
                if let Some(session) = session.take() {
                    session.teardown().await;
                    eprintln!("stopped dispatcher due to leader election error");
                }
                continue;
            }
        };
        if matches!(lease, LeaseLockResult::Acquired(_)) {
            if session.is_none() {
                println!("{}", "👑 Acquired leadership; starting dispatcher".green());
                session = Some(DispatchSession::start(
                    client.clone(),
                    #[cfg(feature = "metrics")]
                    metrics.clone(),
                ));
            }
        } else if let Some(session) = session.take() {
            eprintln!("lost leadership; stopping dispatcher");
            session.teardown().await;
        }
    }
}

/// One leadership term: the watch task nudging the wake channel, and the
/// dispatcher task owning the runner map.
struct DispatchSession {
    cancel: CancellationToken,
    watch: tokio::task::JoinHandle<()>,
    dispatcher: tokio::task::JoinHandle<()>,
}

impl DispatchSession {
    fn start(client: Client, #[cfg(feature = "metrics")] metrics: ControllerMetrics) -> Self {
        let cancel = CancellationToken::new();
        let (wake_tx, wake_rx) = mpsc::channel::<()>(1);

        let watch = tokio::spawn(watch_batons(
            client.clone(),
            wake_tx,
            #[cfg(feature = "metrics")]
            metrics.clone(),
        ));
        let dispatcher = tokio::spawn(dispatch_loop(
            client,
            wake_rx,
            cancel.clone(),
            #[cfg(feature = "metrics")]
            metrics,
        ));

        DispatchSession {
            cancel,
            watch,
            dispatcher,
        }
    }

    /// Aborts the watch, then lets the dispatcher stop its runners before
    /// joining it.
    async fn teardown(self) {
        self.watch.abort();
        self.watch.await.ok();
        self.cancel.cancel();
        self.dispatcher.await.ok();
    }
}

/// Context injected into each `reconcile` and `on_error` invocation.
struct ContextData {
    wake: mpsc::Sender<()>,

    #[cfg(feature = "metrics")]
    metrics: ControllerMetrics,
}

async fn watch_batons(
    client: Client,
    wake: mpsc::Sender<()>,
    #[cfg(feature = "metrics")] metrics: ControllerMetrics,
) {
    let context = Arc::new(ContextData {
        wake,
        #[cfg(feature = "metrics")]
        metrics,
    });
    let batons: Api<Baton> = Api::all(client.clone());
    println!("{}", "🚀 Baton watch started.".green());
    Controller::new(batons, Default::default())
        .owns(Api::<Deployment>::all(client), Default::default())
        .run(reconcile, on_error, context)
        .for_each(|_res| async move {})
        .await;
}

/// Reconciliation function for the Baton resource. All bookkeeping lives
/// in the dispatcher task; this only nudges it awake.
async fn reconcile(baton: Arc<Baton>, context: Arc<ContextData>) -> Result<Action, Error> {
    #[cfg(feature = "metrics")]
    context
        .metrics
        .reconcile_counter
        .with_label_values(&[&baton.namespace().unwrap_or_default(), &baton.name_any()])
        .inc();

    // A full channel already carries a pending wake-up.
    let _ = context.wake.try_send(());
    Ok(Action::requeue(PROBE_INTERVAL))
}

/// Prints the error and requeues the resource for another reconciliation
/// after five seconds.
fn on_error(baton: Arc<Baton>, error: &Error, _context: Arc<ContextData>) -> Action {
    eprintln!(
        "{}",
        format!("Reconciliation error: {:?} {:?}", error, baton).red()
    );
    Action::requeue(Duration::from_secs(5))
}

/// Single owner of the `RunnerManager`. Wakes on controller events, lists
/// the Baton resources, and converges the runner set: add unmanaged,
/// recycle changed, reap removed.
async fn dispatch_loop(
    client: Client,
    mut wake: mpsc::Receiver<()>,
    cancel: CancellationToken,
    #[cfg(feature = "metrics")] metrics: ControllerMetrics,
) {
    let mut manager = RunnerManager::new(client.clone());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = wake.recv() => {
                if received.is_none() {
                    break;
                }
                #[cfg(feature = "metrics")]
                let timer = std::time::Instant::now();
                let outcome = match sync_runners(&client, &mut manager).await {
                    Ok(()) => "ok",
                    Err(e) => {
                        eprintln!("{}", format!("failed to sync strategy runners: {e}").red());
                        "error"
                    }
                };
                #[cfg(feature = "metrics")]
                {
                    metrics.sync_counter.with_label_values(&[outcome]).inc();
                    metrics
                        .sync_histogram
                        .with_label_values(&[outcome])
                        .observe(timer.elapsed().as_secs_f64());
                    metrics.managed_runners.set(manager.len() as i64);
                }
                #[cfg(not(feature = "metrics"))]
                let _ = outcome;
            }
        }
    }
    manager.shutdown().await;
}

async fn sync_runners(client: &Client, manager: &mut RunnerManager) -> Result<(), Error> {
    let api: Api<Baton> = Api::all(client.clone());
    let batons = api.list(&Default::default()).await?.items;
    for baton in &batons {
        if !manager.is_managed(baton) {
            manager.add(baton);
            continue;
        }
        if manager.is_spec_changed(baton) {
            // Full recycle: the old runner finishes its current step and
            // acknowledges before the replacement starts.
            manager.delete(baton).await;
            manager.add(baton);
        }
    }
    manager.reap_missing(&batons).await;
    Ok(())
}
