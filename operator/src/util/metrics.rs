use http_body_util::Full;
use hyper::{Request, Response, body::Bytes, server::conn::http1, service::service_fn};
use hyper_util::rt::TokioIo;
use lazy_static::lazy_static;
use owo_colors::OwoColorize;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};
use std::{convert::Infallible, net::SocketAddr};
use tokio::net::TcpListener;

lazy_static! {
    /// Registry backing the /metrics endpoint.
    pub static ref REGISTRY: Registry = Registry::new();
}

/// Instrumentation shared by the Baton watch and the dispatcher.
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Reconcile invocations per Baton resource.
    pub reconcile_counter: IntCounterVec,
    /// Runner-set synchronisations, labelled by outcome.
    pub sync_counter: IntCounterVec,
    /// Wall time of one runner-set synchronisation.
    pub sync_histogram: HistogramVec,
    /// Number of strategy runners currently managed.
    pub managed_runners: IntGauge,
}

impl ControllerMetrics {
    pub fn new(subsystem: &str) -> Self {
        let reconcile_counter = IntCounterVec::new(
            Opts::new("reconcile_total", "Reconcile invocations per Baton resource")
                .namespace("baton")
                .subsystem(subsystem),
            &["namespace", "name"],
        )
        .expect("create reconcile counter");
        let sync_counter = IntCounterVec::new(
            Opts::new("sync_total", "Runner-set synchronisations")
                .namespace("baton")
                .subsystem(subsystem),
            &["outcome"],
        )
        .expect("create sync counter");
        let sync_histogram = HistogramVec::new(
            HistogramOpts::new("sync_duration_seconds", "Wall time of one synchronisation")
                .namespace("baton")
                .subsystem(subsystem),
            &["outcome"],
        )
        .expect("create sync histogram");
        let managed_runners = IntGauge::with_opts(
            Opts::new("managed_runners", "Strategy runners currently managed")
                .namespace("baton")
                .subsystem(subsystem),
        )
        .expect("create runner gauge");

        REGISTRY
            .register(Box::new(reconcile_counter.clone()))
            .expect("register reconcile counter");
        REGISTRY
            .register(Box::new(sync_counter.clone()))
            .expect("register sync counter");
        REGISTRY
            .register(Box::new(sync_histogram.clone()))
            .expect("register sync histogram");
        REGISTRY
            .register(Box::new(managed_runners.clone()))
            .expect("register runner gauge");

        ControllerMetrics {
            reconcile_counter,
            sync_counter,
            sync_histogram,
            managed_runners,
        }
    }
}

async fn render(_req: Request<hyper::body::Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut buf = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buf) {
        eprintln!("{}", format!("failed to encode metrics: {e}").red());
    }
    Ok(Response::new(Full::new(Bytes::from(buf))))
}

/// Serves the Prometheus text endpoint until the process exits.
pub async fn serve(port: u16) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    println!("{}", format!("📈 Metrics listening on {addr}").green());
    loop {
        let (stream, _) = listener.accept().await?;
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service_fn(render))
                .await
            {
                eprintln!("{}", format!("metrics connection error: {e}").red());
            }
        });
    }
}
