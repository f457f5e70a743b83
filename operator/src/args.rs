use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "baton-operator")]
#[command(about = "Drives per-node-group pod placement quotas for managed deployments")]
pub struct Args {
    /// Port the Prometheus text endpoint listens on
    #[arg(long, env = "METRICS_PORT", default_value_t = 9090)]
    pub metrics_port: u16,
}
