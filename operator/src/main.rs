use anyhow::Result;
use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;

mod args;
mod batons;
mod k8s;
mod util;

use args::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    baton_common::init();

    let client = Client::try_default().await?;

    #[cfg(feature = "metrics")]
    {
        let port = args.metrics_port;
        tokio::spawn(async move {
            if let Err(e) = util::metrics::serve(port).await {
                eprintln!("{}", format!("metrics listener failed: {e}").red());
            }
        });
    }
    #[cfg(not(feature = "metrics"))]
    let _ = args.metrics_port;

    batons::reconcile::run(client).await?;
    println!("{}", "Baton controller stopped.".green());
    Ok(())
}
