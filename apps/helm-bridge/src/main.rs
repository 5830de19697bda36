use clap::Parser;
use tracing::error;

use helm_bridge::config::BridgeConfig;
use helm_bridge::{bridge, telemetry};

#[derive(Parser, Debug)]
#[command(
    name = "helm-bridge",
    about = "Bridge a local Home Assistant hub to the helm cloud",
    version
)]
struct Cli {
    /// Tracing filter, e.g. `info` or `helm_bridge=debug`
    #[arg(long, env = "LOG_FILTER", default_value = "info,helm_bridge=debug")]
    log_filter: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    let config = match BridgeConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid configuration");
            eprintln!("❌ {err}");
            std::process::exit(1);
        }
    };

    if let Err(err) = bridge::run(config).await {
        error!(error = %err, "bridge terminated");
        eprintln!("❌ {err}");
        std::process::exit(1);
    }
}
