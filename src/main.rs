use hostnet_core::app::HostNetCore;
use hostnet_core::config::Config;
use hostnet_core::switch_state::SwitchState;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "hostnet_core=info".parse().unwrap()),
        )
        .init();

    if let Err(e) = run().await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> hostnet_core::error::Result<()> {
    info!("starting hostnet-core");

    let config = Config::default();

    // A standalone binary has no switch-state producer of its own; this
    // core is meant to be embedded in an agent that owns the real RIB and
    // feeds it updates via `HostNetCore::state()`. Running it bare is
    // useful for smoke-testing the kernel-facing plumbing in isolation.
    let core = HostNetCore::new(SwitchState::default()).await?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let shutdown = tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = cancel_tx.send(true);
    });

    let result = core.run(config, cancel_rx).await;
    shutdown.abort();
    result
}
