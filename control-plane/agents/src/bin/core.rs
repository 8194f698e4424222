//! The core agent: runs the reconciler control loop against the persistent
//! store, the cloud and the display gateway.

use labpool_agents::core::{reconciler::ReconcilerLoop, registry::Registry};
use labpool_common::{
    cloud::mock::MockCloud,
    config::OrchestratorConfig,
    gateway::client::GatewayClient,
    store::etcd::Etcd,
};
use std::{sync::Arc, time::Duration};
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "core", about = "LabPool core agent")]
struct CliArgs {
    /// The Persistent Store URL to connect to
    #[structopt(long, short, default_value = "http://localhost:2379")]
    store: String,

    /// The period at which the reconcile loop runs
    #[structopt(long, default_value = "60s")]
    reconcile_period: humantime::Duration,

    /// Timeout for normal gateway operations
    #[structopt(long, default_value = "10s")]
    gateway_timeout: humantime::Duration,

    /// Timeout for gateway liveness probes and cleanup
    #[structopt(long, default_value = "3s")]
    gateway_probe_timeout: humantime::Duration,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli_args = CliArgs::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!(?cli_args, "Starting core agent");

    let config = Arc::new(OrchestratorConfig::from_env()?);
    let store = Etcd::new(&cli_args.store).await?;

    let gateway = Arc::new(GatewayClient::new(
        &config.gateway_api_url,
        &config.gateway_public_url,
        &config.gateway_admin_user,
        &config.gateway_admin_pass,
        cli_args.gateway_timeout.into(),
    )?);
    let gateway_probe = Arc::new(GatewayClient::new(
        &config.gateway_api_url,
        &config.gateway_public_url,
        &config.gateway_admin_user,
        &config.gateway_admin_pass,
        cli_args.gateway_probe_timeout.into(),
    )?);

    // local deployments run against the in-process cloud double; the
    // provider adapter is wired here once it exists
    let cloud = Arc::new(seeded_mock_cloud(&config));

    let registry = Registry::new(store, cloud, gateway, gateway_probe, config);
    let period: Duration = cli_args.reconcile_period.into();
    ReconcilerLoop::new(&registry, period).run().await;
    Ok(())
}

fn seeded_mock_cloud(config: &OrchestratorConfig) -> MockCloud {
    let mut cloud = MockCloud::new();
    for tier in config.deployed_tiers() {
        cloud = cloud.with_group(&tier.group_name, 0, 2, 0);
    }
    tracing::warn!("Using the in-process mock cloud; workstation state is not persisted");
    cloud
}
