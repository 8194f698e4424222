mod v0;

use actix_web::{web, App, HttpServer};
use labpool_agents::core::{registry::Registry, session::service::SessionService};
use labpool_common::{
    cloud::mock::MockCloud,
    config::OrchestratorConfig,
    gateway::client::GatewayClient,
    store::etcd::Etcd,
};
use std::sync::Arc;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(name = "rest", about = "LabPool REST server")]
pub(crate) struct CliArgs {
    /// The bind address for the REST server
    #[structopt(long, default_value = "0.0.0.0:8080")]
    bind: String,

    /// The Persistent Store URL to connect to
    #[structopt(long, short, default_value = "http://localhost:2379")]
    store: String,

    /// Timeout for normal gateway operations
    #[structopt(long, default_value = "10s")]
    gateway_timeout: humantime::Duration,

    /// Timeout for gateway liveness probes and cleanup
    #[structopt(long, default_value = "3s")]
    gateway_probe_timeout: humantime::Duration,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::from_args();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!(?cli_args, "Starting REST server");

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
    let service = web::Data::new(SessionService::new(registry));

    let bind = cli_args.bind.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(service.clone())
            .configure(v0::configure::<Etcd>)
    })
    .bind(bind)?
    .run()
    .await?;
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
