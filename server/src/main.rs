mod config;
mod http;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result, anyhow};
use axum::http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
use clap::{Args, Parser, Subcommand};
use platform_authn::BearerIdentity;
use platform_authz::{AllowedQuery, PermissionsClient};
use platform_obs::{ObsConfig, init_tracing};
use tracing::info;

use crate::{
    config::{AppConfig, SERVICE_NAME},
    http::AppState,
};

#[derive(Parser, Debug)]
#[command(
    name = "permissions-demo",
    version,
    about = "Items service that delegates authorization to the permissions service"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the items HTTP service.
    Serve(ServeCommand),
    /// Ask the permissions service whether a caller may act on resources.
    Check(CheckCommand),
}

#[derive(Args, Debug)]
struct ServeCommand {
    #[arg(long, help = "Overrides BIND")]
    bind: Option<SocketAddr>,
}

#[derive(Args, Debug)]
struct CheckCommand {
    #[arg(long = "resource", required = true, value_name = "URL")]
    resources: Vec<String>,
    #[arg(long)]
    action: Option<String>,
    #[arg(long)]
    property: Option<String>,
    #[arg(long, env = "BEARER_TOKEN", help = "JWT identifying the caller")]
    token: Option<String>,
    #[arg(long)]
    with_scopes: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _obs = init_tracing(ObsConfig::from_env(SERVICE_NAME))?;
    let cli = Cli::parse();
    let config = Arc::new(AppConfig::load()?);
    match cli.command {
        Command::Serve(cmd) => run_server(cmd, config).await,
        Command::Check(cmd) => run_check(cmd, &config).await,
    }
}

fn permissions_client(config: &AppConfig) -> Result<PermissionsClient> {
    let client = PermissionsClient::from_settings(config.permissions.clone(), None)
        .context("set PERMISSIONS_SERVICE_URL to reach the permissions service")?;
    Ok(client.with_identity(Arc::new(BearerIdentity::new(config.identity.clone()))))
}

async fn run_server(cmd: ServeCommand, config: Arc<AppConfig>) -> Result<()> {
    let client = permissions_client(&config)?;
    let addr = cmd.bind.unwrap_or(config.bind);
    info!(
        permissions = ?config.permissions.base_url.as_ref().map(|url| url.as_str()),
        component = %config.permissions.component,
        "permissions client configured"
    );
    http::serve(addr, AppState::new(config, client)).await
}

async fn run_check(cmd: CheckCommand, config: &AppConfig) -> Result<()> {
    let client = permissions_client(config)?;
    let mut headers = HeaderMap::new();
    if let Some(token) = cmd.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .context("token is not a valid header value")?;
        headers.insert(AUTHORIZATION, value);
    }

    let mut query = AllowedQuery::for_resources(cmd.resources);
    query.action = cmd.action;
    query.property = cmd.property;
    query.with_scopes = cmd.with_scopes;

    let decision = client
        .with_allowed(&headers, &query)
        .await
        .map_err(|err| anyhow!("permission check failed ({}): {err}", err.code()))?;
    info!(allowed = decision.is_allowed(), "decision received");
    println!("{}", serde_json::to_string_pretty(decision.body())?);
    Ok(())
}
