use std::sync::Arc;

use optrelay::cli::{Cli, Commands, ConfigAction};
use optrelay::config::{Config, Credentials};
use optrelay::feed::ShioajiFeed;
use optrelay::gateway::GatewayClient;
use optrelay::service::MarketDataService;
use optrelay::{AppResult, init_logging};

#[tokio::main]
async fn main() -> AppResult<()> {
    let cli = Cli::parse_args();
    let config = Config::load_or_default(&cli.config_file);

    init_logging(&cli.effective_log_level(), Some(&config.log.file_path))?;

    tracing::info!("Options market data relay starting...");
    tracing::debug!("CLI arguments: {:?}", cli);

    match cli.command.clone() {
        Commands::Run { simulation } => run_service(config, simulation).await,
        Commands::Check => check_environment(),
        Commands::Config { action } => handle_config(action, &cli.config_file),
    }
}

async fn run_service(mut config: Config, simulation: Option<bool>) -> AppResult<()> {
    if let Some(simulation) = simulation {
        config.simulation = simulation;
    }

    // Missing environment is a deployment problem; exit 1 so the container
    // orchestrator restarts the service once it is fixed.
    let credentials = match Credentials::from_env() {
        Ok(credentials) => credentials,
        Err(e) => {
            tracing::error!("{}", e);
            tracing::error!("Set the variables in the container environment and redeploy");
            std::process::exit(1);
        }
    };

    let (feed, push_rx) = ShioajiFeed::new(config.feed.clone(), config.simulation);
    let gateway = Arc::new(GatewayClient::new(
        credentials.gateway_url.clone(),
        config.gateway.clone(),
    ));
    let service = MarketDataService::new(config, Arc::new(feed), gateway, push_rx);

    if let Err(e) = service.start_with(credentials).await {
        tracing::error!("Fatal startup error: {}", e);
        std::process::exit(1);
    }

    tokio::select! {
        _ = service.run_until_stopped() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
            }
            tracing::info!("Received shutdown signal");
        }
    }

    service.stop().await;
    tracing::info!("Options market data relay stopped");

    Ok(())
}

fn check_environment() -> AppResult<()> {
    match Credentials::from_env() {
        Ok(credentials) => {
            println!("Environment OK");
            println!("  gateway: {}", credentials.gateway_url);
            println!("  certificate: {}", credentials.ca_cert_path);
            Ok(())
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}

fn handle_config(action: Option<ConfigAction>, config_file: &str) -> AppResult<()> {
    match action {
        Some(ConfigAction::Show) => {
            let config = Config::load_or_default(config_file);
            println!("Configuration from: {}", config_file);
            println!(
                "heartbeat_interval_secs = {}",
                config.heartbeat_interval_secs
            );
            println!("snapshot_interval_secs = {}", config.snapshot_interval_secs);
            println!(
                "contract_update_interval_secs = {}",
                config.contract_update_interval_secs
            );
            println!("strike_interval = {}", config.strike_interval);
            println!("window_size = {}", config.window_size);
            println!("option_type = {:?}", config.option_type);
            println!("symbol_prefix = {}", config.symbol_prefix);
            println!("simulation = {}", config.simulation);
            println!("\nFeed configuration:");
            println!("ws_url = {}", config.feed.ws_url);
            println!("rest_url = {}", config.feed.rest_url);
            println!("timeout_seconds = {}", config.feed.timeout_seconds);
            println!("\nGateway configuration:");
            println!("url = {}", config.gateway.url);
            println!("reconnect_initial_ms = {}", config.gateway.reconnect_initial_ms);
            println!("reconnect_max_secs = {}", config.gateway.reconnect_max_secs);
        }
        Some(ConfigAction::Reset) => {
            let default_config = Config::default();
            default_config.save_to_file(config_file)?;
            println!("Configuration reset to defaults and saved to: {}", config_file);
        }
        None => {
            println!("Configuration management");
            println!("Use 'optrelay config show' to view current configuration");
            println!("Use 'optrelay config reset' to restore defaults");
            println!("\nEnvironment variables can override config:");
            println!("  OPTRELAY_WINDOW_SIZE=8");
            println!("  OPTRELAY_SNAPSHOT_INTERVAL_SECS=5");
            println!("  OPTRELAY_LOG_LEVEL=debug");
        }
    }

    Ok(())
}
