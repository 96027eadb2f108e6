mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    // LOG_FORMAT=json for log shippers, human-readable otherwise
    if std::env::var("LOG_FORMAT").map(|v| v.eq_ignore_ascii_case("json")).unwrap_or(false) {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config_info = credit_ledger::Config::from_env()?;
    let config = config_info.config;
    tracing::info!("Loaded {} profile", config_info.profile.as_str());

    match cli.command.unwrap_or(Commands::Worker) {
        Commands::Worker => cli::handle_worker(&config).await,
        Commands::Maintenance => cli::handle_maintenance(&config).await,
        Commands::Migrate => cli::handle_db_migrate(&config).await,
        Commands::Config => {
            cli::handle_config_validate(&config, config_info.profile.as_str(), &config_info.overrides)
        }
    }
}
