use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use bay_cli::backend::{KasaBackend, SimulatedBackend};
use bay_cli::commands::{devices, export, run, stats};
use bay_cli::{Cli, Commands, Config};
use bay_kasa::{KasaAccount, KasaClient};
use clap::Parser;
use tokio::io::BufReader;
use tracing_subscriber::EnvFilter;

/// Load config and open database, ensuring the parent directory exists.
fn open_database(config_path: Option<&Path>) -> Result<(bay_db::Database, Config)> {
    let config = Config::load_from(config_path).context("failed to load configuration")?;
    tracing::debug!(?config, "loaded configuration");

    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = bay_db::Database::open(&config.database_path).context("failed to open database")?;
    Ok((db, config))
}

fn kasa_backend(config: &Config) -> Result<KasaBackend> {
    let (Some(username), Some(password)) = (&config.kasa_username, &config.kasa_password) else {
        anyhow::bail!(
            "Kasa credentials missing: set kasa_username and kasa_password, or use --simulate N"
        );
    };
    let client = KasaClient::new(username, password).context("invalid Kasa configuration")?;
    Ok(KasaBackend::new(KasaAccount::new(client)))
}

fn run_engine(config: &Config, db: &mut bay_db::Database, simulate: Option<usize>) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    let result = rt.block_on(async {
        let input = BufReader::new(tokio::io::stdin());
        let mut stdout = std::io::stdout();
        match simulate {
            Some(count) => {
                let backend = Arc::new(SimulatedBackend::new(count));
                run::run(config, backend, db, input, &mut stdout).await
            }
            None => {
                let backend = Arc::new(kasa_backend(config)?);
                run::run(config, backend, db, input, &mut stdout).await
            }
        }
    });

    // A blocking stdin read cannot be cancelled, so don't wait for it
    rt.shutdown_background();
    result
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing with verbose flag support
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };
    // Use try_init to avoid panic if tracing is already initialized (e.g., in tests)
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();

    let mut stdout = std::io::stdout();
    match &cli.command {
        Some(Commands::Run { simulate }) => {
            let (mut db, config) = open_database(cli.config.as_deref())?;
            run_engine(&config, &mut db, *simulate)?;
        }
        Some(Commands::Stats { device, json }) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            stats::run(&mut stdout, &db, device.as_deref(), *json)?;
        }
        Some(Commands::Export) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            export::run(&mut stdout, &db)?;
        }
        Some(Commands::Devices) => {
            let (db, _config) = open_database(cli.config.as_deref())?;
            devices::run(&mut stdout, &db)?;
        }
        None => {
            // No subcommand, show help
            use clap::CommandFactory;
            Cli::command().print_help()?;
            println!();
        }
    }

    Ok(())
}
