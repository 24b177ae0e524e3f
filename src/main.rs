use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use umbral::config::Config;
use umbral::core::{DryConnection, DryRunTransport};
use umbral::probe::{apply_results, describe, Prober};
use umbral::{Connection, ConnOwner, MonotonicClock, PoolRegistry};

#[derive(Parser)]
#[command(name = "umbral")]
#[command(about = "Key routing, backend ejection and pool reload for a memcached/redis proxy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a configuration file and print the pool tree
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Generate an example configuration file
    Config {
        /// Output file path
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Show which backend each key routes to
    Route {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Pool name
        #[arg(short, long)]
        pool: String,
        /// Keys to route
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Connect to every backend and show the resulting live set
    Probe {
        /// Path to configuration file
        #[arg(short, long)]
        config: PathBuf,
        /// Connect timeout per backend
        #[arg(long, default_value_t = 1000)]
        timeout_ms: u64,
    },
    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { config } => validate_config(config),
        Commands::Config { output } => generate_config(output),
        Commands::Route { config, pool, keys } => route_keys(config, &pool, &keys),
        Commands::Probe { config, timeout_ms } => {
            probe_backends(config, Duration::from_millis(timeout_ms)).await
        }
        Commands::Version => {
            show_version();
            Ok(())
        }
    }
}

fn load(config_path: &Path) -> Result<Config> {
    let config = Config::load_from_file(config_path)
        .with_context(|| format!("Failed to load config from {:?}", config_path))?;
    init_logging(&config);
    Ok(config)
}

fn build_registry(config: &Config) -> Result<PoolRegistry<DryConnection>> {
    let registry = PoolRegistry::from_config(config, Arc::new(MonotonicClock::new()))
        .context("Failed to build pools")?;
    Ok(registry)
}

fn validate_config(config_path: PathBuf) -> Result<()> {
    println!("Validating configuration file: {:?}", config_path);

    let config = load(&config_path)?;
    let registry = build_registry(&config)?;

    println!("Configuration file is valid");
    for line in registry.summary() {
        println!("  {}", line);
    }
    Ok(())
}

fn generate_config(output: PathBuf) -> Result<()> {
    println!("Generating configuration file: {:?}", output);

    Config::create_example_config(&output).context("Failed to generate config")?;

    println!("Configuration file generated successfully!");
    println!("Edit the file to match your environment and run:");
    println!("  umbral validate --config {:?}", output);
    Ok(())
}

fn route_keys(config_path: PathBuf, pool_name: &str, keys: &[String]) -> Result<()> {
    let config = load(&config_path)?;
    let mut registry = build_registry(&config)?;
    let mut transport = DryRunTransport::new();

    let pool_idx = match registry.index_of(pool_name) {
        Some(idx) => idx,
        None => bail!("No pool named '{}'", pool_name),
    };

    for key in keys {
        let conn = registry.locate(pool_idx, key.as_bytes(), &mut transport)?;
        let server = match conn.owner() {
            ConnOwner::Server { server, .. } => server,
            other => bail!("Unexpected connection owner {}", other),
        };
        let pool = registry.get(pool_idx).context("pool vanished")?;
        let backend = pool.backend(server).context("backend vanished")?;
        println!(
            "{} -> {} ({}) hash {}",
            key,
            backend.name(),
            backend.config().address(),
            pool.hash_key(key.as_bytes())
        );
    }

    registry.disconnect();
    Ok(())
}

async fn probe_backends(config_path: PathBuf, connect_timeout: Duration) -> Result<()> {
    let config = load(&config_path)?;
    let mut registry = build_registry(&config)?;
    let prober = Prober::new(connect_timeout);

    for pool_config in &config.pools {
        let results = prober.probe_pool(pool_config).await;
        let pool = registry
            .by_name_mut(&pool_config.name)
            .context("pool vanished")?;
        let failures = apply_results(pool, &results);
        pool.rebuild();

        info!(
            "pool '{}': {} of {} servers failed the probe",
            pool.name(),
            failures,
            results.len()
        );

        println!("pool '{}' ({})", pool.name(), pool.config().distribution);
        let total = pool.continuum().len().max(1);
        for (backend, result) in pool.backends().iter().zip(&results) {
            let outcome = describe(result);
            let points = pool.continuum().points_for(backend.idx());
            println!(
                "  {} {} {} {:.1}% of ring ({})",
                backend.name(),
                backend.config().address(),
                backend.status(),
                points as f64 * 100.0 / total as f64,
                outcome
            );
        }
    }

    registry.log_summary("probe: ");
    Ok(())
}

fn show_version() {
    println!("umbral v{}", env!("CARGO_PKG_VERSION"));
    println!("Key routing core for memcached/redis proxies");
    println!();
    println!("Target: {}", std::env::consts::ARCH);
    println!();
    println!("Features:");
    println!("  • ketama, modula and random key distribution");
    println!("  • Automatic backend ejection with timed readmission");
    println!("  • Pool replacement without dropping connected clients");
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.logging.format == "compact" {
        builder.compact().try_init()
    } else {
        builder.try_init()
    };

    if result.is_ok() {
        info!("Logging initialized at level: {}", config.logging.level);
    }
}
