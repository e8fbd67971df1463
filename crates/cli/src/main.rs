//! Administrative CLI for Strata.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::path::Path;
use strata_core::config::{AppConfig, MetadataConfig};
use strata_metadata::{MetadataStore, gc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "stratactl")]
#[command(about = "Administrative CLI for the Strata metadata store")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "STRATA_CONFIG",
        default_value = "config/strata.toml"
    )]
    config: String,

    /// Database connection string (`sqlite=<path>` or `postgres=<url>`),
    /// overriding the configured metadata store
    #[arg(long, env = "STRATA_DATABASE")]
    database: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the schema and seed the provider registry
    Migrate,
    /// Delete objects no content references anymore
    Gc {
        /// Candidates examined per batch (overrides config)
        #[arg(long)]
        batch_size: Option<u32>,
        /// Stop after this many batches (overrides config, 0 = no limit)
        #[arg(long)]
        max_batches: Option<u64>,
    },
    /// Print row counts per entity
    Stats {
        /// Emit JSON instead of a table
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// List the storage provider registry
    Providers {
        /// Register an additional provider ID address first
        #[arg(long)]
        add: Vec<String>,
    },
}

/// Load configuration from the optional file, `STRATA_` environment
/// variables and the `--database` override, in increasing precedence.
fn load_config(config_path: &str, database: Option<&str>) -> Result<AppConfig> {
    let mut figment = Figment::new();
    if Path::new(config_path).exists() {
        tracing::debug!(config_path, "Loading configuration from file");
        figment = figment.merge(Toml::file(config_path));
    } else {
        tracing::debug!("No config file found at {}", config_path);
    }

    let mut config: AppConfig = figment
        .merge(
            Env::prefixed("STRATA_")
                .ignore(&["CONFIG", "DATABASE"])
                .split("__"),
        )
        .extract()
        .context("failed to load configuration")?;

    if let Some(dsn) = database {
        config.metadata = MetadataConfig::from_dsn(dsn).context("invalid --database value")?;
    }

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli.config, cli.database.as_deref())?;
    let store = strata_metadata::from_config(&config.metadata)
        .await
        .context("failed to open metadata store")?;

    match cli.command {
        Commands::Migrate => {
            store.health_check().await?;
            println!("Schema is up to date.");
            println!("{} storage providers registered.", store.count_providers().await?);
        }
        Commands::Gc {
            batch_size,
            max_batches,
        } => {
            let mut gc_config = config.gc.clone();
            if let Some(batch_size) = batch_size {
                gc_config.batch_size = batch_size;
            }
            if let Some(max_batches) = max_batches {
                gc_config.max_batches = max_batches;
            }
            gc_config
                .validate()
                .map_err(|e| anyhow::anyhow!("invalid gc settings: {e}"))?;

            let stats = gc::sweep_unreferenced_objects(store.as_ref(), &gc_config)
                .await
                .context("garbage collection failed")?;
            println!(
                "Examined {} objects in {} batches, deleted {}.",
                stats.items_processed, stats.batches, stats.items_deleted
            );
        }
        Commands::Stats { json } => print_stats(store.as_ref(), json).await?,
        Commands::Providers { add } => {
            for address in &add {
                let row = store
                    .add_provider(address)
                    .await
                    .with_context(|| format!("failed to add provider {address}"))?;
                tracing::info!(address = %row.address, id = row.id, "provider registered");
            }

            let providers = store.list_providers().await?;
            println!("{:<8} {:<16} Added", "ID", "Address");
            for provider in providers {
                println!(
                    "{:<8} {:<16} {}",
                    provider.id, provider.address, provider.created_at
                );
            }
        }
    }

    Ok(())
}

async fn print_stats(store: &dyn MetadataStore, json: bool) -> Result<()> {
    let stats = store.stats().await.context("failed to read stats")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("{:<18} Count", "Entity");
    for (name, count) in [
        ("users", stats.users),
        ("contents", stats.contents),
        ("active contents", stats.active_contents),
        ("objects", stats.objects),
        ("object refs", stats.obj_refs),
        ("deals", stats.deals),
        ("collections", stats.collections),
        ("providers", stats.providers),
    ] {
        println!("{:<18} {}", name, count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::path::PathBuf;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_gc_overrides() {
        let cli = Cli::try_parse_from([
            "stratactl",
            "--database",
            "sqlite=/tmp/s.db",
            "gc",
            "--batch-size",
            "10",
        ])
        .unwrap();
        assert_eq!(cli.database.as_deref(), Some("sqlite=/tmp/s.db"));
        match cli.command {
            Commands::Gc {
                batch_size,
                max_batches,
            } => {
                assert_eq!(batch_size, Some(10));
                assert_eq!(max_batches, None);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn load_config_reads_file_and_database_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strata.toml");
        std::fs::write(
            &path,
            r#"
            [metadata]
            type = "sqlite"
            path = "/var/lib/strata/meta.db"

            [gc]
            batch_size = 25
            "#,
        )
        .unwrap();
        let path = path.to_str().unwrap();

        let config = load_config(path, None).unwrap();
        assert_eq!(config.gc.batch_size, 25);
        match &config.metadata {
            MetadataConfig::Sqlite { path, .. } => {
                assert_eq!(path, &PathBuf::from("/var/lib/strata/meta.db"));
            }
            other => panic!("unexpected metadata config: {other:?}"),
        }

        let config = load_config(path, Some("postgres=postgres://db/strata")).unwrap();
        assert!(matches!(
            config.metadata,
            MetadataConfig::Postgres { url: Some(ref url), .. } if url == "postgres://db/strata"
        ));

        let err = load_config(path, Some("mysql=whatever")).unwrap_err();
        assert!(format!("{err:#}").contains("unsupported or unrecognized db type"));
    }

    #[test]
    fn load_config_without_file_uses_defaults() {
        let config = load_config("/nonexistent/strata.toml", None).unwrap();
        assert_eq!(config.gc.batch_size, 500);
        assert!(matches!(config.metadata, MetadataConfig::Sqlite { .. }));
    }
}
