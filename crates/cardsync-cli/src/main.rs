mod telemetry;

use std::sync::Arc;

use anyhow::{bail, Result};
use cardsync_core::OperationId;
use cardsync_sync::{
    CatalogSyncRequest, HarvestRequest, MatchRequest, MatchType, OperationOutcome, PgStore, Pipeline, SyncConfig,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "cardsync")]
#[command(about = "Card pricing harvest and catalog reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Pull every card and price of one set from the pricing upstream.
    Harvest {
        #[arg(long)]
        game: String,
        #[arg(long)]
        set: String,
        #[arg(long)]
        page_size: Option<u64>,
        #[arg(long)]
        order_by: Option<String>,
        #[arg(long)]
        order: Option<String>,
    },
    /// Stage one game's catalog groups and products.
    SyncCatalog {
        #[arg(long)]
        game: String,
        #[arg(long)]
        category: Option<i64>,
        #[arg(long)]
        wipe: bool,
        /// Read the CSV exports instead of the JSON endpoints.
        #[arg(long)]
        csv: bool,
    },
    /// Reconcile harvested sets and cards against the staged catalog.
    Match {
        #[arg(long)]
        game: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        only_unmapped: bool,
        #[arg(long = "type", default_value = "both")]
        match_type: MatchType,
    },
    /// Show sync log entries, newest first.
    Logs {
        #[arg(long)]
        operation_id: Option<OperationId>,
        #[arg(long)]
        limit: Option<usize>,
    },
    Migrate,
    Serve,
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    let store = PgStore::connect(&config.database_url, 5).await?;
    store.migrate().await?;
    Ok(store)
}

async fn pipeline_from_env() -> Result<Pipeline> {
    let config = SyncConfig::from_env();
    let store = connect(&config).await?;
    Pipeline::from_config(config, Arc::new(store))
}

fn report<T: Serialize>(outcome: &OperationOutcome<T>) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(outcome)?);
    if !outcome.success {
        bail!(
            "operation {} failed with status {}: {}",
            outcome.operation_id,
            outcome.status,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing(telemetry::DEFAULT_FILTER)?;
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Harvest {
            game,
            set,
            page_size,
            order_by,
            order,
        } => {
            let pipeline = pipeline_from_env().await?;
            let outcome = pipeline
                .harvest_full_set(HarvestRequest {
                    game_id: game,
                    set_id: set,
                    page_size,
                    order_by,
                    order,
                })
                .await;
            report(&outcome)?;
        }
        Commands::SyncCatalog {
            game,
            category,
            wipe,
            csv,
        } => {
            let pipeline = pipeline_from_env().await?;
            let outcome = pipeline
                .sync_catalog_for_game(CatalogSyncRequest {
                    game_id: game,
                    category_id: category,
                    wipe_before: wipe,
                    background: false,
                    use_csv: csv,
                })
                .await;
            report(&outcome)?;
        }
        Commands::Match {
            game,
            dry_run,
            only_unmapped,
            match_type,
        } => {
            let pipeline = pipeline_from_env().await?;
            let outcome = pipeline
                .run_match(MatchRequest {
                    game_id: game,
                    dry_run,
                    only_unmapped,
                    match_type,
                })
                .await;
            report(&outcome)?;
        }
        Commands::Logs { operation_id, limit } => {
            let pipeline = pipeline_from_env().await?;
            report(&pipeline.query_sync_logs(operation_id, limit).await)?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            connect(&config).await?;
            info!("database is up to date");
        }
        Commands::Serve => cardsync_web::serve_from_env().await?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn match_flags_parse_into_a_request() {
        let cli = Cli::try_parse_from(["cardsync", "match", "--game", "pokemon", "--dry-run", "--type", "groups"]).unwrap();
        match cli.command {
            Some(Commands::Match {
                game,
                dry_run,
                only_unmapped,
                match_type,
            }) => {
                assert_eq!(game, "pokemon");
                assert!(dry_run);
                assert!(!only_unmapped);
                assert_eq!(match_type, MatchType::Groups);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_match_type_is_rejected() {
        assert!(Cli::try_parse_from(["cardsync", "match", "--game", "pokemon", "--type", "all"]).is_err());
    }

    #[test]
    fn logs_require_a_valid_operation_id() {
        assert!(Cli::try_parse_from(["cardsync", "logs", "--operation-id", "nope"]).is_err());
        let cli = Cli::try_parse_from([
            "cardsync",
            "logs",
            "--operation-id",
            "6a1f3c2e-7d4b-4b8e-9f21-0c5d8e7a9b10",
            "--limit",
            "5",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Commands::Logs { operation_id: Some(_), limit: Some(5) })));
    }

    #[test]
    fn sync_catalog_flags() {
        let cli = Cli::try_parse_from(["cardsync", "sync-catalog", "--game", "mtg", "--category", "1", "--wipe", "--csv"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::SyncCatalog { category: Some(1), wipe: true, csv: true, .. })
        ));
    }
}
