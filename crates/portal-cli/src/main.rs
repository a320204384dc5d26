//! portal-cli - operate the site manifest synchronization from a terminal.

mod retry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use portal_sync::{connect_from_config, maybe_build_scheduler, SyncConfig};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::retry::BackoffPolicy;

#[derive(Debug, Parser)]
#[command(name = "portal-cli")]
#[command(about = "Customer portal manifest synchronization")]
struct Cli {
    /// Serve repositories from `<dir>/<owner>/<repo>/` instead of GitHub.
    #[arg(long, global = true)]
    repo_root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Apply database migrations.
    Migrate,
    /// Validate a site's manifest repository and sync it into the database.
    Validate {
        site_id: i64,
        repo_url: String,
        #[arg(long)]
        admin_user_id: i64,
    },
    /// Print the stored manifest of a site.
    Show {
        site_id: i64,
        #[arg(long)]
        user_id: i64,
    },
    /// Print a page of a site's manifest version history.
    History {
        site_id: i64,
        #[arg(long)]
        user_id: i64,
        #[arg(long, default_value_t = 0)]
        offset: usize,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Reconcile every stored manifest against its repository once.
    Reconcile,
    /// Run the reconciliation on its cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portal=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();
    if cli.repo_root.is_some() {
        config.repo_root = cli.repo_root;
    }

    let (engine, store) = connect_from_config(&config).await?;
    let backoff = BackoffPolicy::default();

    match cli.command {
        Commands::Migrate => {
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Validate {
            site_id,
            repo_url,
            admin_user_id,
        } => {
            let admin = engine.portal_user(admin_user_id).await?;
            let manifest = backoff
                .run(|| engine.validate_or_update_manifest(site_id, &repo_url, &admin))
                .await?;
            println!("{}", serde_json::to_string_pretty(&manifest)?);
        }
        Commands::Show { site_id, user_id } => {
            let user = engine.portal_user(user_id).await?;
            match engine.get_manifest(site_id, &user).await? {
                Some(manifest) => println!("{}", serde_json::to_string_pretty(&manifest)?),
                None => println!("site {site_id} has no manifest"),
            }
        }
        Commands::History {
            site_id,
            user_id,
            offset,
            limit,
        } => {
            let user = engine.portal_user(user_id).await?;
            let page = engine
                .version_history_page(site_id, offset, limit, &user)
                .await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
        }
        Commands::Reconcile => {
            let summary = engine.run_scheduled_reconciliation().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule => {
            let Some(sched) = maybe_build_scheduler(Arc::new(engine), &config).await? else {
                bail!("scheduler disabled; set PORTAL_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.reconcile_cron, "scheduler running");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            let mut sched = sched;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
