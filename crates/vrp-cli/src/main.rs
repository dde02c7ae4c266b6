use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use vrp_core::{ListingRequest, Schema, TableDefinition};
use vrp_sync::{CollectorConfig, InvocationContext, SourceKind};

#[derive(Debug, Parser)]
#[command(name = "vrp-cli")]
#[command(about = "Collects rising and hot post snapshots from Reddit communities")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one collection job, the same way a scheduled invocation does.
    Collect {
        /// JSON event payload to hand to the invocation handler.
        #[arg(long)]
        event: Option<PathBuf>,
    },
    /// Fetch and shape one listing, printing rows as JSON without writing them.
    Fetch {
        community: String,
        #[arg(long, default_value = "hot")]
        kind: String,
        #[arg(long, default_value_t = 3)]
        count: u32,
        #[arg(long)]
        time_filter: Option<String>,
        /// Serve listings from a fixture directory instead of the live API.
        #[arg(long)]
        fixtures: Option<PathBuf>,
    },
    /// Print the record schema and table key layout.
    Schema,
}

#[tokio::main]
async fn main() -> Result<()> {
    let mut filter = EnvFilter::from_default_env();
    for target in ["vrp_core", "vrp_storage", "vrp_adapters", "vrp_sync", "vrp_cli"] {
        filter = filter.add_directive(format!("{target}=info").parse()?);
    }
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Collect { event: None }) {
        Commands::Collect { event } => {
            let event = match event {
                Some(path) => {
                    let text = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("reading {}", path.display()))?;
                    serde_json::from_str(&text)
                        .with_context(|| format!("parsing {}", path.display()))?
                }
                None => serde_json::json!({}),
            };
            let status = vrp_sync::handle_invocation(event, InvocationContext::default()).await?;
            println!("collection complete: status={status}");
        }
        Commands::Fetch {
            community,
            kind,
            count,
            time_filter,
            fixtures,
        } => {
            let request = ListingRequest::parse(&kind, count, time_filter.as_deref())?;
            let mut config = CollectorConfig::from_env()?;
            if let Some(dir) = fixtures {
                config.source = SourceKind::Fixtures(dir);
            }
            let source = vrp_sync::build_source(&config).await?;
            let rows = vrp_adapters::fetch_and_shape(source.as_ref(), &community, &request)
                .await
                .with_context(|| format!("fetching {kind} listing for {community}"))?;
            let rows = vrp_sync::deduplicate_latest(rows);
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }
        Commands::Schema => {
            let layout = serde_json::json!({
                "fields": Schema::post_snapshot().fields(),
                "table": TableDefinition::post_snapshot(),
            });
            println!("{}", serde_json::to_string_pretty(&layout)?);
        }
    }

    Ok(())
}
