use anyhow::Result;
use clap::{Parser, Subcommand};
use guide_catalog::{run_ingestion, GuideConfig, IngestReport};
use guide_core::ViewerProfile;
use guide_recommend::recommend;
use guide_scrape::ListingScraper;
use guide_store::{CatalogStore, MemoryStore};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "guide-cli")]
#[command(about = "MyGuide event pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape the configured listing and reconcile it into the catalog.
    Ingest,
    /// Ingest, then rank upcoming events for a throwaway viewer profile
    /// built from the given interest names.
    Recommend {
        #[arg(long = "interest")]
        interests: Vec<String>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

async fn ingest(config: &GuideConfig, store: &MemoryStore) -> Result<IngestReport> {
    let scraper = ListingScraper::new(config.listing_url.clone(), config.fetch_config())?;
    let report = run_ingestion(&scraper, store, &config.categories).await?;
    Ok(report)
}

/// The store is in-memory, so a recommendation run registers its viewer
/// in the same process right after ingesting.
fn register_viewer(store: &MemoryStore, interests: &[String]) -> Result<Uuid> {
    let viewer_id = store.in_transaction(|state| {
        let mut viewer = ViewerProfile::new("guide-cli");
        for name in interests {
            if let Some(interest) = state.interest_by_name(name) {
                viewer.interest_ids.insert(interest.id);
            } else {
                eprintln!("warning: no catalog interest named {name:?}");
            }
        }
        let viewer_id = viewer.id;
        state.put_viewer(viewer);
        Ok(viewer_id)
    })?;
    Ok(viewer_id)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GuideConfig::from_env()?;
    let store = MemoryStore::default();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let report = ingest(&config, &store).await?;
            println!(
                "ingest complete: created={} updated={} skipped={} hard_deleted={}",
                report.created, report.updated, report.skipped, report.hard_deleted
            );
        }
        Commands::Recommend { interests, limit } => {
            ingest(&config, &store).await?;
            let viewer_id = register_viewer(&store, &interests)?;
            let now = chrono::Local::now().naive_local();
            let ranked = recommend(&store, viewer_id, now, limit)?;
            if ranked.is_empty() {
                println!("no upcoming events match those interests");
                return Ok(());
            }
            let snapshot = store.snapshot()?;
            for (rank, event_id) in ranked.iter().enumerate() {
                if let Some(event) = snapshot.events.get(event_id) {
                    match event.soonest_showtime_after(now) {
                        Some(starts_at) => {
                            println!("{:>2}. {} ({starts_at})", rank + 1, event.title)
                        }
                        None => println!("{:>2}. {}", rank + 1, event.title),
                    }
                }
            }
        }
    }

    Ok(())
}
