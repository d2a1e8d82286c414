use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lead_enrichment::config::Config;
use lead_enrichment::models::CandidateRecord;
use lead_enrichment::providers::{PlaceSearchQuery, ProviderSet};
use lead_enrichment::DiscoveryOrchestrator;

const USAGE: &str = "usage: lead-enrichment <candidates.json> | lead-enrichment search <query>";

/// Batch runner.
///
/// - `lead-enrichment <candidates.json>` enriches a JSON array of candidates.
/// - `lead-enrichment search "<query>"` searches places first, then enriches.
///
/// The run summary is printed to stdout as JSON; logs go to stderr.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lead_enrichment=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env()?;
    let providers = ProviderSet::from_config(&config)?;
    let orchestrator = DiscoveryOrchestrator::new(providers, config.run.clone());

    let args: Vec<String> = std::env::args().skip(1).collect();
    let summary = match args.as_slice() {
        [command, query @ ..] if command == "search" && !query.is_empty() => {
            let text = query.join(" ");
            orchestrator.discover(PlaceSearchQuery { text }).await?
        }
        [path] => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading {}", path))?;
            let candidates: Vec<CandidateRecord> =
                serde_json::from_str(&raw).with_context(|| format!("parsing {}", path))?;
            tracing::info!("Loaded {} candidates from {}", candidates.len(), path);
            orchestrator.run(candidates).await
        }
        _ => anyhow::bail!(USAGE),
    };

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
