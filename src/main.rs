//! customer360: build and print customer profiles from a fixtures file.
//!
//! Usage: `customer360 [--config PATH] [--fixtures PATH] [--force] [--prefetch] EMAIL...`
//!
//! Each EMAIL is resolved through the profile service and printed as JSON,
//! followed by cache statistics and per-source latency. Logs go to stderr
//! (`RUST_LOG` overrides the default `info` filter).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;

use customer360_lib::error::ProfileErrorPayload;
use customer360_lib::sources::memory::{Fixtures, MemoryBackend};
use customer360_lib::sources::Sources;
use customer360_lib::state::{load_config, AppState};

#[derive(Debug, Parser)]
#[command(name = "customer360")]
#[command(about = "Build customer profiles from every configured source", long_about = None)]
#[command(version)]
struct Args {
    /// Config file (defaults to ~/.customer360/config.json)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fixtures JSON backing the in-memory sources (overrides fixturesPath)
    #[arg(long)]
    fixtures: Option<PathBuf>,

    /// Skip the cache and aggregate every profile now
    #[arg(long)]
    force: bool,

    /// Warm the cache in batches before serving
    #[arg(long)]
    prefetch: bool,

    /// Customer email addresses
    #[arg(required = true, value_name = "EMAIL")]
    identities: Vec<String>,
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref()).map_err(anyhow::Error::msg)?;

    let fixtures_path = args
        .fixtures
        .clone()
        .or_else(|| config.fixtures_path.as_ref().map(PathBuf::from));
    let fixtures = match fixtures_path {
        Some(path) => Fixtures::load(&path)
            .with_context(|| format!("Failed to load fixtures from {}", path.display()))?,
        None => {
            log::warn!("No fixtures configured; every source starts empty");
            Fixtures::default()
        }
    };

    let backend = Arc::new(MemoryBackend::new(fixtures));
    let state = AppState::new(config, Sources::from_backend(backend));
    let profiles = &state.profiles;

    if args.prefetch {
        let report = profiles.prefetch(&args.identities).await;
        print_json(&report)?;
    }

    let mut failures = 0;
    for identity in &args.identities {
        match profiles.get_profile(identity, args.force).await {
            Ok(response) => print_json(&response)?,
            Err(e) => {
                failures += 1;
                print_json(&ProfileErrorPayload::from(&e))?;
            }
        }
    }

    profiles.wait_for_refreshes().await;
    print_json(&profiles.cache_stats())?;
    print_json(&profiles.source_latency())?;

    if failures == args.identities.len() {
        bail!("No profile could be built");
    }
    Ok(())
}
