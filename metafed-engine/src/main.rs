//! metafed - command-line front end for the metadata federation engine
//!
//! Loads the TOML configuration, registers the configured sources (catalog
//! files and, optionally, MusicBrainz) and runs one verb, printing each
//! resulting media item as a JSON line on stdout. Ctrl+C cancels the running
//! operation; the cancellation terminal is still printed.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use metafed_common::config::{load_config, TomlConfig};
use metafed_engine::net::WebClient;
use metafed_engine::sources::{CatalogSource, MusicBrainzSource};
use metafed_engine::{
    BrowseItem, Engine, Media, OperationId, OperationStream, Options, ResolutionFlags, Source,
    SourceRef,
};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Command-line arguments for metafed
#[derive(Parser, Debug)]
#[command(name = "metafed")]
#[command(about = "Federated media metadata lookup")]
#[command(version, long_version = env!("METAFED_LONG_VERSION"))]
struct Args {
    /// Config file (overrides METAFED_CONFIG and the per-user config)
    #[arg(short, long, env = "METAFED_CONFIG")]
    config: Option<PathBuf>,

    /// Comma-separated metadata keys to request
    #[arg(short, long, global = true, default_value = "title,artist,album,duration")]
    keys: String,

    /// Number of results (stream verbs)
    #[arg(long, global = true)]
    count: Option<u32>,

    /// Results to skip (stream verbs)
    #[arg(long, global = true, default_value = "0")]
    skip: u32,

    /// Let every registered source contribute keys
    #[arg(long, global = true)]
    full: bool,

    /// Skip keys that sources mark as slow
    #[arg(long, global = true)]
    fast_only: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve keys for a media item of a source
    Resolve {
        /// Source id
        #[arg(short, long)]
        source: String,
        /// Media id within the source
        id: String,
    },
    /// Search one source, or every searchable source when none is given
    Search {
        #[arg(short, long)]
        source: Option<String>,
        text: Option<String>,
    },
    /// Browse a container of a source (its root without an id)
    Browse {
        #[arg(short, long)]
        source: String,
        container: Option<String>,
    },
    /// Run a source-specific query
    Query {
        #[arg(short, long)]
        source: String,
        query: String,
    },
    /// Create media from a URI
    Uri { uri: String },
    /// List registered sources
    Sources,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config)?;

    info!(
        "Starting metafed v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let engine = Engine::new(&config.engine);
    register_sources(&engine, &config)?;

    let keys = engine
        .keys()
        .parse_list(&args.keys)
        .context("Invalid --keys list")?;
    let mut flags = ResolutionFlags::empty();
    if args.full {
        flags |= ResolutionFlags::FULL;
    }
    if args.fast_only {
        flags |= ResolutionFlags::FAST_ONLY;
    }
    let mut options = Options::new().with_skip(args.skip).with_flags(flags);
    if let Some(count) = args.count {
        options = options.with_count(count);
    }

    match args.command {
        Command::Sources => {
            for source in engine.registry().sources() {
                let rank = engine.registry().rank(source.id()).unwrap_or_default();
                println!("{}\t{}\t{}", source.id(), rank, source.name());
            }
            Ok(())
        }
        Command::Resolve { source, id } => {
            let source = lookup(&engine, &source)?;
            let media = Media::from_source(source.id(), id);
            let handle = engine.resolve(Some(&source), media, &keys, options);
            let id = handle.id();
            let result = with_cancel(&engine, id, handle.wait()).await;
            let media = result.and_then(|resolved| resolved.into_result())?;
            print_media(&engine, &media);
            Ok(())
        }
        Command::Uri { uri } => {
            let handle = engine.media_from_uri(&uri, &keys, options);
            let id = handle.id();
            let result = with_cancel(&engine, id, handle.wait()).await;
            let media = result.and_then(|resolved| resolved.into_result())?;
            print_media(&engine, &media);
            Ok(())
        }
        Command::Search { source, text } => {
            let stream = match source {
                Some(source) => {
                    let source = lookup(&engine, &source)?;
                    engine.search(&source, text.as_deref(), &keys, options)
                }
                None => engine.multiple_search(None, text.as_deref(), &keys, options),
            };
            print_stream(&engine, stream).await
        }
        Command::Browse { source, container } => {
            let source = lookup(&engine, &source)?;
            let container = container.map(|id| Media::from_source(source.id(), id));
            let stream = engine.browse(&source, container, &keys, options);
            print_stream(&engine, stream).await
        }
        Command::Query { source, query } => {
            let source = lookup(&engine, &source)?;
            let stream = engine.query(&source, &query, &keys, options);
            print_stream(&engine, stream).await
        }
    }
}

/// Console logging, plus a file layer when `logging.file` is set
///
/// `RUST_LOG` overrides `logging.level`.
fn init_tracing(config: &TomlConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("metafed_engine={0},metafed_common={0}", config.logging.level)));

    let file_layer = match &config.logging.file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}

fn register_sources(engine: &Engine, config: &TomlConfig) -> Result<()> {
    for path in &config.catalogs {
        let catalog = CatalogSource::load(path, engine.keys())
            .with_context(|| format!("Failed to load catalog {}", path.display()))?;
        let rank = catalog.rank();
        info!(source = catalog.name(), entries = catalog.len(), rank, "Catalog registered");
        engine.register_source(Arc::new(catalog), rank)?;
    }

    if config.musicbrainz {
        let client = WebClient::new(&config.net).context("Failed to build HTTP client")?;
        engine.register_source(Arc::new(MusicBrainzSource::new(Arc::new(client))), 0)?;
        info!("MusicBrainz source registered");
    }

    if engine.registry().is_empty() {
        warn!("No sources configured");
    }
    Ok(())
}

fn lookup(engine: &Engine, id: &str) -> Result<SourceRef> {
    match engine.registry().lookup(id) {
        Some(source) => Ok(source),
        None => bail!("Unknown source '{}'", id),
    }
}

/// Await `work`, cancelling operation `id` on Ctrl+C
///
/// After a cancel the operation still delivers its own terminal result,
/// so `work` is always driven to completion.
async fn with_cancel<T>(
    engine: &Engine,
    id: OperationId,
    work: impl std::future::Future<Output = T>,
) -> T {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => return result,
        _ = signal::ctrl_c() => {
            info!(operation_id = id, "Received Ctrl+C, cancelling");
            engine.cancel(id);
        }
    }
    work.await
}

fn print_media(engine: &Engine, media: &Media) {
    println!("{}", media.to_json(engine.keys()));
}

async fn print_stream(engine: &Engine, mut stream: OperationStream) -> Result<()> {
    let id = stream.id();
    let mut cancelled = false;

    loop {
        let item: Option<BrowseItem> = if cancelled {
            stream.next().await
        } else {
            tokio::select! {
                item = stream.next() => item,
                _ = signal::ctrl_c() => {
                    info!(operation_id = id, "Received Ctrl+C, cancelling");
                    engine.cancel(id);
                    cancelled = true;
                    continue;
                }
            }
        };

        let Some(item) = item else {
            return Ok(());
        };
        if let Some(media) = &item.media {
            print_media(engine, media);
        }
        if let Some(error) = item.error {
            return Err(error.into());
        }
        if item.is_last() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_long_version_carries_build_info() {
        let command = Args::command();
        let long_version = command.get_long_version().unwrap();
        assert!(long_version.starts_with(env!("CARGO_PKG_VERSION")));
        assert!(long_version.contains(env!("GIT_HASH")));
        assert!(long_version.contains(env!("BUILD_PROFILE")));
    }

    #[test]
    fn test_global_options_follow_subcommand() {
        let args = Args::try_parse_from(["metafed", "search", "--count", "5", "--full"]).unwrap();
        assert_eq!(args.count, Some(5));
        assert!(args.full);
    }
}
