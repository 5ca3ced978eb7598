use anyhow::Result;
use clap::{Parser, Subcommand};
use proxy_curator::{
    config::Config,
    curator::{
        extract::extract_links, harvest::JsonFileSource, rename, Pipeline, Selector,
        SelectorConfig, SelectorMode, ServerStore, TesterConfig, XrayKnifeTester,
    },
    publish::{GithubPublisher, NoopPublisher, Publisher},
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// A proxy link harvester, tester and curator
#[derive(Parser)]
#[command(name = "proxy-curator")]
#[command(about = "Harvests, tests and curates proxy endpoints from chat groups")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "curator.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full curation pipeline once
    Run,
    /// Extract and normalize candidate links from a text file
    Extract {
        /// Input file containing raw message text
        input: PathBuf,
        /// Output file for normalized links
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show the current publish set from the store
    Show {
        /// Show internal-proxy candidates instead of the publish set
        #[arg(long)]
        proxy: bool,
        /// Selector mode for proxy candidates (speed_passed, latency_passed)
        #[arg(long, default_value = "speed_passed")]
        mode: String,
        /// Maximum candidates to show
        #[arg(short, long, default_value = "5")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_pipeline(&cli.config).await,
        Commands::Extract { input, output } => extract_command(&input, output.as_deref()),
        Commands::Show { proxy, mode, limit } => {
            show_command(&cli.config, proxy, &mode, limit).await
        }
    }
}

async fn run_pipeline(config_path: &Path) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = ServerStore::open(&config.database.path).await?;

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown signal received, finishing current tasks");
            signal_token.cancel();
        }
    });

    let source = JsonFileSource::new(config.sources.dump_dir.clone());
    let tester_config = TesterConfig::new(config.tester.path.clone())
        .with_concurrency(config.tester.concurrency)
        .with_chunk_size(config.tester.chunk_size)
        .with_timeout(Duration::from_secs(config.tester.timeout_secs))
        .with_extra_args(config.tester.extra_args.clone());
    let oracle = XrayKnifeTester::new(tester_config, cancel.clone());

    let publisher: Box<dyn Publisher> = if config.publisher.enabled {
        Box::new(GithubPublisher::new(config.publisher.clone())?)
    } else {
        Box::new(NoopPublisher)
    };

    let mut pipeline = Pipeline::new(
        config,
        store,
        Box::new(source),
        Box::new(oracle),
        publisher,
        cancel,
    );

    let result = pipeline.run().await;
    pipeline.stats().print_summary();
    info!("run finished");
    result
}

fn extract_command(input: &Path, output: Option<&Path>) -> Result<()> {
    let content = std::fs::read_to_string(input)?;
    let links = extract_links(&content);
    println!("Extracted {} normalized links from {:?}", links.len(), input);

    if let Some(output_path) = output {
        std::fs::write(output_path, links.join("\n"))?;
        println!("Saved links to {:?}", output_path);
    } else {
        for link in &links {
            println!("{}", link);
        }
    }
    Ok(())
}

async fn show_command(config_path: &Path, proxy: bool, mode: &str, limit: usize) -> Result<()> {
    let config = Config::load(config_path)?;
    let store = ServerStore::open(&config.database.path).await?;
    let selector = Selector::new(
        &store,
        SelectorConfig {
            min_download_mbps: config.speed_test.min_download_mbps,
            max_retries: config.database.max_retries,
            retest_window: chrono::Duration::hours(config.database.retest_window_hours),
        },
    );

    if proxy {
        let mode = match mode {
            "speed_passed" => SelectorMode::SpeedPassed,
            "latency_passed" => SelectorMode::LatencyPassed,
            other => anyhow::bail!(
                "invalid selector mode: {}. Use: speed_passed, latency_passed",
                other
            ),
        };
        let candidates = selector.select_internal_proxy_set(mode, limit).await?;
        if candidates.is_empty() {
            println!("No internal-proxy candidates.");
        }
        for record in candidates {
            println!(
                "{} (delay: {:?} ms, download: {:?} Mbps)",
                record.uri, record.delay_ms, record.download_mbps
            );
        }
    } else {
        let set = selector.select_publish_set().await?;
        if set.is_empty() {
            println!("Publish set is empty.");
        }
        for record in set {
            println!("{}", rename::renamed_uri(&record));
        }
    }
    Ok(())
}
