// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

use content_mirror::{
    config::{Config, CONFIG_FILE_NAME},
    path::{find_project_root, resolve_cache_dir},
    watch::{ApplyMode, Watcher},
    CacheStore, FetchOptions, GitClient, SyncOrchestrator,
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::{path::PathBuf, process::exit, time::Duration};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Clone, Parser)]
#[command(
    about,
    override_usage = "\n  content-mirror [options] <command>",
    subcommand_help_heading = "Commands",
    version
)]
struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to configuration file.
    #[arg(short, long, global = true, value_name = "path")]
    pub config: Option<PathBuf>,

    /// Root directory of project to mirror content into.
    #[arg(short, long, global = true, value_name = "dir")]
    pub project: Option<PathBuf>,

    /// Log debug detail and full error chains.
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

impl Cli {
    async fn run(self) -> Result<()> {
        let project = Project::load(self.project, self.config)?;
        match self.command {
            Command::Fetch(opts) => run_fetch(project, opts).await,
            Command::Status => run_status(project).await,
            Command::Cache(opts) => run_cache(project, opts).await,
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Bring project content in line with the remote.
    #[command(override_usage = "content-mirror fetch [options]")]
    Fetch(FetchArgs),

    /// Show local content state and what a fetch would do.
    #[command(override_usage = "content-mirror status [options]")]
    Status,

    /// Manage cached revisions and digests.
    #[command(subcommand)]
    Cache(CacheCommand),
}

#[derive(Parser, Clone, Debug)]
#[command(author, about, long_about)]
struct FetchArgs {
    /// Skip the staleness check and fetch everything.
    #[arg(short, long)]
    pub force: bool,

    /// Keep polling the remote for updates.
    #[arg(short, long)]
    pub watch: bool,

    /// Apply updates found while watching without asking.
    #[arg(short, long, requires = "watch")]
    pub auto: bool,
}

#[derive(Debug, Clone, Subcommand)]
enum CacheCommand {
    /// Remove cached entries.
    Clear {
        /// Only clear target namespace.
        #[arg(short, long, value_name = "namespace")]
        namespace: Option<String>,
    },
}

/// Everything a command needs to know about where it runs.
struct Project {
    config: Config,
    project_root: PathBuf,
    cache_dir: PathBuf,
}

impl Project {
    fn load(project: Option<PathBuf>, config_path: Option<PathBuf>) -> Result<Self> {
        let cwd = std::env::current_dir().context("cannot determine current directory")?;
        let found = project.or_else(|| find_project_root(&cwd));
        let project_root = found.clone().unwrap_or_else(|| cwd.clone());

        let config_path = config_path.unwrap_or_else(|| project_root.join(CONFIG_FILE_NAME));
        let data = std::fs::read_to_string(&config_path)
            .with_context(|| format!("cannot read configuration at {}", config_path.display()))?;
        let config: Config = data
            .parse()
            .with_context(|| format!("invalid configuration at {}", config_path.display()))?;
        let cache_dir = resolve_cache_dir(&config, found.as_deref())?;

        Ok(Self {
            config,
            project_root,
            cache_dir,
        })
    }

    async fn orchestrator(self) -> Result<SyncOrchestrator> {
        let spinner = ProgressBar::new_spinner();
        let client = GitClient::new(self.config.retry_policy())
            .with_timeouts(self.config.remote_timeout(), self.config.clone_timeout())
            .with_progress(spinner);
        let cache = CacheStore::open(&self.cache_dir)?;

        Ok(SyncOrchestrator::new(self.config, self.project_root, client, cache).await?)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let layer = fmt::layer()
        .compact()
        .with_target(false)
        .without_time();
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .init();

    let verbose = cli.verbose;
    if let Err(error) = cli.run().await {
        if verbose {
            error!("{error:?}");
        } else {
            error!("{error}");
        }
        exit(1);
    }

    exit(0)
}

async fn run_fetch(project: Project, opts: FetchArgs) -> Result<()> {
    let period = project.config.watch_interval();
    let mut sync = project.orchestrator().await?;

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{bar:40} {pos}/{len} mappings")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let mut progress = sync.progress();
    let drain = tokio::spawn({
        let bar = bar.clone();
        async move {
            while let Some(event) = progress.recv().await {
                bar.set_length(event.total as u64);
                bar.set_position(event.processed as u64);
            }
        }
    });

    let fetch_opts = FetchOptions { force: opts.force };
    if opts.watch {
        let session = Watcher::new(period, ApplyMode::detect(opts.auto))
            .follow(&mut sync, fetch_opts)
            .await;
        bar.finish_and_clear();
        let summary = session?.summary;
        info!(
            "watched {} tick(s), applied {} update(s)",
            summary.ticks, summary.applied
        );
    } else {
        let report = sync.fetch(fetch_opts).await;
        bar.finish_and_clear();
        let report = report?;
        info!(
            "{} finished at revision {}",
            report.strategy,
            report.revision.as_deref().unwrap_or("unknown")
        );
    }

    drop(sync);
    drain.await?;
    bar.finish_and_clear();

    Ok(())
}

async fn run_status(project: Project) -> Result<()> {
    let sync = project.orchestrator().await?;
    let status = sync.status().await;
    let assessment = &status.assessment;

    println!("content:  {}", assessment.existence);
    println!(
        "cached:   {}",
        assessment.cached_revision.as_deref().unwrap_or("none")
    );
    match &assessment.live_revision {
        Some(revision) => println!("remote:   {revision}"),
        None => println!("remote:   unreachable"),
    }
    println!("strategy: {}", status.strategy);

    Ok(())
}

async fn run_cache(project: Project, command: CacheCommand) -> Result<()> {
    let cache = CacheStore::open(&project.cache_dir)?
        .with_io_timeout(Duration::from_secs(30));
    match command {
        CacheCommand::Clear { namespace } => {
            cache.clear(namespace.as_deref()).await;
            match namespace {
                Some(namespace) => info!("cleared cache namespace {namespace:?}"),
                None => info!("cleared cache at {}", project.cache_dir.display()),
            }
        }
    }

    Ok(())
}
