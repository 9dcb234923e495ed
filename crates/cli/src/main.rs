use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kopy_apply::ResourceApplier;
use kopy_core::ObjectKind;
use kopy_journal::{Journal, Recorder, ReplayMode, ReplayOptions, Replayer};
use kopy_kubehub::{ClusterTarget, KubeStore};
use kopy_pipeline::{Clients, Pipeline, PipelineRegistry};
use kopy_sync::{Importer, Syncer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "kopyctl", version, about = "Replicate cluster objects live, or through a journal")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Source kubeconfig (default: KUBECONFIG / in-cluster)
    #[arg(long, global = true, env = "KOPY_SOURCE_KUBECONFIG")]
    source_kubeconfig: Option<PathBuf>,
    #[arg(long, global = true, env = "KOPY_SOURCE_CONTEXT")]
    source_context: Option<String>,
    /// Source API server URL; overrides kubeconfig, skips TLS verification
    #[arg(long, global = true, env = "KOPY_SOURCE_URL")]
    source_url: Option<String>,

    #[arg(long, global = true, env = "KOPY_DEST_KUBECONFIG")]
    dest_kubeconfig: Option<PathBuf>,
    #[arg(long, global = true, env = "KOPY_DEST_CONTEXT")]
    dest_context: Option<String>,
    /// Destination API server URL (e.g. a local simulator); skips TLS verification
    #[arg(long, global = true, env = "KOPY_DEST_URL")]
    dest_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List resources served by the source cluster
    Discover,
    /// Follow the source and keep the destination in step until interrupted
    Sync {
        /// Kinds to follow, in order, e.g. "v1/namespaces,v1/pods" (default: built-in sync order)
        #[arg(long, value_delimiter = ',', env = "KOPY_KINDS")]
        kinds: Vec<ObjectKind>,
    },
    /// Copy what the source holds now onto the destination, then exit
    Import {
        #[arg(long, value_delimiter = ',', env = "KOPY_KINDS")]
        kinds: Vec<ObjectKind>,
        /// Creates in flight per kind (default: KOPY_IMPORT_CONCURRENCY or 16)
        #[arg(long)]
        concurrency: Option<usize>,
    },
    /// Record the source's changes into a journal until interrupted
    Record {
        /// Journal file, or a directory to hold record.json
        #[arg(long, env = "KOPY_JOURNAL", default_value = "record.json")]
        journal: PathBuf,
        #[arg(long, value_delimiter = ',', env = "KOPY_KINDS")]
        kinds: Vec<ObjectKind>,
    },
    /// Replay a journal onto the destination
    Replay {
        #[arg(long, env = "KOPY_JOURNAL", default_value = "record.json")]
        journal: PathBuf,
        /// creates-only | full
        #[arg(long, env = "KOPY_REPLAY_MODE", default_value = "creates-only")]
        mode: ReplayMode,
        #[arg(long, env = "KOPY_REPLAY_CONCURRENCY", default_value_t = kopy_journal::replayer::DEFAULT_CONCURRENCY)]
        concurrency: usize,
    },
}

impl Cli {
    fn source(&self) -> ClusterTarget {
        ClusterTarget { kubeconfig: self.source_kubeconfig.clone(), context: self.source_context.clone(), url: self.source_url.clone() }
    }

    fn destination(&self) -> ClusterTarget {
        ClusterTarget { kubeconfig: self.dest_kubeconfig.clone(), context: self.dest_context.clone(), url: self.dest_url.clone() }
    }
}

fn init_tracing() {
    let env = std::env::var("KOPY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KOPY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KOPY_METRICS_ADDR; expected host:port");
        }
    }
}

fn journal_at(path: PathBuf) -> Journal {
    if path.is_dir() { Journal::in_dir(path) } else { Journal::at(path) }
}

fn or_sync_order(kinds: Vec<ObjectKind>) -> Vec<ObjectKind> {
    if kinds.is_empty() { kopy_core::sync_order() } else { kinds }
}

fn print<T: serde::Serialize + std::fmt::Debug>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Human => println!("{:#?}", value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

/// Source and destination stores plus an applier bound to the destination.
struct Link {
    source: Arc<KubeStore>,
    destination: Arc<KubeStore>,
    applier: Arc<ResourceApplier>,
}

impl Link {
    async fn open(cli: &Cli) -> Result<Self> {
        let source = Arc::new(KubeStore::open("source", &cli.source()).await?);
        let destination = Arc::new(KubeStore::open("destination", &cli.destination()).await?);
        let applier = Arc::new(ResourceApplier::new(destination.clone(), destination.catalog()));
        Ok(Self { source, destination, applier })
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(Arc::new(PipelineRegistry::mandatory()), Clients::new(self.source.clone(), self.destination.clone()))
    }
}

async fn until_interrupted(cancel: &CancellationToken) -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("interrupted; finishing in-flight events");
    cancel.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Discover => {
            let store = KubeStore::open("source", &cli.source()).await?;
            let resources = store.catalog().resources();
            match cli.output {
                Output::Human => {
                    for r in resources {
                        let scope = if r.namespaced { "namespaced" } else { "cluster" };
                        let gv = if r.group.is_empty() { r.version.clone() } else { format!("{}/{}", r.group, r.version) };
                        println!("{} • {} • {} • {}", gv, r.kind, r.resource, scope);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&resources)?),
            }
        }
        Commands::Sync { kinds } => {
            let link = Link::open(&cli).await?;
            let syncer = Syncer::new(link.source.clone(), link.applier.clone(), link.pipeline()).with_kinds(or_sync_order(kinds.clone()));
            let cancel = CancellationToken::new();
            let handle = syncer.run(cancel.clone()).await?;
            info!(feeds = handle.running(), "syncing; ctrl-c to stop");
            until_interrupted(&cancel).await?;
            handle.wait().await;
        }
        Commands::Import { kinds, concurrency } => {
            let link = Link::open(&cli).await?;
            let mut importer = Importer::new(link.source.clone(), link.applier.clone(), link.pipeline()).with_kinds(or_sync_order(kinds.clone()));
            if let Some(n) = concurrency { importer = importer.with_concurrency(*n); }
            match importer.import().await {
                Ok(summary) => print(cli.output, &summary)?,
                Err(e) => {
                    error!(error = %e, "import failed");
                    return Err(e.into());
                }
            }
        }
        Commands::Record { journal, kinds } => {
            let source = Arc::new(KubeStore::open("source", &cli.source()).await?);
            let recorder = Recorder::new(source, journal_at(journal.clone())).with_kinds(or_sync_order(kinds.clone()));
            let cancel = CancellationToken::new();
            let handle = recorder.run(cancel.clone()).await?;
            info!(records = handle.recorded().await, "initial state recorded; ctrl-c to stop");
            until_interrupted(&cancel).await?;
            handle.shutdown().await?;
        }
        Commands::Replay { journal, mode, concurrency } => {
            let destination = Arc::new(KubeStore::open("destination", &cli.destination()).await?);
            let applier = Arc::new(ResourceApplier::new(destination.clone(), destination.catalog()));
            // the journal already recreated referenced objects on the destination
            let pipeline = Pipeline::new(Arc::new(PipelineRegistry::mandatory()), Clients::destination_only(destination));
            let replayer = Replayer::new(applier, journal_at(journal.clone()))
                .with_pipeline(pipeline)
                .with_options(ReplayOptions { mode: *mode, concurrency: *concurrency });
            match replayer.replay().await {
                Ok(summary) => print(cli.output, &summary)?,
                Err(e) => {
                    error!(error = %e, "replay failed");
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}
