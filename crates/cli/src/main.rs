use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use tether_controller::{Controller, ControllerConfig, RetryPolicy};
use tether_core::{DerivedKey, PrimaryKey, ResourceStore};
use tether_kubehub::{DynamicStore, PodSource, TargetResource};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tetherctl", version, about = "Mirror pods as derived custom resources")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to a kubeconfig file (default: in-cluster config or $KUBECONFIG)
    #[arg(long, env = "TETHER_KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Namespace watched for pods and holding the derived resources
    #[arg(long, env = "TETHER_NAMESPACE", global = true, default_value = "default")]
    namespace: String,

    #[command(flatten)]
    target: TargetArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct TargetArgs {
    #[arg(long = "target-group", global = true, default_value = "stable.example.com")]
    group: String,
    #[arg(id = "target_version", long = "target-version", global = true, default_value = "v1")]
    version: String,
    #[arg(long = "target-kind", global = true, default_value = "Testcr")]
    kind: String,
    #[arg(long = "target-plural", global = true, default_value = "testcrs")]
    plural: String,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until Ctrl-C
    Run {
        /// Concurrent reconcile workers
        #[arg(long, env = "TETHER_WORKERS", default_value_t = 1)]
        workers: usize,
        /// Requeue failed keys with backoff instead of dropping them
        #[arg(long, env = "TETHER_RETRY", action = ArgAction::SetTrue)]
        retry: bool,
        /// Attempts before a requeued key is dropped
        #[arg(long = "max-retries", default_value_t = 5)]
        max_retries: u32,
        /// Skip listing derived resources after each key
        #[arg(long = "no-report", action = ArgAction::SetTrue)]
        no_report: bool,
    },
    /// List derived resources currently in the store
    Ls,
    /// Print the derived identifier for a primary key, e.g. "default/nginx"
    Key {
        key: String,
    },
}

impl Cli {
    fn target(&self) -> TargetResource {
        TargetResource {
            group: self.target.group.clone(),
            version: self.target.version.clone(),
            kind: self.target.kind.clone(),
            plural: self.target.plural.clone(),
            namespace: self.namespace.clone(),
        }
    }
}

fn controller_config(workers: usize, retry: bool, max_retries: u32, no_report: bool) -> ControllerConfig {
    ControllerConfig {
        workers,
        retry: if retry { RetryPolicy::Requeue { max_retries } } else { RetryPolicy::Drop },
        report: !no_report,
        ..ControllerConfig::default()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let target = cli.target();

    match cli.command {
        Commands::Run { workers, retry, max_retries, no_report } => {
            let cfg = controller_config(workers, retry, max_retries, no_report);
            info!(ns = %cli.namespace, workers = cfg.workers, retry = ?cfg.retry, "run invoked");
            let client = tether_kubehub::client(cli.kubeconfig.as_deref()).await?;
            let source = PodSource::namespaced(client.clone(), &cli.namespace);
            let store = DynamicStore::new(client, &target);
            let cancel = CancellationToken::new();
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    match signal::ctrl_c().await {
                        Ok(()) => info!("Ctrl-C received; stopping"),
                        Err(e) => warn!(error = %e, "failed to listen for Ctrl-C; stopping"),
                    }
                    cancel.cancel();
                }
            });
            Controller::new(Arc::new(source), Arc::new(store), cfg).run(cancel).await?;
        }
        Commands::Ls => {
            info!(ns = %target.namespace, kind = %target.kind, "ls invoked");
            let client = tether_kubehub::client(cli.kubeconfig.as_deref()).await?;
            let store = DynamicStore::new(client, &target);
            let mut items = store.list().await.context("listing derived resources")?;
            items.sort_by(|a, b| a.payload.pod_key.cmp(&b.payload.pod_key));
            match cli.output {
                Output::Human => {
                    println!("{:<28} {:<16} {:<38} {}", "POD", "IP", "UID", "ID");
                    for r in &items {
                        let ip = if r.payload.pod_ip.is_empty() { "-" } else { r.payload.pod_ip.as_str() };
                        println!("{:<28} {:<16} {:<38} {}", r.payload.pod_key, ip, r.payload.pod_uid, r.id);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Key { key } => {
            let key = PrimaryKey::from(key);
            let id = DerivedKey::for_primary(&key)?;
            match cli.output {
                Output::Human => println!("{}", id),
                Output::Json => println!("{}", serde_json::json!({ "key": key, "id": id })),
            }
        }
    }
    Ok(())
}

fn init_tracing() {
    let env = std::env::var("TETHER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("TETHER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
                Ok(()) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid TETHER_METRICS_ADDR; expected host:port");
        }
    }
}
