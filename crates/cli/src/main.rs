//! kexp command line frontend.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use kexp_api::{ClusterBackend, Engine, Notice};
use kexp_client::ClusterContext;
use kexp_core::{path, timefmt, CacheKey, SortField, ALL_NAMESPACES};

#[derive(Parser, Debug)]
#[command(name = "kexp", version, about = "Cluster browser backend CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster config file (default: ~/.kube/config)
    #[arg(long = "kubeconfig", global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Context name (default: first usable context in the config)
    #[arg(long = "context", global = true)]
    context: Option<String>,

    /// Namespace scope; the default spans every namespace
    #[arg(long = "ns", global = true, default_value = ALL_NAMESPACES)]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum SortArg {
    Name,
    Age,
}

impl From<SortArg> for SortField {
    fn from(v: SortArg) -> Self {
        match v {
            SortArg::Name => SortField::Name,
            SortArg::Age => SortField::Age,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the contexts found in the cluster config
    Contexts,
    /// List the resource catalog
    Kinds,
    /// List objects of one kind
    Ls {
        /// Kind name or short alias, e.g. "pods" or "po"
        kind: String,
        /// Sort column
        #[arg(long = "sort", value_enum, default_value_t = SortArg::Name)]
        sort: SortArg,
        /// Reverse the sort direction
        #[arg(long = "desc", action = ArgAction::SetTrue)]
        desc: bool,
    },
    /// Show one object
    Get { kind: String, name: String },
    /// Stream change notices for one kind until interrupted
    Watch { kind: String },
    /// Delete an object
    Delete {
        kind: String,
        name: String,
        /// Delete without a grace period
        #[arg(long = "now", action = ArgAction::SetTrue)]
        now: bool,
    },
    /// Adjust spec.replicas by a delta, e.g. +1 or -2
    Scale {
        kind: String,
        name: String,
        #[arg(allow_hyphen_values = true)]
        delta: i64,
    },
    /// Print (or follow) the log tail of one container
    Logs {
        pod: String,
        container: String,
        #[arg(long = "follow", short = 'f', action = ArgAction::SetTrue)]
        follow: bool,
    },
    /// Run a command inside a container
    Exec {
        pod: String,
        container: String,
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("KEXP_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(p) = &cli.kubeconfig {
        return Ok(p.clone());
    }
    match std::env::var_os("HOME") {
        Some(home) => Ok(PathBuf::from(home).join(".kube").join("config")),
        None => bail!("--kubeconfig not given and HOME is unset"),
    }
}

fn pick_context(cli: &Cli) -> Result<ClusterContext> {
    let path = config_path(cli)?;
    let contexts = kexp_client::config::load_contexts(&path)?;
    match &cli.context {
        Some(name) => contexts
            .into_iter()
            .find(|c| &c.name == name)
            .ok_or_else(|| anyhow!("context '{name}' not found in {}", path.display())),
        None => contexts
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no contexts in {}", path.display())),
    }
}

async fn connect(cli: &Cli) -> Result<(Arc<Engine>, mpsc::Receiver<Notice>)> {
    let ctx = pick_context(cli)?;
    info!(context = %ctx.name, server = %ctx.server, "connecting");
    Ok(Engine::connect(ctx).await?)
}

/// Give the freshly opened watches a moment to deliver the initial burst:
/// wait until the notice stream goes quiet or the deadline passes.
async fn settle(notices: &mut mpsc::Receiver<Notice>) {
    let wait_ms = std::env::var("KEXP_WAIT_MS").ok().and_then(|s| s.parse().ok()).unwrap_or(1500);
    let deadline = Instant::now() + Duration::from_millis(wait_ms);
    let quiet = Duration::from_millis(200);
    while Instant::now() < deadline {
        match tokio::time::timeout(quiet, notices.recv()).await {
            Ok(Some(_)) => continue,
            _ => break,
        }
    }
}

fn concrete_ns(cli: &Cli) -> Result<&str> {
    if cli.namespace.is_empty() || cli.namespace == ALL_NAMESPACES {
        bail!("--ns with a concrete namespace is required for this command");
    }
    Ok(&cli.namespace)
}

fn print_items(items: &[serde_json::Value]) {
    println!("{:<16} {:<48} {:>8}", "NAMESPACE", "NAME", "AGE");
    for item in items {
        let ns = path::str_at(item, &["metadata", "namespace"]).unwrap_or("-");
        let name = path::str_at(item, &["metadata", "name"]).unwrap_or("");
        let age = path::str_at(item, &["metadata", "creationTimestamp"])
            .map(timefmt::age_of)
            .unwrap_or_else(|| "-".to_string());
        println!("{:<16} {:<48} {:>8}", ns, name, age);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Contexts => {
            let path = config_path(&cli)?;
            let mut contexts = Vec::new();
            // Only reachable clusters are listed; the rest get a warning.
            for ctx in kexp_client::config::load_contexts(&path)? {
                let client = kexp_client::RestClient::new(ctx.clone())?;
                match client.probe().await {
                    Ok(()) => contexts.push(ctx),
                    Err(e) => {
                        warn!(context = %ctx.name, error = %e, "skipping unreachable context")
                    }
                }
            }
            match cli.output {
                Output::Human => {
                    for c in contexts {
                        println!("{:<16} {:<48} {}", c.name, c.server, c.color);
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = contexts
                        .iter()
                        .map(|c| {
                            serde_json::json!({
                                "name": c.name,
                                "server": c.server.as_str(),
                                "color": c.color,
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Kinds => {
            let kinds = kexp_core::catalog();
            match cli.output {
                Output::Human => {
                    for k in kinds {
                        let scope = if k.namespaced { "namespaced" } else { "cluster" };
                        let watch = if k.watchable { "watch" } else { "list" };
                        println!(
                            "{:<28} {:<8} {:<28} {:<10} {}",
                            k.name, k.short_name, k.api_prefix, scope, watch
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&kinds)?),
            }
        }
        Commands::Ls { kind, sort, desc } => {
            let (engine, mut notices) = connect(&cli).await?;
            engine.set_sort_field((*sort).into());
            if *desc {
                engine.toggle_sort_direction();
            }
            settle(&mut notices).await;
            let items = engine.items(kind, &cli.namespace).await?;
            match cli.output {
                Output::Human => print_items(&items),
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
            engine.shutdown().await;
        }
        Commands::Get { kind, name } => {
            let (engine, mut notices) = connect(&cli).await?;
            settle(&mut notices).await;
            let found = engine.get(kind, &cli.namespace, name).await?;
            engine.shutdown().await;
            match found {
                Some(obj) => match cli.output {
                    Output::Human => print!("{}", serde_yaml::to_string(&obj)?),
                    Output::Json => println!("{}", serde_json::to_string_pretty(&obj)?),
                },
                None => bail!("{kind}/{name} not found"),
            }
        }
        Commands::Watch { kind } => {
            let (engine, mut notices) = connect(&cli).await?;
            let info = kexp_core::find_kind(engine.kinds(), kind)
                .ok_or_else(|| anyhow!("unknown resource kind '{kind}'"))?;
            // Watches are opened cluster-wide, so the slice key is unscoped.
            engine.set_focus(Some(CacheKey::new(&info.name, None)));
            loop {
                tokio::select! {
                    maybe = notices.recv() => match maybe {
                        Some(Notice::Changed(key)) => {
                            let items = engine.items(kind, &cli.namespace).await?;
                            println!("~ {key}: {} items", items.len());
                        }
                        Some(Notice::Warning(msg)) => warn!(%msg, "watch warning"),
                        Some(Notice::Offline) => eprintln!("cluster unreachable"),
                        None => break,
                    },
                    _ = signal::ctrl_c() => {
                        info!("interrupted; shutting down");
                        break;
                    }
                }
            }
            engine.shutdown().await;
        }
        Commands::Delete { kind, name, now } => {
            let (engine, _notices) = connect(&cli).await?;
            let result = engine.delete(kind, &cli.namespace, name, *now).await;
            engine.shutdown().await;
            result?;
            println!("{kind}/{name} deleted");
        }
        Commands::Scale { kind, name, delta } => {
            let (engine, _notices) = connect(&cli).await?;
            let result = engine.scale(kind, &cli.namespace, name, *delta).await;
            engine.shutdown().await;
            let target = result?;
            println!("{kind}/{name} scaled to {target}");
        }
        Commands::Logs { pod, container, follow } => {
            let ns = concrete_ns(&cli)?.to_string();
            let (engine, _notices) = connect(&cli).await?;
            if *follow {
                let handle = engine.follow_logs(&ns, pod, container).await?;
                let kexp_api::StreamHandle { mut rx, cancel } = handle;
                let mut cancel = Some(cancel);
                loop {
                    tokio::select! {
                        maybe = rx.recv() => match maybe {
                            Some(chunk) => println!("{}", chunk.line),
                            None => break,
                        },
                        _ = signal::ctrl_c() => {
                            if let Some(c) = cancel.take() {
                                c.cancel();
                            }
                        }
                    }
                }
            } else {
                let logs = engine.read_logs(&ns, pod, container).await?;
                print!("{logs}");
            }
            engine.shutdown().await;
        }
        Commands::Exec { pod, container, command } => {
            let ns = concrete_ns(&cli)?.to_string();
            let (engine, _notices) = connect(&cli).await?;
            let result = engine.exec_command(&ns, pod, container, command).await;
            engine.shutdown().await;
            print!("{}", result?);
        }
    }

    Ok(())
}
