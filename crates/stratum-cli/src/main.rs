//! Stratum - dependency-graph provisioning CLI
//!
//! The `stratum` command validates a resource manifest, shows the create or
//! destroy plan, and drives apply/destroy runs against a state file.
//!
//! ## Commands
//!
//! - `validate`: Check a manifest for structural errors
//! - `plan`: Show the batches an apply (or `--destroy`) would dispatch
//! - `apply`: Create everything not already ready
//! - `destroy`: Tear everything down, orphans first
//! - `state list` / `state show`: Inspect the state file
//!
//! Only the built-in `wait` and `null` kinds have adapters in this binary.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use stratum_core::graph::ResourceGraph;
use stratum_core::scheduler::{self, Batch};
use stratum_core::{
    Direction, Engine, EngineConfig, EnvSecretStore, Manifest, OutcomeStatus, ResourceKind,
    ResourceSpec, RunResult,
};
use stratum_state::{FsStateStore, StateRecord, StateStore};
use tracing::{info, warn, Level};

const DEFAULT_CONFIG: &str = "stratum.toml";

#[derive(Parser)]
#[command(name = "stratum")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-graph infrastructure provisioner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    /// State file tracking provisioned resources
    #[arg(long, global = true, env = "STRATUM_STATE", default_value = ".stratum/state.json")]
    state: PathBuf,

    /// Engine configuration (TOML); defaults to ./stratum.toml when present
    #[arg(long, global = true, env = "STRATUM_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check a manifest for duplicate ids, dangling edges, bad references and cycles
    Validate {
        /// Manifest file (.toml or .json)
        manifest: PathBuf,
    },

    /// Show the batches a run would dispatch, without touching anything
    Plan {
        /// Manifest file (.toml or .json)
        manifest: PathBuf,

        /// Plan a destroy instead of an apply
        #[arg(long)]
        destroy: bool,
    },

    /// Create every declared resource that is not already ready
    Apply {
        /// Manifest file (.toml or .json)
        manifest: PathBuf,
    },

    /// Destroy every declared resource, plus tracked ones no longer declared
    Destroy {
        /// Manifest file (.toml or .json)
        manifest: PathBuf,
    },

    /// Inspect the state file
    State {
        #[command(subcommand)]
        action: StateAction,
    },
}

#[derive(Subcommand)]
enum StateAction {
    /// List tracked resources in creation order
    List,

    /// Show one tracked resource
    Show {
        /// Resource id
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stratum_core::init_tracing(cli.json, level);

    match &cli.command {
        Commands::Validate { manifest } => cmd_validate(manifest, cli.json),
        Commands::Plan { manifest, destroy } => {
            let direction = if *destroy {
                Direction::Destroy
            } else {
                Direction::Create
            };
            cmd_plan(manifest, direction, cli.json)
        }
        Commands::Apply { manifest } => cmd_run(&cli, manifest, Direction::Create).await,
        Commands::Destroy { manifest } => cmd_run(&cli, manifest, Direction::Destroy).await,
        Commands::State { action } => match action {
            StateAction::List => cmd_state_list(&cli.state, cli.json).await,
            StateAction::Show { id } => cmd_state_show(&cli.state, id).await,
        },
    }
}

fn load_specs(path: &Path) -> Result<Vec<ResourceSpec>> {
    let manifest = Manifest::load(path)
        .with_context(|| format!("Failed to load manifest {}", path.display()))?;
    Ok(manifest.into_specs()?)
}

fn load_graph(path: &Path) -> Result<ResourceGraph> {
    let specs = load_specs(path)?;
    ResourceGraph::build(specs).with_context(|| format!("Invalid manifest {}", path.display()))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let path = match path {
        Some(path) => path,
        None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
        None => return Ok(EngineConfig::default()),
    };
    EngineConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))
}

fn build_engine(cli: &Cli) -> Result<Engine> {
    let config = load_config(cli.config.as_deref())?;
    let store = FsStateStore::open(&cli.state)
        .with_context(|| format!("Failed to open state file {}", cli.state.display()))?;
    Engine::builder(Arc::new(store))
        .with_builtins()
        .secrets(Arc::new(EnvSecretStore::default()))
        .config(config)
        .build()
        .context("Invalid engine configuration")
}

/// Kinds in `graph` that this binary has no adapter for.
fn unsupported_kinds(graph: &ResourceGraph, engine_kinds: &BTreeSet<String>) -> BTreeSet<String> {
    graph
        .specs()
        .map(|s| s.kind.to_string())
        .filter(|k| !engine_kinds.contains(k))
        .collect()
}

fn builtin_kinds() -> BTreeSet<String> {
    [ResourceKind::Wait, ResourceKind::Null]
        .iter()
        .map(ToString::to_string)
        .collect()
}

/// Validate a manifest's structure
fn cmd_validate(manifest: &Path, json: bool) -> Result<ExitCode> {
    let graph = load_graph(manifest)?;
    let unsupported = unsupported_kinds(&graph, &builtin_kinds());

    if json {
        #[derive(Serialize)]
        struct Report {
            valid: bool,
            resources: usize,
            unsupported_kinds: BTreeSet<String>,
        }
        let report = Report {
            valid: true,
            resources: graph.len(),
            unsupported_kinds: unsupported,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}: {} resources, no structural errors", manifest.display(), graph.len());
        if !unsupported.is_empty() {
            println!(
                "note: no adapter in this binary for kinds: {}",
                unsupported.into_iter().collect::<Vec<_>>().join(", ")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Show planned batches
fn cmd_plan(manifest: &Path, direction: Direction, json: bool) -> Result<ExitCode> {
    let graph = load_graph(manifest)?;
    let batches = scheduler::plan(&graph, direction)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&batches)?);
    } else {
        print!("{}", render_plan(direction, &batches));
    }
    Ok(ExitCode::SUCCESS)
}

fn render_plan(direction: Direction, batches: &[Batch]) -> String {
    let mut out = format!("{direction} plan: {} batches\n", batches.len());
    for batch in batches {
        out.push_str(&format!("  batch {}: {}\n", batch.index, batch.ids.join(", ")));
    }
    out
}

/// Run an apply or destroy
async fn cmd_run(cli: &Cli, manifest: &Path, direction: Direction) -> Result<ExitCode> {
    let specs = load_specs(manifest)?;
    let engine = build_engine(cli)?;

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; waiting for in-flight provider calls");
            cancel.cancel();
        }
    });

    let result = match direction {
        Direction::Create => engine.apply(specs).await,
        Direction::Destroy => engine.destroy(specs).await,
    }
    .with_context(|| format!("{direction} aborted"))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", render_result(&result));
    }
    info!(run_id = %result.run_id, exit_code = result.exit_code(), "run complete");

    Ok(if result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn render_result(result: &RunResult) -> String {
    let mut out = String::new();
    for outcome in &result.outcomes {
        let detail = match (&outcome.error, &outcome.skip_reason) {
            (Some(err), _) => format!(" ({err})"),
            (None, Some(reason)) => format!(" ({reason})"),
            (None, None) if outcome.orphan => " (no longer declared)".to_string(),
            (None, None) if !outcome.changed => " (unchanged)".to_string(),
            (None, None) => String::new(),
        };
        out.push_str(&format!("  {:<15} {}{detail}\n", outcome.status.to_string(), outcome.id));
    }

    let summary = [
        OutcomeStatus::Ready,
        OutcomeStatus::Destroyed,
        OutcomeStatus::CreateFailed,
        OutcomeStatus::DestroyFailed,
        OutcomeStatus::Skipped,
        OutcomeStatus::Interrupted,
    ]
    .into_iter()
    .filter_map(|status| match result.count(status) {
        0 => None,
        n => Some(format!("{n} {status}")),
    })
    .collect::<Vec<_>>()
    .join(", ");

    out.push_str(&format!(
        "{} {} in {}ms: {}\n",
        result.direction,
        if result.success() { "succeeded" } else { "failed" },
        result.duration_ms,
        if summary.is_empty() { "nothing to do" } else { &summary }
    ));
    out
}

fn open_state(path: &Path) -> Result<FsStateStore> {
    FsStateStore::open(path)
        .with_context(|| format!("Failed to open state file {}", path.display()))
}

/// List tracked resources
async fn cmd_state_list(path: &Path, json: bool) -> Result<ExitCode> {
    let store = open_state(path)?;
    let records = store.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(ExitCode::SUCCESS);
    }
    if records.is_empty() {
        println!("No resources tracked in {}", path.display());
        return Ok(ExitCode::SUCCESS);
    }
    for record in &records {
        println!("{}", render_record_line(record));
    }
    Ok(ExitCode::SUCCESS)
}

fn render_record_line(record: &StateRecord) -> String {
    format!(
        "{:>4}  {:<24} {:<18} {}",
        record.sequence,
        record.id,
        record.kind,
        record.status
    )
}

/// Show one tracked resource
async fn cmd_state_show(path: &Path, id: &str) -> Result<ExitCode> {
    let store = open_state(path)?;
    let Some(record) = store.get(id).await? else {
        bail!("No resource '{}' in {}", id, path.display());
    };
    println!("{}", serde_json::to_string_pretty(&record)?);
    Ok(ExitCode::SUCCESS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratum_core::ResourceOutcome;

    #[test]
    fn test_cli_parses_plan_destroy() {
        let cli = Cli::try_parse_from([
            "stratum",
            "--state",
            "/tmp/s.json",
            "plan",
            "stack.toml",
            "--destroy",
        ])
        .unwrap();
        assert_eq!(cli.state, PathBuf::from("/tmp/s.json"));
        assert!(matches!(cli.command, Commands::Plan { destroy: true, .. }));
    }

    #[test]
    fn test_cli_parses_state_show() {
        let cli = Cli::try_parse_from(["stratum", "state", "show", "network", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::State {
                action: StateAction::Show { ref id }
            } if id == "network"
        ));
    }

    #[test]
    fn test_render_plan() {
        let batches = vec![
            Batch {
                index: 0,
                ids: vec!["network".into()],
            },
            Batch {
                index: 1,
                ids: vec!["cluster".into(), "database".into()],
            },
        ];
        assert_eq!(
            render_plan(Direction::Create, &batches),
            "create plan: 2 batches\n  batch 0: network\n  batch 1: cluster, database\n"
        );
    }

    #[test]
    fn test_render_result_summarises_counts() {
        let outcome = |id: &str, status: OutcomeStatus| {
            serde_json::from_value::<ResourceOutcome>(serde_json::json!({
                "id": id,
                "kind": "null",
                "status": status,
                "attempts": 1,
                "changed": true,
                "batch": 0,
                "sequence": 1,
            }))
            .unwrap()
        };
        let result = RunResult {
            run_id: "run-1".into(),
            direction: Direction::Create,
            outcomes: vec![
                outcome("network", OutcomeStatus::Ready),
                outcome("cluster", OutcomeStatus::CreateFailed),
            ],
            duration_ms: 42,
        };
        let text = render_result(&result);
        assert!(text.contains("ready           network\n"));
        assert!(text.ends_with("create failed in 42ms: 1 ready, 1 create_failed\n"));
    }
}
