//! bulkctl - apply intents to a Verity controller in dependency-ordered bulk
//! requests.
//!
//! ```bash
//! bulkctl apply --config verity.toml --plan plan.json --deadline-secs 120
//! bulkctl catalog --mode campus
//! ```

mod plan;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plan::CliConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use verity_bulkops::{
    BulkOperationManager, DependencyDag, HandleState, HttpTransport, Intent, IntentHandle, Mode,
};

/// Verity bulk operation client
#[derive(Parser, Debug)]
#[command(name = "bulkctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short = 'l', long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit every intent of a plan, flush and report per-intent outcomes
    Apply {
        /// TOML file with [controller] and [bulk] tables
        #[arg(short, long)]
        config: PathBuf,

        /// JSON array of {op, kind, name, payload?}
        #[arg(short, long)]
        plan: PathBuf,

        /// Give up waiting for the flush after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
    },
    /// List the active resource kinds in apply order
    Catalog {
        #[arg(short, long, default_value = "datacenter")]
        mode: Mode,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);

    let result = match args.command {
        Command::Apply {
            config,
            plan,
            deadline_secs,
        } => apply(config, plan, deadline_secs.map(Duration::from_secs)).await,
        Command::Catalog { mode } => catalog(mode).map(|()| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("bulkctl failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Returns whether every intent succeeded.
async fn apply(config: PathBuf, plan: PathBuf, deadline: Option<Duration>) -> Result<bool> {
    let config = CliConfig::load(&config)?;
    let intents = plan::load_plan(&plan)?;
    info!(
        base_url = %config.controller.base_url,
        mode = %config.bulk.mode,
        intents = intents.len(),
        "Applying plan"
    );

    let transport = HttpTransport::new(config.controller).context("controller transport")?;
    let manager = BulkOperationManager::new(config.bulk, Arc::new(transport))?;

    let submitted: Vec<(Intent, Option<IntentHandle>, Option<String>)> = intents
        .into_iter()
        .map(|intent| match manager.submit(intent.clone()) {
            Ok(handle) => (intent, Some(handle), None),
            Err(e) => {
                warn!(kind = %intent.kind, name = %intent.name, error = %e, "Submission refused");
                (intent, None, Some(e.to_string()))
            }
        })
        .collect();

    match manager.flush(deadline).await {
        Ok(summary) => info!(
            batches = summary.batches,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Plan flushed"
        ),
        Err(e) => warn!(error = %e, "Flush incomplete; remaining intents will be cancelled"),
    }
    let closed = manager.close().await;
    if closed.cancelled_intents > 0 || closed.aborted_batches > 0 {
        warn!(
            cancelled = closed.cancelled_intents,
            aborted_batches = closed.aborted_batches,
            "Intents left unapplied"
        );
    }

    let mut all_ok = true;
    println!("{:<7} {:<28} {:<32} OUTCOME", "OP", "KIND", "NAME");
    for (intent, handle, refused) in submitted {
        let outcome = match (handle, refused) {
            (Some(handle), _) => {
                let state = handle.state();
                all_ok &= state == HandleState::Succeeded;
                outcome_label(&state)
            }
            (None, reason) => {
                all_ok = false;
                format!("refused: {}", reason.unwrap_or_default())
            }
        };
        println!(
            "{:<7} {:<28} {:<32} {}",
            intent.op, intent.kind, intent.name, outcome
        );
    }
    Ok(all_ok)
}

fn outcome_label(state: &HandleState) -> String {
    match state {
        HandleState::Succeeded => "ok".to_string(),
        HandleState::Failed(e) => format!("failed: {e}"),
        HandleState::Cancelled => "cancelled".to_string(),
        HandleState::Pending | HandleState::InFlight => "unfinished".to_string(),
    }
}

fn catalog(mode: Mode) -> Result<()> {
    let dag = DependencyDag::builtin(mode)?;
    for line in catalog_lines(&dag) {
        println!("{line}");
    }
    Ok(())
}

fn catalog_lines(dag: &DependencyDag) -> Vec<String> {
    dag.kinds()
        .enumerate()
        .map(|(index, kind)| {
            let mut line = format!("{index:>3}  {:<28} /{}", kind.name, kind.path);
            if !kind.depends_on.is_empty() {
                line.push_str(&format!("  <- {}", kind.depends_on.join(", ")));
            }
            line
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;
    use verity_bulkops::BulkError;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_apply() {
        let args = Args::parse_from([
            "bulkctl",
            "apply",
            "--config",
            "verity.toml",
            "--plan",
            "plan.json",
            "--deadline-secs",
            "30",
        ]);
        match args.command {
            Command::Apply {
                config,
                plan,
                deadline_secs,
            } => {
                assert_eq!(config, PathBuf::from("verity.toml"));
                assert_eq!(plan, PathBuf::from("plan.json"));
                assert_eq!(deadline_secs, Some(30));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_parse_catalog_mode() {
        let args = Args::parse_from(["bulkctl", "catalog", "--mode", "campus"]);
        assert!(matches!(args.command, Command::Catalog { mode: Mode::Campus }));
        assert!(Args::try_parse_from(["bulkctl", "catalog", "--mode", "edge"]).is_err());
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(outcome_label(&HandleState::Succeeded), "ok");
        assert_eq!(outcome_label(&HandleState::Cancelled), "cancelled");
        assert_eq!(
            outcome_label(&HandleState::Failed(BulkError::validation_rejected(
                "badge", "B", "duplicate"
            ))),
            "failed: Controller rejected badge:B: duplicate"
        );
    }

    #[test]
    fn test_catalog_lines() {
        let dag = DependencyDag::builtin(Mode::Datacenter).unwrap();
        let lines = catalog_lines(&dag);
        assert_eq!(lines.len(), dag.len());
        assert!(lines[0].contains("ipv4_list"));
        let service = lines.iter().position(|l| l.contains(" service ")).unwrap();
        let tenant = lines.iter().position(|l| l.contains(" tenant ")).unwrap();
        assert!(tenant < service);
        assert!(lines[service].ends_with("<- tenant"));
    }
}
