//! Operator command surface for the churn feedback store.
//!
//! Hosts can embed the CLI through [`run_cli`] for a parsed command line or
//! [`run_with_db`] for a single command against a database path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use churn_feedback_core::{
    format_rfc3339, ChurnLabel, CustomerId, FeedbackController, FeedbackError,
    FeedbackPolicy, MispredictionEntry, MispredictionLedger, NoopRetrainInvoker, RecordStore,
    RetrainMode, DEFAULT_RETRAIN_THRESHOLD,
};
use churn_feedback_store_sqlite::SqliteChurnStore;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;

#[derive(Debug, Parser)]
#[command(name = "churnctl")]
#[command(about = "Churn feedback operator CLI")]
pub struct Cli {
    #[arg(long, env = "CHURN_DB", default_value = "./churn_feedback.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Feedback {
        #[command(subcommand)]
        command: Box<FeedbackCommand>,
    },
    Ledger {
        #[command(subcommand)]
        command: Box<LedgerCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DbCommand {
    Migrate,
}

#[derive(Debug, Subcommand)]
pub enum RecordCommand {
    Show(RecordShowArgs),
    Latest,
}

#[derive(Debug, Args)]
pub struct RecordShowArgs {
    #[arg(long)]
    customer_id: CustomerId,
}

#[derive(Debug, Subcommand)]
pub enum FeedbackCommand {
    Record(FeedbackRecordArgs),
}

#[derive(Debug, Args)]
pub struct FeedbackRecordArgs {
    #[arg(long)]
    customer_id: CustomerId,
    #[arg(long, value_parser = clap::value_parser!(i64).range(0..=1))]
    actual_output: i64,
    #[arg(long, default_value_t = DEFAULT_RETRAIN_THRESHOLD)]
    retrain_threshold: u64,
    #[arg(long, value_enum, default_value_t = RetrainModeArg::Continuous)]
    retrain_mode: RetrainModeArg,
}

#[derive(Debug, Subcommand)]
pub enum LedgerCommand {
    Count(LedgerCountArgs),
    List(LedgerListArgs),
    Export(LedgerExportArgs),
}

#[derive(Debug, Args)]
pub struct LedgerCountArgs {
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LedgerListArgs {
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct LedgerExportArgs {
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RetrainModeArg {
    Continuous,
    Disabled,
}

impl From<RetrainModeArg> for RetrainMode {
    fn from(value: RetrainModeArg) -> Self {
        match value {
            RetrainModeArg::Continuous => Self::Continuous,
            RetrainModeArg::Disabled => Self::Disabled,
        }
    }
}

/// Executes the parsed command line.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or when the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    run_with_db(&cli.db, cli.command)
}

/// Opens and migrates the store at `db_path`, then runs `command` against it.
///
/// # Errors
/// Returns an error when the store cannot be opened or migrated, or when the
/// command fails.
pub fn run_with_db(db_path: &Path, command: Command) -> Result<()> {
    let store = Arc::new(SqliteChurnStore::open(db_path)?);
    store.migrate()?;
    run_command(command, &store)
}

/// # Errors
/// Returns an error when the command fails against `store`.
pub fn run_command(command: Command, store: &Arc<SqliteChurnStore>) -> Result<()> {
    match command {
        Command::Db { command } => match *command {
            DbCommand::Migrate => {
                let version = store.schema_version()?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "schema_version": version }))?
                );
                Ok(())
            }
        },
        Command::Record { command } => run_record(*command, store),
        Command::Feedback { command } => run_feedback(*command, store),
        Command::Ledger { command } => run_ledger(*command, store),
    }
}

fn run_record(command: RecordCommand, store: &SqliteChurnStore) -> Result<()> {
    match command {
        RecordCommand::Show(args) => {
            let record = store.get(args.customer_id).map_err(not_found_message)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        RecordCommand::Latest => {
            let Some(record) = store.latest()? else {
                return Err(anyhow!("no churn records stored"));
            };
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
    }
}

fn run_feedback(command: FeedbackCommand, store: &Arc<SqliteChurnStore>) -> Result<()> {
    match command {
        FeedbackCommand::Record(args) => {
            let policy = FeedbackPolicy {
                retrain_threshold: args.retrain_threshold,
                retrain_mode: args.retrain_mode.into(),
            };
            let controller = FeedbackController::new(
                store.clone(),
                store.clone(),
                Arc::new(NoopRetrainInvoker),
                policy,
            )?;

            let actual_output = ChurnLabel::try_from(args.actual_output)?;
            let outcome = controller
                .record_outcome(args.customer_id, actual_output)
                .map_err(not_found_message)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
            Ok(())
        }
    }
}

fn run_ledger(command: LedgerCommand, store: &SqliteChurnStore) -> Result<()> {
    match command {
        LedgerCommand::Count(args) => {
            let count = store.count()?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&json!({ "wrongCount": count }))?
                );
            } else {
                println!("wrong_count={count}");
            }
            Ok(())
        }
        LedgerCommand::List(args) => {
            let entries = store.entries(args.limit)?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&entries)?);
            } else {
                print_ledger_table(&entries)?;
            }
            Ok(())
        }
        LedgerCommand::Export(args) => {
            let entries = store.entries(None)?;
            let payload = serde_json::to_string_pretty(&entries)?;
            std::fs::write(&args.output, payload).with_context(|| {
                format!("failed to write ledger export to {}", args.output.display())
            })?;
            tracing::info!(
                entries = entries.len(),
                output = %args.output.display(),
                "misprediction ledger exported"
            );
            println!(
                "{}",
                serde_json::to_string_pretty(&json!({
                    "exported": entries.len(),
                    "output": args.output.display().to_string(),
                }))?
            );
            Ok(())
        }
    }
}

fn not_found_message(err: FeedbackError) -> anyhow::Error {
    match err {
        FeedbackError::NotFound(customer_id) => {
            anyhow!("churn record not found for customer {customer_id}")
        }
        other => anyhow::Error::new(other),
    }
}

fn print_ledger_table(entries: &[MispredictionEntry]) -> Result<()> {
    println!(
        "{:<26} {:<12} {:<9} {:<6} {:<8} {:<8} recorded_at",
        "entry_id", "customer_id", "predicted", "actual", "coupons", "cashback"
    );
    println!("{}", "-".repeat(100));

    for entry in entries {
        println!(
            "{:<26} {:<12} {:<9} {:<6} {:<8} {:<8} {}",
            entry.entry_id,
            entry.customer_id,
            entry.predicted_output,
            entry.actual_output,
            format_incentive(entry.coupons),
            format_incentive(entry.cashback),
            format_rfc3339(entry.recorded_at)?
        );
    }
    Ok(())
}

fn format_incentive(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |inner| inner.to_string())
}

