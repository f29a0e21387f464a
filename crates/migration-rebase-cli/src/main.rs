use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use migration_rebase_core::{
    chain_of, common_ancestor, RebaseContext, RebaseError, Rebaser, RevisionId, ScriptDirectory,
};
use migration_rebase_store_sqlite::SqliteEngine;
use serde_json::Value;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

mod config;

use config::Settings;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "mrb")]
#[command(about = "Rebase diverged migration script histories onto a single head")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'f', long = "config", default_value = "migrate.yaml")]
    config: PathBuf,

    /// Enable debug logging on stderr.
    #[arg(short, long, default_value_t = false)]
    verbose: bool,

    /// Script directory, overriding `script_location` from the config file.
    #[arg(long)]
    scripts: Option<PathBuf>,

    /// Database path, overriding `database` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Relocate BASE_HEAD's branch on top of TOP_HEAD and migrate the database.
    Rebase(HeadPairArgs),
    /// Print the rebase plan without touching files or the database.
    Plan(HeadPairArgs),
    /// Script-history heads and database heads.
    Heads,
    /// First-parent chain of a revision, oldest first.
    History(RevisionArgs),
    /// Latest common ancestor of two revisions.
    Ancestor(AncestorArgs),
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Upgrade(RevisionArgs),
    Downgrade(RevisionArgs),
    Status,
}

#[derive(Debug, Args)]
struct HeadPairArgs {
    /// Head whose branch is moved.
    base_head: RevisionId,
    /// Head that stays in place and receives the moved branch.
    top_head: RevisionId,
}

#[derive(Debug, Args)]
struct RevisionArgs {
    revision: RevisionId,
}

#[derive(Debug, Args)]
struct AncestorArgs {
    left: RevisionId,
    right: RevisionId,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            let fatal = err.downcast_ref::<RebaseError>().is_some_and(RebaseError::is_fatal);
            if fatal {
                eprintln!("error: the database may be between revisions; recover it manually");
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let settings = Settings::resolve(&cli.config, cli.scripts, cli.db)?;
    let scripts = ScriptDirectory::new(&settings.script_location);

    match cli.command {
        Command::Rebase(args) => run_rebase(&args, &settings, scripts),
        Command::Plan(args) => run_plan(&args, &settings, scripts),
        Command::Heads => run_heads(&settings, scripts),
        Command::History(args) => run_history(&args, &scripts),
        Command::Ancestor(args) => run_ancestor(&args, &scripts),
        Command::Db { command } => {
            let mut engine = open_engine(&settings, scripts)?;
            run_db(command, &mut engine)
        }
    }
}

fn open_engine(settings: &Settings, scripts: ScriptDirectory) -> Result<SqliteEngine> {
    SqliteEngine::open(&settings.database, scripts).with_context(|| {
        format!("failed to open migration database {}", settings.database.display())
    })
}

fn run_rebase(args: &HeadPairArgs, settings: &Settings, scripts: ScriptDirectory) -> Result<()> {
    let context = RebaseContext { scripts: scripts.clone() };
    let mut engine = open_engine(settings, scripts)?;
    let report = Rebaser::new(context, &mut engine).rebase(&args.top_head, &args.base_head)?;

    let mut payload = serde_json::to_value(&report)?;
    if let Value::Object(object) = &mut payload {
        object.insert("database_heads".to_string(), serde_json::to_value(engine.heads()?)?);
    }
    emit_json(payload)
}

fn run_plan(args: &HeadPairArgs, settings: &Settings, scripts: ScriptDirectory) -> Result<()> {
    let context = RebaseContext { scripts: scripts.clone() };
    let mut engine = open_engine(settings, scripts)?;
    let plan = Rebaser::new(context, &mut engine).plan(&args.top_head, &args.base_head)?;
    emit_json(serde_json::json!({
        "dry_run": true,
        "new_head": plan.new_head(),
        "plan": plan
    }))
}

fn run_heads(settings: &Settings, scripts: ScriptDirectory) -> Result<()> {
    let script_heads = scripts.heads()?;
    let engine = open_engine(settings, scripts)?;
    let database_heads = engine.heads()?;
    emit_json(serde_json::json!({
        "script_heads": script_heads,
        "database_heads": database_heads,
        "single_head": script_heads.len() == 1
    }))
}

fn run_history(args: &RevisionArgs, scripts: &ScriptDirectory) -> Result<()> {
    let chain = chain_of(scripts, &args.revision)?;
    emit_json(serde_json::json!({
        "revision": args.revision,
        "length": chain.len(),
        "chain": chain
    }))
}

fn run_ancestor(args: &AncestorArgs, scripts: &ScriptDirectory) -> Result<()> {
    let ancestor = common_ancestor(scripts, &args.left, &args.right)?;
    emit_json(serde_json::json!({
        "left": args.left,
        "right": args.right,
        "ancestor": ancestor
    }))
}

fn run_db(command: DbCommand, engine: &mut SqliteEngine) -> Result<()> {
    match command {
        DbCommand::Upgrade(args) => {
            let applied = engine.upgrade(&args.revision)?;
            emit_json(serde_json::json!({
                "direction": "upgrade",
                "target": args.revision,
                "applied": applied,
                "heads": engine.heads()?
            }))
        }
        DbCommand::Downgrade(args) => {
            let unapplied = engine.downgrade(&args.revision)?;
            emit_json(serde_json::json!({
                "direction": "downgrade",
                "target": args.revision,
                "unapplied": unapplied,
                "heads": engine.heads()?
            }))
        }
        DbCommand::Status => {
            let status = engine.status()?;
            let mut payload = serde_json::to_value(&status)?;
            if let Value::Object(object) = &mut payload {
                object.insert(
                    "up_to_date".to_string(),
                    Value::Bool(status.drifted.is_empty() && status.missing_scripts.is_empty()),
                );
            }
            emit_json(payload)
        }
    }
}
