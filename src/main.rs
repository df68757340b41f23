//! Purpose: `postbus` CLI entry point for deployment-level queue maintenance.
//! Role: Binary crate root; parses args, runs commands, emits JSON on stdout.
//! Invariants: Successful command output is JSON on stdout; errors are JSON on stderr.
//! Invariants: Process exit code is derived from `api::to_exit_code`.
//! Invariants: All queue mutations go through the public `api` surface.
#![allow(clippy::result_large_err)]
use std::collections::BTreeSet;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde_json::{json, Map, Value};

use postbus::api::{to_exit_code, Environment, Error};
use postbus::config::{DeployConfig, QueueEntry};
use postbus::notice::{notice_json, Notice, NoticeKind};

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

#[derive(Parser, Debug)]
#[command(name = "postbus", version, about = "Persistent pub/sub queues over LMDB")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize every queue listed in the deployment config.
    Initialize { config: PathBuf },
    /// Reclaim dangling messages from every queue in the config.
    PruneDangling { config: PathBuf },
    /// Empty all subscriber queues and zero pending counts.
    ClearAll { config: PathBuf },
    /// Verify queue invariants; exits non-zero when issues are found.
    Check { config: PathBuf },
}

fn main() {
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err(err) => {
            emit_error(&err);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn run() -> Result<RunOutcome, Error> {
    let cli = Cli::parse();
    match cli.command {
        Command::Initialize { config } => run_initialize(&config),
        Command::PruneDangling { config } => run_prune_dangling(&config),
        Command::ClearAll { config } => run_clear_all(&config),
        Command::Check { config } => run_check(&config),
    }
}

fn run_initialize(config_path: &PathBuf) -> Result<RunOutcome, Error> {
    let config = DeployConfig::load(config_path)?;
    let mut initialized = Vec::new();
    for (queue_path, entry) in &config.queues {
        let environment = open_environment(queue_path, entry)?;
        let control = environment.control();
        let subscriber_ids: BTreeSet<String> = entry.subscribers.iter().cloned().collect();
        let reinitialized =
            control.initialize(&subscriber_ids, entry.high_water_mark(), entry.strategy()?)?;
        if reinitialized {
            emit_notice(&Notice::new(
                NoticeKind::Reinit,
                "initialize",
                queue_path,
                "queue was already initialized; parameters rewritten",
            ));
        }
        initialized.push(json!({
            "queue": queue_path,
            "subscribers": subscriber_ids.len(),
        }));
    }
    emit_json(json!({ "initialized": initialized }));
    Ok(RunOutcome::ok())
}

fn run_prune_dangling(config_path: &PathBuf) -> Result<RunOutcome, Error> {
    let config = DeployConfig::load(config_path)?;
    let mut pruned = Vec::new();
    for (queue_path, entry) in &config.queues {
        let environment = open_environment(queue_path, entry)?;
        let stats = environment.control().prune_dangling_messages()?;
        if stats.dangling_reclaimed > 0 {
            emit_notice(
                &Notice::new(
                    NoticeKind::Reclaim,
                    "prune-dangling",
                    queue_path,
                    format!("reclaimed {} dangling message(s)", stats.dangling_reclaimed),
                )
                .with_detail("reclaimed_count", stats.dangling_reclaimed),
            );
        }
        pruned.push(json!({
            "queue": queue_path,
            "dangling_reclaimed": stats.dangling_reclaimed,
        }));
    }
    emit_json(json!({ "pruned": pruned }));
    Ok(RunOutcome::ok())
}

fn run_clear_all(config_path: &PathBuf) -> Result<RunOutcome, Error> {
    let config = DeployConfig::load(config_path)?;
    let mut cleared = Vec::new();
    for (queue_path, entry) in &config.queues {
        let environment = open_environment(queue_path, entry)?;
        environment.control().clear_all_subscribers()?;
        cleared.push(json!({ "queue": queue_path }));
    }
    emit_json(json!({ "cleared": cleared }));
    Ok(RunOutcome::ok())
}

fn run_check(config_path: &PathBuf) -> Result<RunOutcome, Error> {
    let config = DeployConfig::load(config_path)?;
    let mut reports = Vec::new();
    let mut all_consistent = true;
    for (queue_path, entry) in &config.queues {
        let environment = open_environment(queue_path, entry)?;
        let report = environment.control().check()?;
        all_consistent &= report.is_consistent();
        let issues: Vec<Value> = report
            .issues
            .iter()
            .map(|issue| {
                json!({
                    "code": issue.code,
                    "message": issue.message,
                    "msg_id": issue.msg_id,
                })
            })
            .collect();
        reports.push(json!({
            "queue": queue_path,
            "consistent": report.is_consistent(),
            "issues": issues,
        }));
    }
    emit_json(json!({ "check": reports }));
    if all_consistent {
        Ok(RunOutcome::ok())
    } else {
        Ok(RunOutcome::with_code(1))
    }
}

fn open_environment(queue_path: &str, entry: &QueueEntry) -> Result<Environment, Error> {
    Environment::with_options(queue_path, entry.environment_options())
}

fn emit_json(value: Value) {
    println!("{value}");
}

fn emit_error(err: &Error) {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), Value::from(format!("{:?}", err.kind())));
    if let Some(message) = err.message() {
        inner.insert("message".to_string(), Value::from(message));
    }
    if let Some(path) = err.path() {
        inner.insert(
            "queue".to_string(),
            Value::from(path.to_string_lossy().to_string()),
        );
    }
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), Value::from(hint));
    }
    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    eprintln!("{}", Value::Object(outer));
}

fn emit_notice(notice: &Notice) {
    eprintln!("{}", notice_json(notice));
}
