//! Warden Policy Compiler - operator CLI
//!
//! - `validate <EXPR>` checks a dynamic-rule expression
//! - `compile --snapshot <FILE>` compiles every rule of a JSON snapshot
//!   (rules, scopes, group memberships) and prints the compiled
//!   assignments and resync requests as JSON on stdout

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use warden_policy::{
    AssignmentStore, BlastRadius, CompiledAssignment, CompilerConfig, ExpressionValidator, MemoryStore,
    RecompilePipeline, ResyncTarget, Snapshot,
};

/// Warden policy compiler CLI
#[derive(Parser)]
#[command(name = "warden-compiler")]
#[command(about = "Compile binary-authorization scopes into assignments")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a dynamic-rule expression
    Validate {
        /// CEL expression
        expression: String,
    },

    /// Compile every rule in a snapshot
    Compile {
        /// JSON snapshot with rules, scopes and groups
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Compile only these rules
        #[arg(long = "rule")]
        rules: Vec<String>,
    },
}

#[derive(Serialize)]
struct CompileReport {
    rules: Vec<RuleReport>,
    resync: Vec<ResyncTarget>,
}

#[derive(Serialize)]
struct RuleReport {
    rule_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    assignments: Vec<CompiledAssignment>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr, reports to stdout
    let log_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("{},warden_policy={}", log_level, log_level).into()),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true)
        .init();

    let config = match &cli.config {
        Some(path) => CompilerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => CompilerConfig::default(),
    };

    match cli.command {
        Command::Validate { expression } => validate(&config, &expression),
        Command::Compile { snapshot, rules } => compile(&config, snapshot, rules).await,
    }
}

fn validate(config: &CompilerConfig, expression: &str) -> Result<()> {
    let validator = ExpressionValidator::new(config.validator.max_expression_len)?;
    validator
        .validate(expression)
        .with_context(|| format!("invalid expression: {}", expression))?;

    println!("ok");
    Ok(())
}

async fn compile(config: &CompilerConfig, path: PathBuf, only: Vec<String>) -> Result<()> {
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("reading snapshot {}", path.display()))?;
    let snapshot: Snapshot = serde_json::from_str(&contents)
        .with_context(|| format!("parsing snapshot {}", path.display()))?;

    let store = Arc::new(MemoryStore::from_snapshot(snapshot).await?);
    let rule_ids = if only.is_empty() {
        store.rule_ids().await
    } else {
        only
    };
    info!("Compiling {} rules from {}", rule_ids.len(), path.display());

    let pipeline = RecompilePipeline::from_store(store.clone(), config.resync.max_targeted);
    let results = pipeline.run_batch(&rule_ids, BlastRadius::Diff).await;

    let mut rules = Vec::with_capacity(results.len());
    for (rule_id, result) in results {
        let report = match result {
            Ok(outcome) => RuleReport {
                assignments: store.list_assignments(&rule_id).await?,
                rule_id,
                fingerprint: Some(outcome.fingerprint),
                error: None,
            },
            Err(e) => RuleReport {
                rule_id,
                fingerprint: None,
                error: Some(e.to_string()),
                assignments: Vec::new(),
            },
        };
        rules.push(report);
    }

    let report = CompileReport {
        rules,
        resync: store.take_resync_requests(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
