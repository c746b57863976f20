//! exprx - expression VM CLI
//!
//! Expressions and contexts are JSON; words are written as strings (`"42"` or `"0x2a"`).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use expr_vm::{
    cid, deserialize, disassemble, serialize, verify, Context, Expression, MemStore, OpTable,
    Outcome, ScopedStore, Store, VerifiedExpression, VerifyConfig, Vm, VmConfig,
};
use ruint::aliases::U256;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "exprx")]
#[command(about = "Verify, build, inspect and evaluate expression VM states")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify an expression JSON file and print its shape
    Verify {
        #[arg(short, long)]
        expression: PathBuf,
    },
    /// Verify an expression and write its serialized state
    Build {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print a listing of a serialized state
    Disasm {
        /// Serialized state file
        state: PathBuf,
    },
    /// Evaluate one entrypoint of a serialized state
    Eval {
        #[arg(short, long)]
        state: PathBuf,
        /// JSON grid `[[word, ...], ...]`, indexed `[column][row]`
        #[arg(short, long)]
        context: Option<PathBuf>,
        #[arg(long, default_value_t = 0)]
        source: usize,
        /// JSON store file (`[[key, value], ...]`); writes are applied with `--commit`
        #[arg(long)]
        store: Option<PathBuf>,
        /// Scope store keys to this caller namespace
        #[arg(long)]
        namespace: Option<u64>,
        #[arg(long)]
        commit: bool,
        /// Include the per-instruction trace in the output
        #[arg(long)]
        trace: bool,
    },
    /// Print the content id (BLAKE3) of a file
    Cid {
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let table = OpTable::standard();

    match cli.command {
        Commands::Verify { expression } => {
            let verified = load_expression(&table, &expression)?;
            let entrypoints: Vec<usize> = verified
                .entrypoints()
                .iter()
                .enumerate()
                .filter_map(|(i, e)| e.then_some(i))
                .collect();
            println!("✅ Expression verified");
            println!("   Sources: {}", verified.source_count());
            println!("   Entrypoints: {:?}", entrypoints);
            println!("   Constants: {}", verified.constants().len());
            println!("   Stack capacity: {}", verified.stack_capacity());
            println!("   CID: {}", cid(&serialize(&verified)).0);
        }

        Commands::Build { input, output } => {
            let verified = load_expression(&table, &input)?;
            let bytes = serialize(&verified);
            let id = cid(&bytes);
            let output = output.unwrap_or_else(|| input.with_extension("exvm"));
            std::fs::write(&output, &bytes)
                .with_context(|| format!("state write: {}", output.display()))?;
            info!(cid = %id.0, bytes = bytes.len(), "state written");
            println!("✅ Built {}", output.display());
            println!("   Size: {} bytes", bytes.len());
            println!("   CID: {}", id.0);
        }

        Commands::Disasm { state } => {
            let expr = load_state(&table, &state)?;
            print!("{}", disassemble(&expr));
        }

        Commands::Eval {
            state,
            context,
            source,
            store,
            namespace,
            commit,
            trace,
        } => {
            if commit && store.is_none() {
                bail!("--commit needs --store");
            }
            let expr = load_state(&table, &state)?;
            let context: Context = match &context {
                Some(path) => read_json(path)?,
                None => Vec::new(),
            };
            let mut backing: MemStore = match &store {
                Some(path) if path.exists() => read_json(path)?,
                _ => MemStore::new(),
            };
            let mut cfg = VmConfig::from_env();
            cfg.trace |= trace;

            let outcome = match namespace {
                Some(ns) => {
                    let mut scoped = ScopedStore::new(U256::from(ns), &mut backing);
                    evaluate(&table, cfg, &mut scoped, &expr, source, &context, commit)?
                }
                None => evaluate(&table, cfg, &mut backing, &expr, source, &context, commit)?,
            };

            if let (true, Some(path)) = (commit, &store) {
                std::fs::write(path, serde_json::to_vec_pretty(&backing)?)
                    .with_context(|| format!("store write: {}", path.display()))?;
            }
            println!("{}", serde_json::to_string_pretty(&report(&outcome, trace))?);
        }

        Commands::Cid { file } => {
            let bytes =
                std::fs::read(&file).with_context(|| format!("read: {}", file.display()))?;
            println!("{}", cid(&bytes).0);
        }
    }

    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,expr_vm=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse: {}", path.display()))
}

fn load_expression(table: &OpTable, path: &Path) -> Result<VerifiedExpression> {
    let expression: Expression = read_json(path)?;
    let verified = verify(table, expression, &VerifyConfig::from_env())
        .with_context(|| format!("verify: {}", path.display()))?;
    Ok(verified)
}

fn load_state(table: &OpTable, path: &Path) -> Result<VerifiedExpression> {
    let bytes = std::fs::read(path).with_context(|| format!("read: {}", path.display()))?;
    let expr = deserialize(&bytes, table, &VerifyConfig::from_env()).with_context(|| format!("decode: {}", path.display()))?;
    debug!(cid = %cid(&bytes).0, "state loaded");
    Ok(expr)
}

fn evaluate<S: Store>(
    table: &OpTable,
    cfg: VmConfig,
    store: &mut S,
    expr: &VerifiedExpression,
    source: usize,
    context: &Context,
    commit: bool,
) -> Result<Outcome> {
    let outcome = Vm::new(table, cfg, &*store).evaluate(expr, source, context)?;
    if commit {
        outcome.commit(store);
    }
    Ok(outcome)
}

fn report(outcome: &Outcome, trace: bool) -> serde_json::Value {
    let words = |ws: &[U256]| ws.iter().map(|w| w.to_string()).collect::<Vec<_>>();
    let writes: Vec<[String; 2]> = outcome
        .writes
        .iter()
        .map(|(k, v)| [k.to_string(), v.to_string()])
        .collect();
    let mut out = serde_json::json!({
        "stack": words(&outcome.stack),
        "writes": writes,
        "steps": outcome.steps,
        "fuel_used": outcome.fuel_used,
    });
    if trace {
        out["trace"] = serde_json::json!(outcome.trace);
    }
    out
}
