use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tally_ast::span::Span;
use tally_ast::ty::FormulaType;
use tally_cli::host::{parse_arg, ConnectorSpec, Host, HostConfig};
use tally_cli::services::TimeZoneInfo;
use tally_cli::trace::CallTracer;
use tally_cli::{CancellationToken, FunctionId, InvokeError};
use tally_types::{parse_json, FormulaValue};
use tracing_subscriber::EnvFilter;

/// Maximum input file size in bytes (1MB)
const MAX_INPUT_SIZE: u64 = 1_000_000;

/// Exit status for a cancelled or timed-out call.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "tally")]
#[command(about = "Tally: call formula functions with explicit services and connectors")]
struct Cli {
    /// Log dispatch at debug level (overrides TALLY_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Call one function with JSON literal arguments
    Call(CallArgs),

    /// Parse a JSON file the way ParseJSON does and print the value
    ParseJson {
        /// Path to a JSON file
        file: PathBuf,
    },

    /// List every registered function
    Functions {
        /// Connector to load, as NAMESPACE=DIR (repeatable)
        #[arg(long = "connector", value_name = "NAMESPACE=DIR")]
        connectors: Vec<ConnectorSpec>,
    },

    /// Summarize a recorded call trace
    Trace {
        /// Path to trace JSONL file
        trace_path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct CallArgs {
    /// Function name, optionally qualified as Namespace.Name
    function: String,

    /// Arguments as JSON literals
    #[arg(allow_negative_numbers = true)]
    args: Vec<String>,

    /// Namespace of the function (alternative to a qualified name)
    #[arg(long)]
    namespace: Option<String>,

    /// Result type the call site expects
    #[arg(long, default_value = "Untyped")]
    result_type: String,

    /// Connector to load, as NAMESPACE=DIR (repeatable)
    #[arg(long = "connector", value_name = "NAMESPACE=DIR")]
    connectors: Vec<ConnectorSpec>,

    /// Timezone as Z or +HH:MM
    #[arg(long)]
    timezone: Option<String>,

    /// Locale used to read numbers from text
    #[arg(long)]
    locale: Option<String>,

    /// Seed the random source
    #[arg(long)]
    seed: Option<u64>,

    /// Freeze the clock at an RFC 3339 instant
    #[arg(long)]
    now: Option<String>,

    /// Return connector responses as text
    #[arg(long)]
    raw: bool,

    /// Fail instead of returning connector errors as values
    #[arg(long)]
    throw_on_error: bool,

    /// Cancel the call after this many milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Write call trace to file (large values hashed)
    #[arg(long)]
    trace: Option<PathBuf>,

    /// Write call trace with all values recorded
    #[arg(long, conflicts_with = "trace")]
    trace_full: Option<PathBuf>,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env("TALLY_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Call(args) => cmd_call(args).await,
        Commands::ParseJson { file } => cmd_parse_json(&file).map(|()| ExitCode::SUCCESS),
        Commands::Functions { connectors } => {
            cmd_functions(connectors).map(|()| ExitCode::SUCCESS)
        }
        Commands::Trace { trace_path } => cmd_trace(&trace_path).map(|()| ExitCode::SUCCESS),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn read_input(path: &Path) -> Result<String> {
    let size = std::fs::metadata(path)
        .with_context(|| format!("reading {}", path.display()))?
        .len();
    if size > MAX_INPUT_SIZE {
        bail!(
            "{} exceeds {}MB limit ({} bytes)",
            path.display(),
            MAX_INPUT_SIZE / 1_000_000,
            size
        );
    }
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn host_config(args: &CallArgs) -> Result<HostConfig> {
    let timezone = match &args.timezone {
        Some(tz) => Some(
            TimeZoneInfo::parse(tz).with_context(|| format!("invalid timezone '{tz}'"))?,
        ),
        None => None,
    };
    let now = match &args.now {
        Some(text) => Some(
            DateTime::parse_from_rfc3339(text)
                .with_context(|| format!("invalid --now instant '{text}'"))?
                .with_timezone(&Utc),
        ),
        None => None,
    };
    Ok(HostConfig {
        connectors: args.connectors.clone(),
        timezone,
        locale: args.locale.clone(),
        seed: args.seed,
        now,
        throw_on_error: args.throw_on_error,
        raw_results: args.raw,
    })
}

fn open_tracer(args: &CallArgs) -> Result<Option<(Arc<Mutex<CallTracer>>, PathBuf)>> {
    let (path, full) = match (&args.trace, &args.trace_full) {
        (Some(p), _) => (p, false),
        (None, Some(p)) => (p, true),
        (None, None) => return Ok(None),
    };
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating trace file {}", path.display()))?;
    let tracer = CallTracer::new(Box::new(std::io::BufWriter::new(file)), full)?;
    Ok(Some((Arc::new(Mutex::new(tracer)), path.clone())))
}

async fn cmd_call(args: CallArgs) -> Result<ExitCode> {
    let result_type = FormulaType::from_name(&args.result_type)
        .with_context(|| format!("unknown result type '{}'", args.result_type))?;
    let id = match &args.namespace {
        Some(ns) => FunctionId::qualified(ns.clone(), args.function.clone()),
        None => FunctionId::parse(&args.function),
    };
    let values = args
        .args
        .iter()
        .map(|a| parse_arg(a))
        .collect::<Result<Vec<_>>>()?;

    let mut host = Host::new(&host_config(&args)?)?;
    let tracer = open_tracer(&args)?;
    if let Some((t, _)) = &tracer {
        host = host.with_tracer(Arc::clone(t));
    }

    let cancel = CancellationToken::new();
    let watchdog = {
        let cancel = cancel.clone();
        let timeout = args.timeout_ms.map(Duration::from_millis);
        tokio::spawn(async move {
            let elapsed = async {
                match timeout {
                    Some(d) => tokio::time::sleep(d).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("interrupted"),
                _ = elapsed => tracing::info!("timed out"),
                _ = cancel.cancelled() => return,
            }
            cancel.cancel();
        })
    };

    let outcome = host.call(&id, values, result_type, &cancel).await;
    cancel.cancel();
    let _ = watchdog.await;

    let (code, status) = match &outcome {
        Ok(FormulaValue::Error(_)) => (ExitCode::FAILURE, "error"),
        Ok(_) => (ExitCode::SUCCESS, "success"),
        Err(InvokeError::Cancelled) => (ExitCode::from(EXIT_CANCELLED), "cancelled"),
        Err(_) => (ExitCode::FAILURE, "error"),
    };

    if let Some((t, path)) = tracer {
        let mut t = t.lock().unwrap_or_else(PoisonError::into_inner);
        match t.finalize(status) {
            Ok(()) => eprintln!("Trace written to {}", path.display()),
            Err(e) => tracing::error!(error = %e, "trace finalize failed"),
        }
    }

    match outcome {
        Ok(FormulaValue::Error(e)) => eprintln!("{e}"),
        Ok(v) => println!("{v}"),
        Err(InvokeError::Cancelled) => eprintln!("Cancelled: {id}"),
        Err(e) => eprintln!("Error: {e}"),
    }
    Ok(code)
}

fn cmd_parse_json(file: &Path) -> Result<()> {
    let text = read_input(file)?;
    match parse_json(&text, Span::new(0, text.len() as u32)) {
        FormulaValue::Error(e) => bail!("{}", e.message),
        v => println!("{v}"),
    }
    Ok(())
}

fn cmd_functions(connectors: Vec<ConnectorSpec>) -> Result<()> {
    let host = Host::new(&HostConfig {
        connectors,
        ..Default::default()
    })?;
    for (id, f) in host.functions().functions() {
        let params: Vec<_> = f.params().iter().map(|p| p.name()).collect();
        let enums = match f.required_enums() {
            [] => "none".to_string(),
            names => names.join(", "),
        };
        println!(
            "{}({})\tinvariant: {}\tenums: {}",
            id,
            params.join(", "),
            f.invariant_name(),
            enums
        );
    }
    Ok(())
}

fn cmd_trace(trace_path: &Path) -> Result<()> {
    let content = read_input(trace_path)?;
    let records: Vec<serde_json::Value> = content
        .lines()
        .filter(|l| !l.is_empty())
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()
        .with_context(|| format!("parsing trace {}", trace_path.display()))?;

    let mut calls = Vec::new();
    for record in &records {
        match record.get("record").and_then(|r| r.as_str()) {
            Some("header") => {
                let version = record["schema_version"].as_str().unwrap_or("?");
                let full = record["full_values"].as_bool().unwrap_or(false);
                println!(
                    "Trace schema: v{}, mode: {}",
                    version,
                    if full { "full" } else { "audit (hashed)" }
                );
            }
            Some("call") => calls.push(record),
            _ => {}
        }
    }

    println!("Trace summary: {} calls", calls.len());
    for call in &calls {
        let seq = call["seq"].as_u64().unwrap_or(0);
        let function = call["function"].as_str().unwrap_or("?");
        let status = call["output"]["status"].as_str().unwrap_or("?");
        let duration = call["duration_ms"].as_u64().unwrap_or(0);
        println!("  [{}] {} - {}, {}ms", seq, function, status, duration);
    }

    if let Some(footer) = records
        .iter()
        .find(|r| r.get("record").and_then(|v| v.as_str()) == Some("footer"))
    {
        println!(
            "Result: {}, Trace: {}",
            footer["program_status"].as_str().unwrap_or("?"),
            footer["trace_status"].as_str().unwrap_or("?")
        );
    }
    Ok(())
}
