//! Traceopt CLI
//!
//! Optimize traces written in the text format, run them against the
//! reference interpreter, and run random differential checks.

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;
use traceopt::ir::parser::parse_trace;
use traceopt::optimizer::{OptStats, OptimizerConfig, Pass};
use traceopt::selfcheck::{compare_source, run_selfcheck_with, Check};
use traceopt::unroll::UnrollOptimizer;
use traceopt::VERSION;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "traceopt")]
#[command(author, version, about = "An optimizer for tracing JIT traces", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output (-v for info, -vv for debug, -vvv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Args)]
struct ConfigArgs {
    /// JSON file with optimizer settings
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Optimize loops as straight lines instead of peeling them
    #[arg(long)]
    no_unroll: bool,

    /// Comma-separated passes to enable (default: all)
    #[arg(long, value_delimiter = ',')]
    passes: Option<Vec<String>>,
}

#[derive(Subcommand)]
enum Commands {
    /// Optimize a trace file and print the result
    Optimize {
        /// The trace file
        file: PathBuf,
        #[command(flatten)]
        config: ConfigArgs,
        /// Print traces and statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a trace before and after optimizing and compare the results
    Run {
        /// The trace file
        file: PathBuf,
        /// Comma-separated input values
        #[arg(long, value_delimiter = ',')]
        args: Vec<String>,
        /// Loop iterations to run
        #[arg(long, default_value_t = 10)]
        iterations: usize,
        #[command(flatten)]
        config: ConfigArgs,
    },

    /// Check randomly recorded traces against the reference interpreter
    Selfcheck {
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 100)]
        count: usize,
        #[command(flatten)]
        config: ConfigArgs,
    },
}

fn main() {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let result = match cli.command {
        Commands::Optimize { file, config, json } => optimize_file(&file, &config, json),
        Commands::Run {
            file,
            args,
            iterations,
            config,
        } => run_file(&file, &args, iterations, &config),
        Commands::Selfcheck { seed, count, config } => selfcheck(seed, count, &config),
    };
    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            std::process::exit(2);
        }
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Build the optimizer configuration from a config file and flags
fn load_config(args: &ConfigArgs) -> anyhow::Result<OptimizerConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("could not read config {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => OptimizerConfig::default(),
    };
    if args.no_unroll {
        config.unroll = false;
    }
    if let Some(passes) = &args.passes {
        config.passes = passes
            .iter()
            .map(|p| p.parse::<Pass>())
            .collect::<Result<_, _>>()
            .context("invalid --passes")?;
    }
    Ok(config)
}

fn read_trace(path: &Path) -> anyhow::Result<String> {
    fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))
}

#[derive(Serialize)]
struct JsonOutput {
    version: &'static str,
    traces: Vec<JsonTrace>,
    stats: OptStats,
}

#[derive(Serialize)]
struct JsonTrace {
    name: &'static str,
    text: String,
}

fn optimize_file(path: &Path, args: &ConfigArgs, json: bool) -> anyhow::Result<bool> {
    let config = load_config(args)?;
    let source = read_trace(path)?;
    let trace = parse_trace(&source).with_context(|| format!("could not parse {}", path.display()))?;

    let start = Instant::now();
    let mut optimizer = UnrollOptimizer::new(config);
    let compiled = optimizer
        .optimize(&trace)
        .with_context(|| format!("could not optimize {}", path.display()))?;
    let elapsed = start.elapsed();

    if json {
        let output = JsonOutput {
            version: VERSION,
            traces: compiled
                .traces()
                .into_iter()
                .map(|(name, trace)| JsonTrace {
                    name,
                    text: trace.to_string(),
                })
                .collect(),
            stats: optimizer.stats().clone(),
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for (name, trace) in compiled.traces() {
            println!("# {}", name);
            print!("{}", trace);
        }
        eprintln!("# {} ({:?})", optimizer.stats(), elapsed);
    }
    Ok(true)
}

fn run_file(path: &Path, inputs: &[String], iterations: usize, args: &ConfigArgs) -> anyhow::Result<bool> {
    let config = load_config(args)?;
    let source = read_trace(path)?;
    let comparison = compare_source(&source, inputs, &config, iterations)
        .with_context(|| format!("could not run {}", path.display()))?;

    println!("unoptimized: {}", comparison.expected);
    match &comparison.actual {
        Some(actual) => println!("optimized:   {}", actual),
        None => println!("optimized:   <none>"),
    }
    match comparison.check {
        Check::Same { .. } => {
            println!("match");
            Ok(true)
        }
        Check::Differs(reason) => {
            println!("MISMATCH: {}", reason);
            Ok(false)
        }
    }
}

fn selfcheck(seed: u64, count: usize, args: &ConfigArgs) -> anyhow::Result<bool> {
    let config = load_config(args)?;
    if count == 0 {
        bail!("--count must be at least 1");
    }
    let report = run_selfcheck_with(seed, count, &config).context("selfcheck could not run")?;
    print!("{}", report);
    Ok(report.is_clean())
}
