//! CLI command definitions for keyed-queue.
//!
//! The only command, `simulate`, drives a synthetic workload through a
//! scheduler and reports how the tasks ended up.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use parking_lot::Mutex;
use rand::RngExt;
use serde::Serialize;
use tracing::info;

use crate::config::SchedulerConfig;
use crate::error::TaskError;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{Scheduler, ShutdownPolicy, ShutdownReport, TaskContext};

/// Keyed, ordered, retrying task scheduler.
#[derive(Parser)]
#[command(name = "keyed-queue")]
#[command(about = "Run workloads through a keyed, ordered, retrying task scheduler")]
#[command(version)]
#[command(
    long_about = "keyed-queue runs tasks one after another per queue key and concurrently across keys, retrying transient failures with backoff.\n\nExample usage:\n  keyed-queue simulate --keys 8 --tasks 500 --transient-rate 0.2 --json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Push a synthetic workload with injected failures and report the outcome.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),
}

/// Arguments for `keyed-queue simulate`.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Number of distinct queue keys.
    #[arg(short = 'k', long, default_value = "8")]
    pub keys: usize,

    /// Total number of tasks to push, spread round-robin over the keys.
    #[arg(short = 'n', long, default_value = "200")]
    pub tasks: usize,

    /// Worker count (overrides KEYED_QUEUE_WORKERS; 0 = one per CPU).
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Probability that an attempt fails with a transient error.
    #[arg(long, default_value = "0.1")]
    pub transient_rate: f64,

    /// Probability that a task fails with a terminal error.
    #[arg(long, default_value = "0.02")]
    pub terminal_rate: f64,

    /// Probability that a task body panics.
    #[arg(long, default_value = "0.0")]
    pub panic_rate: f64,

    /// Retry budget per task (overrides KEYED_QUEUE_RETRIES).
    #[arg(short = 'r', long)]
    pub retries: Option<u32>,

    /// Delay before the first retry in milliseconds (overrides KEYED_QUEUE_BASE_DELAY_MS).
    #[arg(long)]
    pub base_delay_ms: Option<u64>,

    /// Simulated work per attempt in milliseconds.
    #[arg(long, default_value = "2")]
    pub work_ms: u64,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// How a simulated task ends once its transient failures are used up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeed,
    Terminal,
    Panic,
}

/// Pre-rolled behaviour of one simulated task.
#[derive(Debug, Clone, Copy)]
struct TaskPlan {
    transient_failures: u32,
    outcome: Outcome,
}

#[derive(Debug, Serialize)]
struct SimulationReport {
    keys: usize,
    tasks: usize,
    workers: usize,
    elapsed_ms: u64,
    order_violations: usize,
    shutdown: ShutdownReport,
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
///
/// For more control over logging initialization, use `parse_cli()` and
/// `run_with_cli()`.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Simulate(args) => run_simulate_command(args).await,
    }
}

// ============================================================================
// Simulate Command Implementation
// ============================================================================

async fn run_simulate_command(args: SimulateArgs) -> anyhow::Result<()> {
    validate_rates(&args)?;
    if args.keys == 0 {
        anyhow::bail!("--keys must be at least 1");
    }

    if args.metrics {
        init_metrics().map_err(|e| anyhow::anyhow!("Failed to initialize metrics: {}", e))?;
    }

    let config = build_config(&args)?;
    let plans = roll_plans(&args, config.retries);
    let scheduler = Scheduler::start(config)?;

    info!(
        keys = args.keys,
        tasks = args.tasks,
        workers = scheduler.stats().num_workers,
        "Starting simulation"
    );

    // First-attempt start order per key, used to check FIFO afterwards.
    let started: Arc<Mutex<HashMap<String, Vec<usize>>>> = Arc::new(Mutex::new(HashMap::new()));
    let work = Duration::from_millis(args.work_ms);
    let start_time = Instant::now();

    for (seq, plan) in plans.into_iter().enumerate() {
        let key = format!("key-{}", seq % args.keys);
        let name = format!("task-{}", seq);
        let started = Arc::clone(&started);

        scheduler.push_task(&key, &name, move |ctx: TaskContext| {
            let started = Arc::clone(&started);
            async move {
                if ctx.attempt == 0 {
                    started
                        .lock()
                        .entry(ctx.queue_key.clone())
                        .or_default()
                        .push(seq);
                }
                if !work.is_zero() {
                    tokio::time::sleep(work).await;
                }
                if ctx.attempt < plan.transient_failures {
                    return Err(TaskError::Network(format!(
                        "simulated connection reset on attempt {}",
                        ctx.attempt
                    )));
                }
                match plan.outcome {
                    Outcome::Succeed => Ok(()),
                    Outcome::Terminal => Err(TaskError::Duplicate(format!(
                        "simulated duplicate key for task {}",
                        seq
                    ))),
                    Outcome::Panic => panic!("simulated panic in task {}", seq),
                }
            }
        })?;
    }

    let shutdown = scheduler.shutdown(ShutdownPolicy::Drain).await?;
    let order_violations = count_order_violations(&started.lock());

    let report = SimulationReport {
        keys: args.keys,
        tasks: args.tasks,
        workers: shutdown.stats.num_workers,
        elapsed_ms: start_time.elapsed().as_millis() as u64,
        order_violations,
        shutdown,
    };

    if args.json {
        let json_output = serde_json::to_string_pretty(&report)
            .map_err(|e| anyhow::anyhow!("Failed to serialize simulation JSON: {}", e))?;
        println!("{}", json_output);
    } else {
        print_report(&report);
    }

    if args.metrics {
        print!("{}", export_metrics());
    }

    if report.order_violations > 0 {
        anyhow::bail!(
            "{} queue keys ran tasks out of order",
            report.order_violations
        );
    }
    Ok(())
}

fn validate_rates(args: &SimulateArgs) -> anyhow::Result<()> {
    for (flag, rate) in [
        ("--transient-rate", args.transient_rate),
        ("--terminal-rate", args.terminal_rate),
        ("--panic-rate", args.panic_rate),
    ] {
        if !(0.0..=1.0).contains(&rate) {
            anyhow::bail!("{} must be between 0 and 1, got {}", flag, rate);
        }
    }
    if args.terminal_rate + args.panic_rate > 1.0 {
        anyhow::bail!("--terminal-rate and --panic-rate must not sum above 1");
    }
    // A transient rate of 1 would roll failures forever.
    if args.transient_rate >= 1.0 {
        anyhow::bail!("--transient-rate must be below 1");
    }
    Ok(())
}

fn build_config(args: &SimulateArgs) -> anyhow::Result<SchedulerConfig> {
    let mut config = SchedulerConfig::from_env()?;
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(retries) = args.retries {
        config.retries = retries;
    }
    if let Some(base_delay_ms) = args.base_delay_ms {
        config.base_delay = Duration::from_millis(base_delay_ms);
        config.max_delay = config.max_delay.max(config.base_delay);
    }
    config.validate()?;
    Ok(config)
}

/// Rolls every task's behaviour up front so bodies stay deterministic
/// across retries.
fn roll_plans(args: &SimulateArgs, retries: u32) -> Vec<TaskPlan> {
    let mut rng = rand::rng();
    (0..args.tasks)
        .map(|_| {
            let mut transient_failures = 0;
            while transient_failures <= retries && rng.random_range(0.0..1.0) < args.transient_rate {
                transient_failures += 1;
            }
            let roll: f64 = rng.random_range(0.0..1.0);
            let outcome = if roll < args.panic_rate {
                Outcome::Panic
            } else if roll < args.panic_rate + args.terminal_rate {
                Outcome::Terminal
            } else {
                Outcome::Succeed
            };
            TaskPlan {
                transient_failures,
                outcome,
            }
        })
        .collect()
}

/// Number of keys whose tasks did not start in push order.
fn count_order_violations(started: &HashMap<String, Vec<usize>>) -> usize {
    started
        .values()
        .filter(|seqs| seqs.windows(2).any(|pair| pair[0] > pair[1]))
        .count()
}

fn print_report(report: &SimulationReport) {
    let stats = &report.shutdown.stats;
    println!("Simulation finished in {} ms", report.elapsed_ms);
    println!("  keys:               {}", report.keys);
    println!("  tasks:              {}", report.tasks);
    println!("  workers:            {}", report.workers);
    println!("  succeeded:          {}", stats.succeeded);
    println!("  dropped (terminal): {}", stats.dropped_terminal);
    println!("  dropped (panic):    {}", stats.dropped_panicked);
    println!("  dropped (retries):  {}", stats.dropped_exhausted);
    println!("  discarded:          {}", stats.discarded);
    println!("  retries:            {}", stats.retries);
    println!("  attempts:           {}", stats.attempts);
    println!("  success rate:       {:.1}%", stats.success_rate());
    println!("  order violations:   {}", report.order_violations);
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn simulate_args(extra: &[&str]) -> SimulateArgs {
        let mut argv = vec!["keyed-queue", "simulate"];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).expect("should parse").command {
            Commands::Simulate(args) => args,
        }
    }

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_simulate_command_defaults() {
        let args = simulate_args(&[]);

        assert_eq!(args.keys, 8);
        assert_eq!(args.tasks, 200);
        assert!(args.workers.is_none());
        assert!(args.retries.is_none());
        assert!((args.transient_rate - 0.1).abs() < f64::EPSILON);
        assert!((args.panic_rate - 0.0).abs() < f64::EPSILON);
        assert!(!args.json);
        assert!(!args.metrics);
    }

    #[test]
    fn test_simulate_command_with_all_options() {
        let args = simulate_args(&[
            "-k",
            "3",
            "-n",
            "50",
            "-w",
            "2",
            "--transient-rate",
            "0.5",
            "--terminal-rate",
            "0.1",
            "--panic-rate",
            "0.05",
            "-r",
            "4",
            "--base-delay-ms",
            "1",
            "--work-ms",
            "0",
            "--json",
            "--metrics",
        ]);

        assert_eq!(args.keys, 3);
        assert_eq!(args.tasks, 50);
        assert_eq!(args.workers, Some(2));
        assert_eq!(args.retries, Some(4));
        assert_eq!(args.base_delay_ms, Some(1));
        assert_eq!(args.work_ms, 0);
        assert!(args.json);
        assert!(args.metrics);
    }

    #[test]
    fn test_global_log_level() {
        let cli = Cli::try_parse_from(["keyed-queue", "simulate", "--log-level", "debug"])
            .expect("should parse");
        assert_eq!(cli.log_level, "debug");
    }

    #[test]
    fn test_validate_rates() {
        assert!(validate_rates(&simulate_args(&[])).is_ok());
        assert!(validate_rates(&simulate_args(&["--transient-rate", "1.5"])).is_err());
        assert!(validate_rates(&simulate_args(&["--transient-rate", "1.0"])).is_err());
        assert!(
            validate_rates(&simulate_args(&["--terminal-rate", "0.7", "--panic-rate", "0.6"]))
                .is_err()
        );
    }

    #[test]
    fn test_roll_plans_respects_rates() {
        let args = simulate_args(&["-n", "20", "--transient-rate", "0", "--terminal-rate", "0"]);
        let plans = roll_plans(&args, 10);

        assert_eq!(plans.len(), 20);
        assert!(plans
            .iter()
            .all(|p| p.transient_failures == 0 && p.outcome == Outcome::Succeed));

        let args = simulate_args(&["-n", "20", "--terminal-rate", "1"]);
        assert!(roll_plans(&args, 10)
            .iter()
            .all(|p| p.outcome == Outcome::Terminal));
    }

    #[test]
    fn test_count_order_violations() {
        let mut started = HashMap::new();
        started.insert("a".to_string(), vec![0, 2, 4]);
        started.insert("b".to_string(), vec![1, 5, 3]);
        assert_eq!(count_order_violations(&started), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_simulate_small_workload() {
        let args = simulate_args(&[
            "-k",
            "3",
            "-n",
            "30",
            "-w",
            "3",
            "--transient-rate",
            "0.3",
            "--terminal-rate",
            "0.1",
            "-r",
            "3",
            "--base-delay-ms",
            "1",
            "--work-ms",
            "0",
            "--json",
        ]);
        run_simulate_command(args).await.expect("simulation succeeds");
    }
}
