//! CLI command definitions for jobgate.
//!
//! The only command, `simulate`, pushes a synthetic workload through a
//! dispatcher and reports how it drained. It is useful for sizing the
//! concurrency limit and timeout before wiring real jobs in.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use clap::Parser;
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::dispatcher::{
    CancelToken, Dispatcher, DispatcherConfig, DispatcherStats, Job, RetryAll, RetryOnTimeout,
    RetryPolicy,
};
use crate::error::{DispatchError, JobError};

/// Bounded-concurrency job dispatcher.
#[derive(Parser)]
#[command(name = "jobgate")]
#[command(about = "Run jobs under a concurrency limit with timeouts, retries and drain barriers")]
#[command(version)]
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
    /// Push a synthetic workload through a dispatcher and report the result.
    #[command(alias = "sim")]
    Simulate(SimulateArgs),
}

/// Arguments for the simulate command.
#[derive(clap::Args, Debug, Clone)]
pub struct SimulateArgs {
    /// Number of jobs to submit up front.
    #[arg(short = 'n', long, default_value = "20")]
    pub jobs: u64,

    /// Maximum number of jobs in flight.
    #[arg(short, long, env = "JOBGATE_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Retries allowed after the first attempt.
    #[arg(long, env = "JOBGATE_RETRY_LIMIT")]
    pub retry_limit: Option<u32>,

    /// Per-attempt timeout in milliseconds.
    #[arg(long, env = "JOBGATE_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Shortest simulated attempt, in milliseconds.
    #[arg(long, default_value = "20")]
    pub min_latency_ms: u64,

    /// Longest simulated attempt, in milliseconds.
    #[arg(long, default_value = "400")]
    pub max_latency_ms: u64,

    /// Probability that an attempt fails with an application error.
    #[arg(long, default_value = "0.1")]
    pub failure_rate: f64,

    /// Probability that an attempt ignores cancellation and overruns its deadline.
    #[arg(long, default_value = "0.05")]
    pub hang_rate: f64,

    /// Probability that a successful job submits a follow-up job.
    #[arg(long, default_value = "0.0")]
    pub follow_up_rate: f64,

    /// Retry application errors too, not only timeouts.
    #[arg(long)]
    pub retry_failures: bool,

    /// Seed for reproducible runs.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Print the report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SimulateArgs {
    /// Builds the dispatcher configuration, starting from the defaults.
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let mut config = DispatcherConfig::default();
        if let Some(limit) = self.concurrency {
            config = config.with_concurrency_limit(limit);
        }
        if let Some(retries) = self.retry_limit {
            config = config.with_retry_limit(retries);
        }
        if let Some(ms) = self.timeout_ms {
            config = config.with_attempt_timeout(Duration::from_millis(ms));
        }
        config
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.min_latency_ms > self.max_latency_ms {
            anyhow::bail!("--min-latency-ms cannot exceed --max-latency-ms");
        }
        for (name, rate) in [
            ("--failure-rate", self.failure_rate),
            ("--hang-rate", self.hang_rate),
            ("--follow-up-rate", self.follow_up_rate),
        ] {
            if !(0.0..=1.0).contains(&rate) {
                anyhow::bail!("{} must be between 0.0 and 1.0", name);
            }
        }
        if self.failure_rate + self.hang_rate > 1.0 {
            anyhow::bail!("--failure-rate and --hang-rate together cannot exceed 1.0");
        }
        Ok(())
    }
}

/// Parse command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Simulate(args) => run_simulate_command(args).await,
    }
}

// ============================================================================
// Simulate Command Implementation
// ============================================================================

/// What one simulated attempt will do.
#[derive(Debug, Clone, Copy, PartialEq)]
enum AttemptPlan {
    Succeed(Duration),
    Fail(Duration),
    /// Ignore cancellation and keep running for this long.
    Overrun(Duration),
}

impl AttemptPlan {
    fn sample<R: RngExt + ?Sized>(rng: &mut R, args: &SimulateArgs, timeout: Duration) -> Self {
        let latency =
            Duration::from_millis(rng.random_range(args.min_latency_ms..=args.max_latency_ms));
        let roll: f64 = rng.random_range(0.0..1.0);
        if roll < args.hang_rate {
            AttemptPlan::Overrun(timeout + latency)
        } else if roll < args.hang_rate + args.failure_rate {
            AttemptPlan::Fail(latency)
        } else {
            AttemptPlan::Succeed(latency)
        }
    }
}

/// State shared by every simulated job.
struct Simulation {
    dispatcher: Dispatcher,
    args: SimulateArgs,
    timeout: Duration,
    rng: Mutex<ChaCha8Rng>,
    follow_ups: AtomicU64,
}

impl Simulation {
    fn plan(&self) -> (AttemptPlan, bool) {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        let plan = AttemptPlan::sample(&mut *rng, &self.args, self.timeout);
        let follow_up = rng.random_range(0.0..1.0) < self.args.follow_up_rate;
        (plan, follow_up)
    }
}

fn simulated_job(sim: Arc<Simulation>, index: u64) -> Job {
    Job::labeled(format!("sim-{}", index), move |token: CancelToken| {
        let sim = Arc::clone(&sim);
        let (plan, follow_up) = sim.plan();
        async move {
            match plan {
                AttemptPlan::Succeed(latency) => {
                    token
                        .run_until_cancelled(tokio::time::sleep(latency))
                        .await?;
                }
                AttemptPlan::Fail(latency) => {
                    token
                        .run_until_cancelled(tokio::time::sleep(latency))
                        .await?;
                    anyhow::bail!("simulated failure after {}ms", latency.as_millis());
                }
                AttemptPlan::Overrun(latency) => {
                    tokio::time::sleep(latency).await;
                    return Ok(());
                }
            }

            if follow_up {
                let n = sim.follow_ups.fetch_add(1, Ordering::SeqCst) + 1;
                sim.dispatcher
                    .add_job(simulated_job(Arc::clone(&sim), sim.args.jobs + n))?;
            }
            Ok::<(), anyhow::Error>(())
        }
    })
}

/// One terminal failure in the report.
#[derive(Debug, Clone, Serialize)]
struct FailureEntry {
    job_id: u64,
    attempt: u32,
    kind: &'static str,
    message: String,
}

impl From<&JobError> for FailureEntry {
    fn from(error: &JobError) -> Self {
        Self {
            job_id: error.job_id().get(),
            attempt: error.attempt(),
            kind: if error.is_timeout() { "timeout" } else { "failed" },
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct SimulationReport {
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    elapsed_ms: i64,
    seed: u64,
    config: DispatcherConfig,
    submitted: u64,
    follow_ups: u64,
    succeeded: bool,
    stats: DispatcherStats,
    failures: Vec<FailureEntry>,
}

async fn run_simulate_command(args: SimulateArgs) -> anyhow::Result<()> {
    args.validate()?;
    let config = args.dispatcher_config();
    let seed = args.seed.unwrap_or_else(|| rand::rng().random());

    let policy: Arc<dyn RetryPolicy> = if args.retry_failures {
        Arc::new(RetryAll)
    } else {
        Arc::new(RetryOnTimeout)
    };
    let span = tracing::info_span!("simulate", seed);
    let dispatcher = Dispatcher::with_parts(config.clone(), policy, span)?;

    info!(
        jobs = args.jobs,
        limit = config.concurrency_limit,
        retry_limit = config.retry_limit,
        timeout = ?config.attempt_timeout,
        seed,
        "Starting simulation"
    );

    let sim = Arc::new(Simulation {
        dispatcher: dispatcher.clone(),
        timeout: config.attempt_timeout,
        args: args.clone(),
        rng: Mutex::new(ChaCha8Rng::seed_from_u64(seed)),
        follow_ups: AtomicU64::new(0),
    });

    let started_at = Utc::now();
    for index in 1..=args.jobs {
        dispatcher.add_job(simulated_job(Arc::clone(&sim), index))?;
    }

    let outcome = if args.jobs == 0 {
        Ok(())
    } else {
        dispatcher.drained().await
    };
    let finished_at = Utc::now();

    let failures = match &outcome {
        Ok(()) => Vec::new(),
        Err(DispatchError::JobsFailed(failed)) => failed.iter().map(FailureEntry::from).collect(),
        Err(e) => return Err(anyhow::anyhow!("simulation aborted: {}", e)),
    };

    let report = SimulationReport {
        started_at,
        finished_at,
        elapsed_ms: (finished_at - started_at).num_milliseconds(),
        seed,
        config,
        submitted: args.jobs,
        follow_ups: sim.follow_ups.load(Ordering::SeqCst),
        succeeded: failures.is_empty(),
        stats: dispatcher.stats(),
        failures,
    };
    dispatcher.shutdown();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    if !report.succeeded {
        warn!(failed = report.failures.len(), "Simulation finished with failures");
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    let stats = &report.stats;
    println!("Simulation finished in {}ms (seed {})", report.elapsed_ms, report.seed);
    println!(
        "  limit {}  retry limit {}  timeout {}ms",
        report.config.concurrency_limit,
        report.config.retry_limit,
        report.config.attempt_timeout.as_millis()
    );
    println!(
        "  jobs: {} submitted, {} follow-ups, {} completed, {} failed ({:.1}% success)",
        report.submitted,
        report.follow_ups,
        stats.jobs_completed,
        stats.jobs_failed,
        stats.success_rate()
    );
    println!(
        "  attempts: {} started, {} retries, {} timeouts, {} stale settlements",
        stats.attempts_started, stats.retries, stats.timeouts, stats.stale_settlements
    );
    println!(
        "  peak in flight: {}  average job duration: {}ms",
        stats.peak_pending,
        stats.average_job_duration.as_millis()
    );
    for failure in &report.failures {
        println!("  - {}", failure.message);
    }
}
