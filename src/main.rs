//! ParaBench CLI Entry Point
//!
//! Runs a benchmark suite against an external command-line tool.
//!
//! # Usage
//!
//! ```bash
//! # Run a suite with default settings
//! parabench suite.yaml
//!
//! # Use a config file and override the concurrency ceiling
//! parabench suite.yaml --config bench.yaml --parallel 8
//!
//! # Pick a placement algorithm and write reports elsewhere
//! parabench suite.yaml --algorithm work-stealing --report out/report.json
//!
//! # Repeat the first objective in rounds, scaling between rounds
//! parabench suite.yaml --adaptive
//! ```

use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::channel;
use std::sync::Arc;
use std::thread;

use colored::Colorize;
use log::{error, info, warn};

use parabench::config::{load_config, load_suite, BenchConfig, SuiteFile};
use parabench::monitoring::{MetricsProbe, MonitorConfig, PerformanceMonitor};
use parabench::orchestration::{OrchestrationManager, SuiteResult};
use parabench::scheduler::SchedulingAlgorithm;
use parabench::{APP_NAME, VERSION};

/// Default path of the detailed report.
const DEFAULT_REPORT: &str = "parabench-report.json";

/// Command-line options parsed from arguments.
#[derive(Debug, Default)]
struct CliOptions {
    suite_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    parallel: Option<usize>,
    algorithm: Option<SchedulingAlgorithm>,
    report_path: Option<PathBuf>,
    monitor_report: Option<PathBuf>,
    adaptive: bool,
    verbose: bool,
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Parallel benchmark runner");
    println!();
}

fn print_usage() {
    println!("Usage: parabench [OPTIONS] <SUITE_FILE>");
    println!();
    println!("Arguments:");
    println!("  <SUITE_FILE>            Suite YAML: command template and objectives");
    println!();
    println!("Options:");
    println!("  --config FILE           Benchmark config YAML");
    println!("  --parallel N            Maximum concurrent tasks");
    println!("  --algorithm NAME        dynamic | least-loaded | work-stealing");
    println!("  --report PATH           Detailed report path (default: {})", DEFAULT_REPORT);
    println!("  --monitor-report PATH   Write the performance monitor report");
    println!("  --adaptive              Run the first objective in adaptive rounds");
    println!("  --verbose               Enable debug logging");
    println!("  --help                  Show this help message");
    println!("  --version               Show version information");
    println!();
    println!("Examples:");
    println!("  parabench suite.yaml");
    println!("  parabench suite.yaml --config bench.yaml --parallel 8");
    println!("  parabench suite.yaml --algorithm least-loaded --report out/report.json");
}

fn next_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a String, String> {
    *i += 1;
    args.get(*i)
        .ok_or_else(|| format!("{} requires an argument", flag))
}

/// Parses command-line arguments into [`CliOptions`].
fn parse_arguments(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => options.verbose = true,
            "--adaptive" => options.adaptive = true,
            "--config" => {
                options.config_path = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--parallel" => {
                let value = next_value(args, &mut i, arg)?;
                let parallel: usize = value
                    .parse()
                    .map_err(|_| format!("Invalid parallel value: {}", value))?;
                if parallel == 0 {
                    return Err("--parallel must be at least 1".to_string());
                }
                options.parallel = Some(parallel);
            }
            "--algorithm" => {
                let value = next_value(args, &mut i, arg)?;
                options.algorithm = Some(
                    value
                        .parse::<SchedulingAlgorithm>()
                        .map_err(|e| e.to_string())?,
                );
            }
            "--report" => {
                options.report_path = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            "--monitor-report" => {
                options.monitor_report = Some(PathBuf::from(next_value(args, &mut i, arg)?));
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if options.suite_path.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                options.suite_path = Some(PathBuf::from(arg));
            }
        }
        i += 1;
    }

    if options.suite_path.is_none() {
        return Err("missing <SUITE_FILE>".to_string());
    }
    Ok(options)
}

/// Loads the config file (or defaults) and applies command-line overrides.
fn build_config(options: &CliOptions) -> Result<BenchConfig, Box<dyn std::error::Error>> {
    let mut config = match &options.config_path {
        Some(path) => load_config(path)?,
        None => BenchConfig::default(),
    };

    if let Some(parallel) = options.parallel {
        config.limits.max_concurrent_tasks = parallel;
        config.workers.max = config.workers.max.max(parallel);
    }
    if let Some(algorithm) = options.algorithm {
        config.scheduling_algorithm = algorithm;
    }

    config.validate()?;
    Ok(config)
}

fn run_suite(
    manager: &mut OrchestrationManager,
    suite: &SuiteFile,
    adaptive: bool,
) -> Result<SuiteResult, Box<dyn std::error::Error>> {
    if !adaptive {
        return Ok(manager.run_benchmark_suite(&suite.objectives, &suite.template)?);
    }

    let plan = suite.adaptive.clone().unwrap_or_default();
    let objective = suite
        .objectives
        .first()
        .ok_or("adaptive mode needs at least one objective")?;
    if suite.objectives.len() > 1 {
        warn!(
            "Adaptive mode repeats only the first objective; {} others ignored",
            suite.objectives.len() - 1
        );
    }
    Ok(manager.run_adaptive_benchmark(objective, &suite.template, &plan)?)
}

fn print_summary(result: &SuiteResult, alerts: usize) {
    println!();
    println!("{}", "Benchmark Summary".bold());
    println!("  Duration:      {:.2?}", result.duration());
    println!("  Tasks:         {}", result.total);
    println!("  Completed:     {}", result.completed.to_string().green());

    let failed = result.failed.to_string();
    if result.failed > 0 {
        println!("  Failed:        {}", failed.red());
    } else {
        println!("  Failed:        {}", failed);
    }

    println!("  Success rate:  {:.1}%", result.success_rate() * 100.0);
    println!("  Throughput:    {:.2} tasks/s", result.throughput);
    println!("  Peak memory:   {:.1} MB", result.report.peak_memory_mb);
    println!("  Average CPU:   {:.1}%", result.report.average_cpu_percent);
    println!(
        "  Load balance:  {:.2} (min {} / max {} per worker)",
        result.scheduling_metrics.load_balance_score,
        result.scheduling_metrics.min_worker_load,
        result.scheduling_metrics.max_worker_load
    );
    if alerts > 0 {
        println!("  Alerts:        {}", alerts.to_string().yellow());
    }

    for round in &result.rounds {
        println!(
            "  Round {}: {} workers, {}/{} ok, wait {:.3}s -> {}",
            round.round,
            round.workers,
            round.completed,
            round.completed + round.failed,
            round.mean_queue_wait_secs,
            round.decision
        );
    }

    if !result.failures.is_empty() {
        println!();
        println!("{}", "Failures".bold());
        for failure in &result.failures {
            println!(
                "  {} {} ({}): {}",
                "✗".red(),
                failure.task_id,
                failure.objective,
                failure.reason
            );
        }
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let options = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(options.verbose);
    print_banner();

    let config = build_config(&options)?;
    let suite_path = options.suite_path.clone().unwrap_or_default();
    let suite = load_suite(&suite_path).map_err(|e| {
        error!("Failed to load suite: {}", e);
        format!("Could not load suite from '{}': {}", suite_path.display(), e)
    })?;

    info!(
        "Config: {} max concurrent, {} scheduling, {:?} mode",
        config.limits.max_concurrent_tasks, config.scheduling_algorithm, config.execution_mode
    );

    let mut manager = OrchestrationManager::new(config.clone());
    manager.initialize()?;
    let pool = manager.pool().ok_or("worker pool failed to start")?;

    // Monitor runs alongside the suite on its own thread
    let (alert_tx, alert_rx) = channel();
    let mut monitor_config = MonitorConfig::from(&config);
    monitor_config.report_path = options.monitor_report.clone();
    let probes: Vec<Arc<dyn MetricsProbe>> = vec![pool as Arc<dyn MetricsProbe>];
    let monitor = Arc::new(PerformanceMonitor::new(monitor_config, probes).with_alert_sink(alert_tx));

    let runner = Arc::clone(&monitor);
    let monitor_thread = thread::Builder::new()
        .name("monitor".to_string())
        .spawn(move || runner.start_monitoring())?;

    let outcome = run_suite(&mut manager, &suite, options.adaptive);

    monitor.stop_monitoring();
    match monitor_thread.join() {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!("Performance monitor failed: {}", e),
        Err(_) => warn!("Performance monitor thread panicked"),
    }
    let alerts = alert_rx.try_iter().count();

    let result = outcome?;

    if let Some(pool) = manager.pool() {
        println!("{}", pool.timeline().gantt_chart());
    }
    print_summary(&result, alerts);

    let report_path = options
        .report_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT));
    manager.aggregator().save_detailed_report(&report_path)?;
    println!();
    println!("Report written to {}", report_path.display());

    manager.shutdown();
    Ok(())
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
