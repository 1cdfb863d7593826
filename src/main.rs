//! Workplan CLI Entry Point
//!
//! Runs a workplan from a YAML file, simulating external activities by
//! completing them with a configured output index.
//!
//! # Usage
//!
//! ```bash
//! # Run a workplan to completion
//! workplan housing.yaml
//!
//! # Route the "inspect" activity to its second output
//! workplan housing.yaml --result inspect=1
//!
//! # Pause after 3 firings, then continue from the snapshot
//! workplan housing.yaml --pause-after 3
//! workplan housing.yaml --resume
//! ```

use std::collections::{HashMap, VecDeque};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use colored::Colorize;
use log::{error, info, warn};

use workplan::execution::{Engine, EngineEvent, EngineStatus, Token, TransitionRef};
use workplan::monitoring::ExecutionTimeline;
use workplan::workflow::parser::load_workplan;
use workplan::{WorkplanSnapshot, APP_NAME, VERSION};

/// Default workplan file used when none is specified.
const DEFAULT_WORKPLAN: &str = "workplan.yaml";

/// Output index used for activities without a configured result.
const DEFAULT_RESULT: usize = 0;

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    workplan_path: String,
    snapshot_path: Option<PathBuf>,
    resume: bool,
    pause_after: Option<usize>,
    results: HashMap<String, usize>,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workplan_path: DEFAULT_WORKPLAN.to_string(),
            snapshot_path: None,
            resume: false,
            pause_after: None,
            results: HashMap::new(),
            verbose: false,
        }
    }
}

impl Config {
    fn snapshot_path(&self) -> PathBuf {
        self.snapshot_path
            .clone()
            .unwrap_or_else(|| WorkplanSnapshot::default_path_for(&self.workplan_path))
    }

    fn result_for(&self, activity: &str) -> usize {
        self.results.get(activity).copied().unwrap_or(DEFAULT_RESULT)
    }
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

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Petri-Net Workplan Execution Engine");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: workplan [OPTIONS] <WORKPLAN_FILE>");
    println!();
    println!("Arguments:");
    println!("  <WORKPLAN_FILE>          Path to workplan YAML file");
    println!();
    println!("Options:");
    println!("  --resume                 Continue from the saved snapshot");
    println!("  --snapshot PATH          Snapshot file (default: .workplan/<name>.snapshot.json)");
    println!("  --pause-after N          Pause after N firings and save a snapshot");
    println!("  --result ACTIVITY=INDEX  Output chosen when ACTIVITY finishes (default: {})", DEFAULT_RESULT);
    println!("  --verbose                Enable debug logging");
    println!("  --help                   Show this help message");
    println!("  --version                Show version information");
    println!();
    println!("Examples:");
    println!("  workplan housing.yaml");
    println!("  workplan housing.yaml --result inspect=1");
    println!("  workplan housing.yaml --pause-after 3 && workplan housing.yaml --resume");
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut positional_index = 0;
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
            "--resume" => {
                config.resume = true;
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--snapshot" => {
                i += 1;
                if i >= args.len() {
                    return Err("--snapshot requires a path argument".to_string());
                }
                config.snapshot_path = Some(PathBuf::from(&args[i]));
            }
            "--pause-after" => {
                i += 1;
                if i >= args.len() {
                    return Err("--pause-after requires a number argument".to_string());
                }
                let count = args[i]
                    .parse()
                    .map_err(|_| format!("Invalid pause-after value: {}", args[i]))?;
                config.pause_after = Some(count);
            }
            "--result" => {
                i += 1;
                if i >= args.len() {
                    return Err("--result requires an ACTIVITY=INDEX argument".to_string());
                }
                let (activity, index) = args[i]
                    .split_once('=')
                    .ok_or_else(|| format!("Invalid result mapping: {}", args[i]))?;
                let index = index
                    .trim()
                    .parse()
                    .map_err(|_| format!("Invalid output index for '{}': {}", activity, index))?;
                config.results.insert(activity.trim().to_string(), index);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                match positional_index {
                    0 => config.workplan_path = arg.clone(),
                    _ => return Err(format!("Unexpected argument: {}", arg)),
                }
                positional_index += 1;
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Prints one engine event.
fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::TransitionTriggered { transition } => {
            println!("  {} {}", "fired".dimmed(), transition);
        }
        EngineEvent::ActivityStarted {
            transition,
            activity,
            token,
        } => {
            println!(
                "  {} '{}' at {} for token {}",
                "activity".cyan().bold(),
                activity,
                transition,
                token.id()
            );
        }
        EngineEvent::Completed { place, token } => {
            println!(
                "  {} at '{}' with token {}",
                "completed".green().bold(),
                place,
                token.id()
            );
        }
    }
}

/// A started activity waiting for its simulated result.
struct PendingActivity {
    transition: TransitionRef,
    activity: String,
    token: Token,
}

/// Drives the engine until it completes, stalls or reaches the pause point.
fn drive(
    engine: &Engine,
    events: &Receiver<EngineEvent>,
    config: &Config,
    timeline: &mut ExecutionTimeline,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut pending = VecDeque::new();

    loop {
        for event in events.try_iter() {
            print_event(&event);
            timeline.record(&event);
            if let EngineEvent::ActivityStarted {
                transition,
                activity,
                token,
            } = event
            {
                pending.push_back(PendingActivity {
                    transition,
                    activity,
                    token,
                });
            }
        }

        if let Some(limit) = config.pause_after {
            if timeline.triggered() >= limit && engine.status() == EngineStatus::Running {
                let snapshot = engine.pause()?;
                let path = config.snapshot_path();
                snapshot.save(&path)?;
                println!();
                println!(
                    "{} after {} firings, snapshot written to {}",
                    "Paused".yellow().bold(),
                    timeline.triggered(),
                    path.display()
                );
                return Ok(());
            }
        }

        if engine.status() != EngineStatus::Running {
            return Ok(());
        }

        let Some(next) = pending.pop_front() else {
            warn!("No activity is running and no transition can fire; the workplan is stuck");
            return Ok(());
        };

        let output = config.result_for(&next.activity);
        info!(
            "Activity '{}' done for token {}, choosing output {}",
            next.activity,
            next.token.id(),
            output
        );
        engine.complete(&next.transition, next.token.id(), output)?;
    }
}

/// Main application entry point.
fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    info!("Loading workplan: {}", config.workplan_path);
    let workplan = load_workplan(&config.workplan_path).map_err(|e| {
        error!("Failed to load workplan: {}", e);
        format!(
            "Could not load workplan from '{}': {}",
            config.workplan_path, e
        )
    })?;

    info!(
        "Workplan '{}' v{} loaded: {} places, {} steps",
        workplan.id,
        workplan.version,
        workplan.places.len(),
        workplan.steps.len()
    );

    let engine = Engine::new(Arc::new(workplan))?;
    let events = engine.subscribe();
    let mut timeline = ExecutionTimeline::new();

    if config.resume {
        let path = config.snapshot_path();
        info!("Resuming from snapshot: {}", path.display());
        let snapshot = WorkplanSnapshot::load(&path)?;
        engine.restore(&snapshot)?;
    }
    engine.start()?;

    drive(&engine, &events, &config, &mut timeline)?;
    println!("{}", timeline.trace_report());

    match engine.status() {
        EngineStatus::Completed => {
            if let Some((place, token)) = engine.completion() {
                println!("{} at '{}' with token {}", "Done".green().bold(), place, token);
            }
            Ok(())
        }
        EngineStatus::Paused => Ok(()),
        EngineStatus::Halted => {
            let reason = engine.halt_reason().unwrap_or_default();
            Err(format!("Workplan halted: {}", reason).into())
        }
        status => Err(format!("Workplan stopped while {}", status).into()),
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!();
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}
