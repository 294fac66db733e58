//! `timberline-cli` – Timberline command line interface
//!
//! Runs a simulated assembly session on the in-process bus:
//!
//! 1. Loads `~/.timberline/config.toml`, writing the defaults on first run.
//! 2. Starts the coordinator and the configured number of simulated AR
//!    observers.
//! 3. Drives a small building plan through the execution controller; every
//!    wave waits for all present observers to confirm.
//! 4. Intercepts **Ctrl-C** to cancel the pending wave and exit cleanly.

mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use timberline_middleware::{EventBus, TopicNamespace, Transport};
use timberline_runtime::{
    BuildingPlan, Coordinator, DispatchingExecutor, ExecutionController, LinearPlanner,
    MockObserver, MockObserverHandle, PlanStep, init_tracing,
};
use timberline_types::TimberError;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

const JOINTS: [&str; 6] = [
    "shoulder_pan_joint",
    "shoulder_lift_joint",
    "elbow_joint",
    "wrist_1_joint",
    "wrist_2_joint",
    "wrist_3_joint",
];

fn main() -> ExitCode {
    let _guard = init_tracing("timberline");
    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => write_default_config(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let cancel_on_signal = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – aborting the pending step …".yellow().bold());
        cancel_on_signal.cancel();
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; the run cannot be aborted early");
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start the Tokio runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(&cfg, cancel)) {
        Ok(()) => {
            println!("\n  {} Building plan complete.\n", "✓".green().bold());
            ExitCode::SUCCESS
        }
        Err(TimberError::Cancelled) => {
            println!("{}", "  ✓ Run cancelled; no motion was started for the pending step.".green());
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "run failed");
            println!("{}: {}", "Run failed".red(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cfg: &config::Config, cancel: CancellationToken) -> Result<(), TimberError> {
    let bus = EventBus::new(cfg.bus_capacity);
    let mut coordinator = Coordinator::new(Arc::new(bus.clone()), cfg.to_coordinator_config())?;
    coordinator.start().await?;

    println!(
        "  Topics under {} (broker {})",
        format!("/{}", coordinator.topics().root()).bold(),
        cfg.broker_url.dimmed()
    );

    let heartbeat = Duration::from_millis(cfg.heartbeat_interval_ms / 2).max(Duration::from_millis(1));
    let (observers, spawned) = spawn_observers(
        Arc::new(bus.clone()),
        coordinator.topics(),
        cfg.mock_observers,
        heartbeat,
        Duration::from_millis(cfg.mock_confirm_delay_ms),
        &cancel,
    )
    .await;
    for handle in &observers {
        println!("    • observer {}", handle.id().as_str().cyan());
    }
    println!();

    let result = match spawned {
        Ok(()) => {
            let executor =
                DispatchingExecutor::new(coordinator.dispatcher().clone(), Duration::from_millis(200));
            let mut controller =
                ExecutionController::from_coordinator(&coordinator, demo_planner(), executor);
            let mut plan = demo_plan();
            controller.run(&mut plan, &cancel).await
        }
        Err(e) => Err(e),
    };

    if let Ok(summary) = &result {
        println!(
            "  {} step(s) built in {} wave(s).",
            summary.steps_built.to_string().bold(),
            summary.waves.to_string().bold()
        );
    }

    cancel.cancel();
    for observer in observers {
        observer.join().await;
    }
    coordinator.shutdown().await;
    bus.shutdown();
    result.map(|_| ())
}

/// Start `count` simulated observers.  On failure the observers already
/// running are returned alongside the error so they can still be joined.
async fn spawn_observers(
    transport: Arc<dyn Transport>,
    topics: &TopicNamespace,
    count: usize,
    heartbeat: Duration,
    confirm_delay: Duration,
    cancel: &CancellationToken,
) -> (Vec<MockObserverHandle>, Result<(), TimberError>) {
    let mut observers = Vec::with_capacity(count);
    for _ in 0..count {
        let spawned = MockObserver::random(Arc::clone(&transport), topics.clone())
            .heartbeat(heartbeat)
            .confirm_delay(confirm_delay)
            .spawn(cancel.child_token())
            .await;
        match spawned {
            Ok(handle) => observers.push(handle),
            Err(e) => {
                error!(error = %e, started = observers.len(), "failed to start mock observer");
                return (observers, Err(e));
            }
        }
    }
    (observers, Ok(()))
}

fn demo_plan() -> BuildingPlan {
    BuildingPlan::new(vec![
        PlanStep::robot(&["beam_0"]),
        PlanStep::human(&["beam_1"]),
        PlanStep::robot(&["beam_2"]),
    ])
}

fn demo_planner() -> LinearPlanner {
    LinearPlanner::new(
        JOINTS.iter().map(|j| j.to_string()).collect(),
        vec![0.0, -1.57, 1.57, -1.57, -1.57, 0.0],
        vec![0.6, -1.2, 1.9, -2.3, -1.57, 0.6],
        10,
    )
    .with_placement("beam_0", vec![-0.4, -1.0, 1.4, -1.9, -1.57, -0.4])
    .with_placement("beam_2", vec![-0.8, -0.9, 1.2, -1.9, -1.57, -0.8])
}

fn write_default_config() -> config::Config {
    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  _____ _           _               _ _            "#.bold().cyan());
    println!("{}", r#" |_   _(_)_ __ ___ | |__   ___ _ __| (_)_ __   ___ "#.bold().cyan());
    println!("{}", r#"   | | | | '_ ` _ \| '_ \ / _ \ '__| | | '_ \ / _ \"#.bold().cyan());
    println!("{}", r#"   | | | | | | | | | |_) |  __/ |  | | | | | |  __/"#.bold().cyan());
    println!("{}", r#"   |_| |_|_| |_| |_|_.__/ \___|_|  |_|_|_| |_|\___|"#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Timberline".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  AR-confirmed robotic timber assembly");
    println!();
}
