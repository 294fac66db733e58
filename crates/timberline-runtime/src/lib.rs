//! `timberline-runtime` – Coordination runtime for AR-gated assembly
//!
//! Wires the presence core from `timberline-kernel` to a transport and drives
//! a building plan through it.
//!
//! # Modules
//!
//! - [`coordinator`] – [`Coordinator`][coordinator::Coordinator]: subscribes to
//!   the check-in and confirmation topics, applies every inbound message
//!   through the registry and barrier APIs, runs the liveness scheduler and
//!   keeps one data subscription per present user.
//! - [`controller`] – [`ExecutionController`][controller::ExecutionController]:
//!   executes unbuilt plan steps as confirmation waves.  No motion starts
//!   before every present user has confirmed the wave.
//! - [`plan`] – [`BuildingPlan`][plan::BuildingPlan] together with the
//!   [`MotionPlanner`][plan::MotionPlanner] and
//!   [`RobotExecutor`][plan::RobotExecutor] seams, plus the simple
//!   [`LinearPlanner`][plan::LinearPlanner] and
//!   [`DispatchingExecutor`][plan::DispatchingExecutor].
//! - [`mock_observer`] – [`MockObserver`][mock_observer::MockObserver]: a
//!   simulated AR client for the CLI demo and tests.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter.  Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable live trace export.

pub mod controller;
pub mod coordinator;
pub mod mock_observer;
pub mod plan;
pub mod telemetry;

pub use controller::{ExecutionController, RunSummary};
pub use coordinator::{Coordinator, CoordinatorConfig, MAX_INTERVAL};
pub use mock_observer::{MockObserver, MockObserverHandle};
pub use plan::{
    Actor, BuildingPlan, DispatchingExecutor, LinearPlanner, MotionPlanner, Phase, PhaseKind,
    PlanStep, RobotExecutor, RobotStepPlan,
};
pub use telemetry::{init_tracing, TracerProviderGuard};
