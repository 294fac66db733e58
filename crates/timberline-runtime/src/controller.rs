//! [`ExecutionController`] – drives a [`BuildingPlan`] through the
//! confirmation barrier.
//!
//! Every unbuilt step is executed as one or more *waves*.  A wave is:
//!
//! 1. `open_step` on the [`StepBarrier`] with the wave payload;
//! 2. `broadcast_step` of the same payload to every AR user;
//! 3. poll the barrier until every present user has confirmed (or the
//!    caller cancels);
//! 4. run the motion for the wave – irreversible from here on;
//! 5. `close_step`, after which late confirmations are no-ops.
//!
//! Robot steps produce three waves (`pickup`, `move`, `retract`), closing the
//! gripper after `pickup` and opening it after `move`.  Human steps produce
//! a single wave with no motion.  Wave indices come from a counter owned by
//! the controller and never repeat.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use timberline_kernel::StepBarrier;
use timberline_middleware::CommandDispatcher;
use timberline_types::{StepIndex, TimberError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::plan::{Actor, BuildingPlan, MotionPlanner, Phase, PhaseKind, PlanStep, RobotExecutor};

/// What a completed [`ExecutionController::run`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub steps_built: usize,
    pub waves: usize,
}

/// Sequential step executor gated on AR confirmation.
pub struct ExecutionController<P, E> {
    barrier: Arc<StepBarrier>,
    dispatcher: CommandDispatcher,
    planner: P,
    executor: E,
    poll: Duration,
    next_wave: StepIndex,
}

impl<P: MotionPlanner, E: RobotExecutor> ExecutionController<P, E> {
    pub fn new(
        barrier: Arc<StepBarrier>,
        dispatcher: CommandDispatcher,
        planner: P,
        executor: E,
        poll: Duration,
    ) -> Self {
        Self {
            barrier,
            dispatcher,
            planner,
            executor,
            poll,
            next_wave: 0,
        }
    }

    /// Build a controller on top of a running [`Coordinator`].
    pub fn from_coordinator(coordinator: &Coordinator, planner: P, executor: E) -> Self {
        Self::new(
            Arc::clone(coordinator.barrier()),
            coordinator.dispatcher().clone(),
            planner,
            executor,
            coordinator.config().barrier_poll,
        )
    }

    /// Index the next wave will use.
    pub fn next_wave(&self) -> StepIndex {
        self.next_wave
    }

    /// Execute every unbuilt step of `plan` in order.  A step is marked
    /// built once its final wave is confirmed.
    ///
    /// # Errors
    ///
    /// * [`TimberError::Cancelled`] when `cancel` fires while waiting for
    ///   confirmation.  Steps built so far stay built, and a robot step
    ///   keeps the phases already confirmed.
    /// * Planning and execution errors from the planner/executor.
    pub async fn run(
        &mut self,
        plan: &mut BuildingPlan,
        cancel: &CancellationToken,
    ) -> Result<RunSummary, TimberError> {
        let mut summary = RunSummary::default();

        while let Some(index) = plan.next_unbuilt().map(|(index, _)| index) {
            let step = &mut plan.steps[index];
            info!(step = index, actor = ?step.actor, elements = ?step.element_ids, "starting step");

            summary.waves += match step.actor {
                Actor::Robot => self.run_robot_step(index, step, cancel).await?,
                Actor::Human => self.run_human_step(index, step, cancel).await?,
            };

            summary.steps_built += 1;
            info!(step = index, "step built");
        }

        info!(steps = summary.steps_built, waves = summary.waves, "building plan complete");
        Ok(summary)
    }

    /// Runs the phases not yet confirmed.  Progress is recorded on `step` as
    /// soon as a wave is satisfied, so a resumed run never repeats motion.
    async fn run_robot_step(
        &mut self,
        index: usize,
        step: &mut PlanStep,
        cancel: &CancellationToken,
    ) -> Result<usize, TimberError> {
        let motion = self.planner.plan_step(index, step)?;
        let total = motion.phases.len();
        if step.phases_done > 0 {
            info!(step = index, done = step.phases_done, total, "resuming step");
        }

        let mut waves = 0;
        for phase in motion.phases.iter().skip(step.phases_done) {
            let payload = json!({
                "plan_step": index,
                "actor": step.actor,
                "element_ids": step.element_ids,
                "phase": phase.kind,
                "configurations": phase.trajectories,
            });
            let wave = self.confirm_wave(payload, cancel).await?;
            step.phases_done += 1;
            step.is_built = step.phases_done >= total;
            waves += 1;

            let executed = self.execute_phase(wave, phase).await;
            self.barrier.close_step(wave);
            executed?;
        }
        step.is_built = true;
        Ok(waves)
    }

    async fn run_human_step(
        &mut self,
        index: usize,
        step: &mut PlanStep,
        cancel: &CancellationToken,
    ) -> Result<usize, TimberError> {
        let payload = json!({
            "plan_step": index,
            "actor": step.actor,
            "element_ids": step.element_ids,
        });
        let wave = self.confirm_wave(payload, cancel).await?;
        step.is_built = true;
        self.barrier.close_step(wave);
        Ok(1)
    }

    /// Open, broadcast and wait for one wave.  The wave is left open on
    /// success and closed on cancellation or broadcast failure.
    async fn confirm_wave(
        &mut self,
        payload: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<StepIndex, TimberError> {
        let wave = self.next_wave;
        self.next_wave += 1;

        self.barrier.open_step(wave, payload.clone());
        let users = self.barrier.registry().snapshot().ids();
        if let Err(e) = self.dispatcher.announce_presence_echo(users).await {
            warn!(error = %e, "presence echo failed");
        }
        if let Err(e) = self.dispatcher.broadcast_step(wave, payload).await {
            self.barrier.close_step(wave);
            return Err(e);
        }

        info!(step = wave, "waiting for confirmation");
        if let Err(e) = self.barrier.wait_until_satisfied(wave, self.poll, cancel).await {
            self.barrier.close_step(wave);
            return Err(e);
        }
        info!(step = wave, "confirmed by all users");
        Ok(wave)
    }

    async fn execute_phase(&self, wave: StepIndex, phase: &Phase) -> Result<(), TimberError> {
        for trajectory in &phase.trajectories {
            self.executor.execute_trajectory(wave, trajectory).await?;
        }
        match phase.kind {
            PhaseKind::Pickup => self.executor.set_gripper(true).await,
            PhaseKind::Move => self.executor.set_gripper(false).await,
            PhaseKind::Retract => Ok(()),
        }
    }
}
