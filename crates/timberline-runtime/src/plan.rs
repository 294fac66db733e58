//! Building plan and the motion seams the controller drives.
//!
//! The controller treats motion planning and robot execution as opaque:
//!
//! - [`MotionPlanner`] turns a robot step of the [`BuildingPlan`] into a
//!   [`RobotStepPlan`] – three ordered phases (`pickup`, `move`, `retract`),
//!   each a list of [`Trajectory`] values.
//! - [`RobotExecutor`] executes a trajectory and opens/closes the gripper.
//!
//! [`LinearPlanner`] and [`DispatchingExecutor`] are the simple
//! implementations used by the CLI simulation and the tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use timberline_middleware::CommandDispatcher;
use timberline_types::{Configuration, RobotCommand, StepIndex, TimberError, Trajectory};
use tracing::debug;

// ─────────────────────────────────────────────────────────────────────────────
// Building plan
// ─────────────────────────────────────────────────────────────────────────────

/// Who performs a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Actor {
    Robot,
    Human,
}

/// One step of the assembly sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub actor: Actor,
    /// Elements (beams) placed by this step.
    pub element_ids: Vec<String>,
    #[serde(default)]
    pub is_built: bool,
    /// Robot phases already confirmed.  A resumed run starts after them.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub phases_done: usize,
}

fn is_zero(n: &usize) -> bool {
    *n == 0
}

impl PlanStep {
    pub fn robot(element_ids: &[&str]) -> Self {
        Self::new(Actor::Robot, element_ids)
    }

    pub fn human(element_ids: &[&str]) -> Self {
        Self::new(Actor::Human, element_ids)
    }

    fn new(actor: Actor, element_ids: &[&str]) -> Self {
        Self {
            actor,
            element_ids: element_ids.iter().map(|s| s.to_string()).collect(),
            is_built: false,
            phases_done: 0,
        }
    }
}

/// Ordered assembly sequence.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildingPlan {
    pub steps: Vec<PlanStep>,
}

impl BuildingPlan {
    pub fn new(steps: Vec<PlanStep>) -> Self {
        Self { steps }
    }

    /// The first step that is not built yet, with its index.
    pub fn next_unbuilt(&self) -> Option<(usize, &PlanStep)> {
        self.steps.iter().enumerate().find(|(_, step)| !step.is_built)
    }

    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|step| step.is_built)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Motion plan
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseKind {
    Pickup,
    Move,
    Retract,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub kind: PhaseKind,
    pub trajectories: Vec<Trajectory>,
}

/// Planned motion for one robot step, phases in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RobotStepPlan {
    pub phases: Vec<Phase>,
}

/// Plans the motion for one robot step.
pub trait MotionPlanner: Send + Sync {
    /// # Errors
    ///
    /// [`TimberError::Planning`] when no motion can be produced.
    fn plan_step(&self, index: usize, step: &PlanStep) -> Result<RobotStepPlan, TimberError>;
}

/// Executes planned motion on the robot.
#[async_trait]
pub trait RobotExecutor: Send + Sync {
    async fn execute_trajectory(
        &self,
        wave: StepIndex,
        trajectory: &Trajectory,
    ) -> Result<(), TimberError>;

    async fn set_gripper(&self, closed: bool) -> Result<(), TimberError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// LinearPlanner
// ─────────────────────────────────────────────────────────────────────────────

/// Joint-space planner that interpolates linearly between named poses.
///
/// Every robot step goes `home → pickup` (pickup phase), `pickup → placement`
/// of its first element (move phase), then `placement → home` (retract
/// phase).
pub struct LinearPlanner {
    joint_names: Vec<String>,
    home: Vec<f64>,
    pickup: Vec<f64>,
    placements: HashMap<String, Vec<f64>>,
    samples: usize,
}

impl LinearPlanner {
    /// `samples` is the number of points per trajectory, endpoints included
    /// (minimum 2).
    pub fn new(joint_names: Vec<String>, home: Vec<f64>, pickup: Vec<f64>, samples: usize) -> Self {
        Self {
            joint_names,
            home,
            pickup,
            placements: HashMap::new(),
            samples: samples.max(2),
        }
    }

    /// Register the joint values that place `element_id` (builder-style).
    pub fn with_placement(mut self, element_id: impl Into<String>, values: Vec<f64>) -> Self {
        self.placements.insert(element_id.into(), values);
        self
    }

    fn interpolate(&self, from: &[f64], to: &[f64]) -> Trajectory {
        let last = (self.samples - 1) as f64;
        let points = (0..self.samples)
            .map(|i| {
                let t = i as f64 / last;
                let values = from.iter().zip(to).map(|(a, b)| a + (b - a) * t).collect();
                Configuration::new(self.joint_names.clone(), values)
            })
            .collect();
        Trajectory { points }
    }

    fn check_dimensions(&self, index: usize, values: &[f64], what: &str) -> Result<(), TimberError> {
        if values.len() != self.joint_names.len() {
            return Err(TimberError::Planning {
                step: index,
                details: format!(
                    "{what} has {} joint values, robot has {} joints",
                    values.len(),
                    self.joint_names.len()
                ),
            });
        }
        Ok(())
    }
}

impl MotionPlanner for LinearPlanner {
    fn plan_step(&self, index: usize, step: &PlanStep) -> Result<RobotStepPlan, TimberError> {
        let element = step.element_ids.first().ok_or_else(|| TimberError::Planning {
            step: index,
            details: "robot step has no elements".into(),
        })?;
        let placement = self.placements.get(element).ok_or_else(|| TimberError::Planning {
            step: index,
            details: format!("no placement known for element {element:?}"),
        })?;
        self.check_dimensions(index, &self.home, "home pose")?;
        self.check_dimensions(index, &self.pickup, "pickup pose")?;
        self.check_dimensions(index, placement, "placement")?;

        Ok(RobotStepPlan {
            phases: vec![
                Phase {
                    kind: PhaseKind::Pickup,
                    trajectories: vec![self.interpolate(&self.home, &self.pickup)],
                },
                Phase {
                    kind: PhaseKind::Move,
                    trajectories: vec![self.interpolate(&self.pickup, placement)],
                },
                Phase {
                    kind: PhaseKind::Retract,
                    trajectories: vec![self.interpolate(placement, &self.home)],
                },
            ],
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// DispatchingExecutor
// ─────────────────────────────────────────────────────────────────────────────

/// Executor that forwards motion as [`RobotCommand`]s on the command topic.
///
/// `settle` is waited after every trajectory to stand in for the time the
/// robot needs to finish moving.
pub struct DispatchingExecutor {
    dispatcher: CommandDispatcher,
    settle: Duration,
}

impl DispatchingExecutor {
    pub fn new(dispatcher: CommandDispatcher, settle: Duration) -> Self {
        Self { dispatcher, settle }
    }
}

#[async_trait]
impl RobotExecutor for DispatchingExecutor {
    async fn execute_trajectory(
        &self,
        wave: StepIndex,
        trajectory: &Trajectory,
    ) -> Result<(), TimberError> {
        let command = RobotCommand::ExecuteTrajectory {
            step: wave,
            trajectory: trajectory.clone(),
        };
        self.dispatcher.send_robot_command(&command).await?;
        debug!(step = wave, points = trajectory.points.len(), "trajectory dispatched");
        if !self.settle.is_zero() {
            tokio::time::sleep(self.settle).await;
        }
        Ok(())
    }

    async fn set_gripper(&self, closed: bool) -> Result<(), TimberError> {
        self.dispatcher
            .send_robot_command(&RobotCommand::SetGripper { closed })
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn planner() -> LinearPlanner {
        LinearPlanner::new(
            vec!["j1".into(), "j2".into()],
            vec![0.0, 0.0],
            vec![1.0, -1.0],
            5,
        )
        .with_placement("beam_0", vec![2.0, 0.5])
    }

    #[test]
    fn plan_has_three_phases_in_order() {
        let plan = planner().plan_step(0, &PlanStep::robot(&["beam_0"])).unwrap();
        let kinds: Vec<_> = plan.phases.iter().map(|p| p.kind).collect();
        assert_eq!(kinds, vec![PhaseKind::Pickup, PhaseKind::Move, PhaseKind::Retract]);
    }

    #[test]
    fn trajectories_connect_poses() {
        let plan = planner().plan_step(0, &PlanStep::robot(&["beam_0"])).unwrap();
        let pickup = &plan.phases[0].trajectories[0];
        assert_eq!(pickup.points.len(), 5);
        assert_eq!(pickup.points[0].values, vec![0.0, 0.0]);
        assert_eq!(pickup.points[2].values, vec![0.5, -0.5]);
        assert_eq!(pickup.points[4].values, vec![1.0, -1.0]);

        let retract = &plan.phases[2].trajectories[0];
        assert_eq!(retract.points[0].values, vec![2.0, 0.5]);
        assert_eq!(retract.points[4].values, vec![0.0, 0.0]);
    }

    #[test]
    fn unknown_element_is_a_planning_error() {
        let err = planner().plan_step(3, &PlanStep::robot(&["beam_9"])).unwrap_err();
        assert!(matches!(err, TimberError::Planning { step: 3, .. }));
    }

    #[test]
    fn step_without_elements_is_a_planning_error() {
        assert!(planner().plan_step(0, &PlanStep::robot(&[])).is_err());
    }

    #[test]
    fn mismatched_joint_count_is_a_planning_error() {
        let planner = planner().with_placement("short", vec![1.0]);
        assert!(planner.plan_step(0, &PlanStep::robot(&["short"])).is_err());
    }

    #[test]
    fn building_plan_parses_legacy_shape() {
        let plan: BuildingPlan = serde_json::from_value(json!({
            "steps": [
                { "actor": "ROBOT", "element_ids": ["b0"], "is_built": true },
                { "actor": "HUMAN", "element_ids": ["b1"] }
            ]
        }))
        .unwrap();
        assert_eq!(plan.steps[1].actor, Actor::Human);
        let (index, step) = plan.next_unbuilt().unwrap();
        assert_eq!(index, 1);
        assert_eq!(step.element_ids, vec!["b1".to_string()]);
        assert!(!plan.is_complete());
    }
}
