//! Walks the bootstrap plan stage by stage.
//!
//! Each step goes `Pending → Probing → {Skipped | Applying → {Applied | Failed}}`.
//! Steps of one stage run concurrently on a bounded pool; a stage only starts
//! once every step of the previous stage has resolved. A failure in an
//! aborting stage stops the run; any other failure is recorded, its
//! dependents are marked, and the rest of the plan carries on.

use crate::client::{ControlPlane, ControlPlaneError};
use crate::core::Result;
use crate::executor::StepExecutor;
use crate::guard::{IdempotencyGuard, ProbeVerdict};
use crate::plan::{BootstrapPlan, PlannedStep, Stage, StepId};
use crate::report::{
    FailureKind, FailureReason, ReportCollector, RunReport, RunState, StepOutcome, StepRecord,
};
use crate::settings::BootstrapSettings;
use crate::topology::Topology;
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, Semaphore, watch};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle phase of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepPhase {
    Pending,
    Probing,
    Skipped,
    Applying,
    Applied,
    Failed,
}

/// Receives step transitions as they happen.
pub trait StepObserver: Send + Sync {
    fn on_stage_started(&self, _stage: Stage, _steps: usize) {}

    fn on_transition(&self, step: &StepId, stage: Stage, phase: StepPhase, detail: Option<&str>);

    fn on_run_finished(&self, _report: &RunReport) {}
}

/// Default observer: one structured log event per transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl StepObserver for TracingObserver {
    fn on_stage_started(&self, stage: Stage, steps: usize) {
        info!(stage = %stage, steps, "stage started");
    }

    fn on_transition(&self, step: &StepId, stage: Stage, phase: StepPhase, detail: Option<&str>) {
        let detail = detail.unwrap_or("");
        match phase {
            StepPhase::Failed => {
                warn!(step = %step, stage = %stage, phase = ?phase, detail, "step failed")
            }
            StepPhase::Applied => info!(step = %step, stage = %stage, phase = ?phase, "step applied"),
            StepPhase::Skipped => {
                info!(step = %step, stage = %stage, phase = ?phase, "step already satisfied")
            }
            _ => debug!(step = %step, stage = %stage, phase = ?phase, "step transition"),
        }
    }

    fn on_run_finished(&self, report: &RunReport) {
        let counts = report.counts();
        info!(
            run_id = %report.run_id,
            state = %report.state,
            applied = counts.applied,
            already_satisfied = counts.already_satisfied,
            failed = counts.failed,
            "bootstrap run finished"
        );
    }
}

/// Triggers cancellation of a run from outside.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Stops the run from launching further steps.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancellationSignal {
        CancellationSignal {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for CancellationHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Read side of a [`CancellationHandle`], passed to a run.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: watch::Receiver<bool>,
}

impl CancellationSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub max_concurrency: usize,
    pub step_timeout: Duration,
    pub run_timeout: Option<Duration>,
}

impl From<&BootstrapSettings> for OrchestratorOptions {
    fn from(settings: &BootstrapSettings) -> Self {
        Self {
            max_concurrency: settings.max_concurrency.max(1),
            step_timeout: settings.step_timeout,
            run_timeout: settings.run_timeout,
        }
    }
}

/// Why later stages are no longer attempted.
#[derive(Debug, Clone, Copy)]
enum Halt {
    Aborted(Stage),
    Cancelled,
}

impl Halt {
    fn describe(self) -> String {
        match self {
            Halt::Aborted(stage) => format!("run aborted after a failure in stage {}", stage),
            Halt::Cancelled => "run cancelled before the step started".to_string(),
        }
    }
}

/// Drives a bootstrap plan against a control plane.
pub struct BootstrapOrchestrator {
    guard: IdempotencyGuard,
    executor: StepExecutor,
    options: OrchestratorOptions,
    observer: Arc<dyn StepObserver>,
    state: RwLock<RunState>,
}

impl BootstrapOrchestrator {
    pub fn new(control: Arc<dyn ControlPlane>, settings: &BootstrapSettings) -> Self {
        Self {
            guard: IdempotencyGuard::new(control.clone(), settings.guard_policy),
            executor: StepExecutor::new(control),
            options: OrchestratorOptions::from(settings),
            observer: Arc::new(TracingObserver),
            state: RwLock::new(RunState::NotStarted),
        }
    }

    /// Replaces the default tracing observer.
    pub fn with_observer(mut self, observer: Arc<dyn StepObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn options(&self) -> OrchestratorOptions {
        self.options
    }

    /// State of the current or most recent run.
    pub async fn state(&self) -> RunState {
        *self.state.read().await
    }

    /// Plans and runs a topology.
    ///
    /// A descriptor that fails validation is returned as an error before any
    /// control-plane call; every later problem ends up in the report.
    pub async fn bootstrap(&self, topology: &Topology, cancel: CancellationSignal) -> Result<RunReport> {
        let plan = topology.plan()?;
        Ok(self.run(&plan, cancel).await)
    }

    pub async fn run(&self, plan: &BootstrapPlan, cancel: CancellationSignal) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let deadline = self.options.run_timeout.map(|t| Instant::now() + t);
        *self.state.write().await = RunState::Running;
        info!(%run_id, steps = plan.len(), "bootstrap run started");

        let collector = ReportCollector::new();
        let mut resolved: HashMap<StepId, bool> = HashMap::new();
        let mut halted: Option<Halt> = None;

        for planned in plan.stages() {
            if planned.steps.is_empty() {
                continue;
            }
            if halted.is_none() && self.stop_requested(&cancel, deadline) {
                warn!(stage = %planned.stage, "cancellation requested, launching no further steps");
                halted = Some(Halt::Cancelled);
            }
            if let Some(halt) = halted {
                for step in &planned.steps {
                    let reason = FailureReason::new(FailureKind::NotAttempted, halt.describe());
                    self.finish(&collector, step, StepOutcome::failed(reason), Instant::now())
                        .await;
                }
                continue;
            }

            self.observer
                .on_stage_started(planned.stage, planned.steps.len());
            let permits = Semaphore::new(self.options.max_concurrency.max(1));
            let outcomes = join_all(planned.steps.iter().map(|step| {
                self.run_step(step, &resolved, &permits, &cancel, deadline, &collector)
            }))
            .await;

            let mut stage_failed = false;
            let mut stage_cancelled = false;
            for (step, outcome) in planned.steps.iter().zip(outcomes) {
                // Steps skipped by a stop request are not failures of the stage.
                if outcome
                    .failure()
                    .is_some_and(|r| r.kind == FailureKind::NotAttempted)
                {
                    stage_cancelled = true;
                } else {
                    stage_failed |= outcome.is_failure();
                }
                resolved.insert(step.id.clone(), outcome.is_success());
            }

            if stage_cancelled {
                warn!(stage = %planned.stage, "stop requested mid-stage, launching no further steps");
                halted = Some(Halt::Cancelled);
            } else if stage_failed && planned.stage.aborts_on_failure() {
                error!(stage = %planned.stage, "stage failed, aborting bootstrap run");
                halted = Some(Halt::Aborted(planned.stage));
            }
        }

        let records = collector.snapshot().await;
        let any_failed = records.iter().any(|r| r.outcome.is_failure());
        let state = match halted {
            Some(Halt::Aborted(_)) => RunState::Aborted,
            Some(Halt::Cancelled) => RunState::Cancelled,
            None if any_failed => RunState::CompletedWithFailures,
            None => RunState::Completed,
        };
        *self.state.write().await = state;

        let report = RunReport::assemble(run_id, started_at, state, plan, records);
        self.observer.on_run_finished(&report);
        report
    }

    fn stop_requested(&self, cancel: &CancellationSignal, deadline: Option<Instant>) -> bool {
        cancel.is_cancelled() || deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn run_step(
        &self,
        step: &PlannedStep,
        resolved: &HashMap<StepId, bool>,
        permits: &Semaphore,
        cancel: &CancellationSignal,
        deadline: Option<Instant>,
        collector: &ReportCollector,
    ) -> StepOutcome {
        self.observer
            .on_transition(&step.id, step.stage, StepPhase::Pending, None);

        if !step.dependency.is_met(|id| resolved.get(id).copied()) {
            let missing = step
                .dependency
                .steps()
                .iter()
                .filter(|id| resolved.get(*id) != Some(&true))
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let reason = FailureReason::new(
                FailureKind::DependencyFailed,
                format!("prerequisite did not succeed: {}", missing),
            );
            return self
                .finish(collector, step, StepOutcome::failed(reason), Instant::now())
                .await;
        }

        let _permit = match permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                let reason = FailureReason::new(FailureKind::NotAttempted, "worker pool closed");
                return self
                    .finish(collector, step, StepOutcome::failed(reason), Instant::now())
                    .await;
            }
        };
        if self.stop_requested(cancel, deadline) {
            let reason = FailureReason::new(FailureKind::NotAttempted, Halt::Cancelled.describe());
            return self
                .finish(collector, step, StepOutcome::failed(reason), Instant::now())
                .await;
        }

        let started = Instant::now();
        self.observer
            .on_transition(&step.id, step.stage, StepPhase::Probing, None);
        let verdict = match timeout(self.options.step_timeout, self.guard.probe(step)).await {
            Ok(verdict) => verdict,
            Err(_) => ProbeVerdict::Unreachable(self.timeout_error(step)),
        };

        let outcome = match verdict {
            ProbeVerdict::Satisfied => StepOutcome::AlreadySatisfied,
            ProbeVerdict::Conflict(detail) => StepOutcome::failed(FailureReason::conflict(detail)),
            ProbeVerdict::Unreachable(err) => {
                StepOutcome::failed(FailureReason::transient(format!("probe failed: {}", err)))
            }
            ProbeVerdict::Inconclusive(detail) => {
                info!(step = %step.id, %detail, "probe inconclusive, treating as not yet applied");
                self.apply(step).await
            }
            ProbeVerdict::NotSatisfied => self.apply(step).await,
        };
        self.finish(collector, step, outcome, started).await
    }

    async fn apply(&self, step: &PlannedStep) -> StepOutcome {
        self.observer
            .on_transition(&step.id, step.stage, StepPhase::Applying, None);
        match timeout(self.options.step_timeout, self.executor.execute(step)).await {
            Ok(outcome) => outcome,
            Err(_) => StepOutcome::failed(FailureReason::transient(
                self.timeout_error(step).to_string(),
            )),
        }
    }

    fn timeout_error(&self, step: &PlannedStep) -> ControlPlaneError {
        ControlPlaneError::Timeout {
            target: step.id.to_string(),
            after_ms: self.options.step_timeout.as_millis() as u64,
        }
    }

    async fn finish(
        &self,
        collector: &ReportCollector,
        step: &PlannedStep,
        outcome: StepOutcome,
        started: Instant,
    ) -> StepOutcome {
        let phase = match &outcome {
            StepOutcome::AlreadySatisfied => StepPhase::Skipped,
            StepOutcome::Applied => StepPhase::Applied,
            StepOutcome::Failed(_) => StepPhase::Failed,
        };
        let detail = outcome.failure().map(ToString::to_string);
        self.observer
            .on_transition(&step.id, step.stage, phase, detail.as_deref());
        collector
            .record(StepRecord {
                step: step.id.clone(),
                stage: step.stage,
                outcome: outcome.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
            .await;
        outcome
    }
}
