//! Step outcomes and the run report.

use crate::client::ControlPlaneError;
use crate::core::{BootError, Result};
use crate::plan::{BootstrapPlan, Stage, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Why a step did not reach its goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network, timeout or not-ready cluster; re-running later may succeed.
    TransientCommunication,
    /// The engine rejected the request; needs a descriptor or data fix.
    SemanticConflict,
    /// Not attempted because a prerequisite step failed.
    DependencyFailed,
    /// Not attempted because the run was aborted or cancelled.
    NotAttempted,
}

impl FailureKind {
    pub fn label(self) -> &'static str {
        match self {
            FailureKind::TransientCommunication => "transient",
            FailureKind::SemanticConflict => "conflict",
            FailureKind::DependencyFailed => "dependency failed",
            FailureKind::NotAttempted => "not attempted",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub detail: String,
}

impl FailureReason {
    pub fn new(kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn transient(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::TransientCommunication, detail)
    }

    pub fn conflict(detail: impl Into<String>) -> Self {
        Self::new(FailureKind::SemanticConflict, detail)
    }

    /// Classifies an error returned by a mutating control-plane call.
    pub fn from_control_error(err: &ControlPlaneError) -> Self {
        if err.is_transient() {
            Self::transient(err.to_string())
        } else {
            Self::conflict(err.to_string())
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.label(), self.detail)
    }
}

/// Final classification of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepOutcome {
    AlreadySatisfied,
    Applied,
    Failed(FailureReason),
}

impl StepOutcome {
    pub fn failed(reason: FailureReason) -> Self {
        Self::Failed(reason)
    }

    /// Applied or AlreadySatisfied.
    pub fn is_success(&self) -> bool {
        !self.is_failure()
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            StepOutcome::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepOutcome::AlreadySatisfied => write!(f, "already satisfied"),
            StepOutcome::Applied => write!(f, "applied"),
            StepOutcome::Failed(reason) => write!(f, "FAILED ({})", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step: StepId,
    pub stage: Stage,
    pub outcome: StepOutcome,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    NotStarted,
    Running,
    Completed,
    CompletedWithFailures,
    /// A config or shard replica set failed; later stages were not attempted.
    Aborted,
    /// Cancellation or the run deadline stopped new steps from launching.
    Cancelled,
}

impl RunState {
    pub fn is_finished(self) -> bool {
        !matches!(self, RunState::NotStarted | RunState::Running)
    }

    /// Process exit status for a finished run; zero only for Completed.
    pub fn exit_code(self) -> u8 {
        match self {
            RunState::Completed => 0,
            RunState::CompletedWithFailures | RunState::NotStarted | RunState::Running => 1,
            RunState::Aborted => 3,
            RunState::Cancelled => 4,
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunState::NotStarted => "not started",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::CompletedWithFailures => "completed with failures",
            RunState::Aborted => "aborted",
            RunState::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

/// Append-only step record sink shared by concurrently running steps.
#[derive(Debug, Clone, Default)]
pub struct ReportCollector {
    records: Arc<Mutex<Vec<StepRecord>>>,
}

impl ReportCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, record: StepRecord) {
        self.records.lock().await.push(record);
    }

    pub async fn snapshot(&self) -> Vec<StepRecord> {
        self.records.lock().await.clone()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub already_satisfied: usize,
    pub applied: usize,
    pub failed: usize,
}

/// Everything a run did, one record per planned step in plan order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub state: RunState,
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    /// Assembles the report, ordering records by their position in the plan.
    pub fn assemble(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        state: RunState,
        plan: &BootstrapPlan,
        mut records: Vec<StepRecord>,
    ) -> Self {
        let position = plan
            .steps()
            .enumerate()
            .map(|(idx, step)| (step.id.clone(), idx))
            .collect::<HashMap<_, _>>();
        records.sort_by_key(|r| position.get(&r.step).copied().unwrap_or(usize::MAX));
        Self {
            run_id,
            started_at,
            finished_at: Utc::now(),
            state,
            steps: records,
        }
    }

    pub fn outcome(&self, step: &StepId) -> Option<&StepOutcome> {
        self.steps
            .iter()
            .find(|r| &r.step == step)
            .map(|r| &r.outcome)
    }

    pub fn counts(&self) -> OutcomeCounts {
        let mut counts = OutcomeCounts::default();
        for record in &self.steps {
            match record.outcome {
                StepOutcome::AlreadySatisfied => counts.already_satisfied += 1,
                StepOutcome::Applied => counts.applied += 1,
                StepOutcome::Failed(_) => counts.failed += 1,
            }
        }
        counts
    }

    /// Records in `stage`, in plan order.
    pub fn stage_records(&self, stage: Stage) -> impl Iterator<Item = &StepRecord> {
        self.steps.iter().filter(move |r| r.stage == stage)
    }

    pub fn failed_steps(&self) -> Vec<&StepRecord> {
        self.steps.iter().filter(|r| r.outcome.is_failure()).collect()
    }

    pub fn exit_code(&self) -> u8 {
        self.state.exit_code()
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Writes the JSON report atomically (temp file in the same directory, then rename).
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(self.to_json_pretty()?.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path).map_err(|err| {
            BootError::IoError(format!("persist report '{}': {}", path.display(), err.error))
        })?;
        Ok(())
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "bootstrap run {} ({})", self.run_id, self.state)?;
        let mut current: Option<Stage> = None;
        for record in &self.steps {
            if current != Some(record.stage) {
                writeln!(f, "  {}", record.stage)?;
                current = Some(record.stage);
            }
            writeln!(
                f,
                "    {:<52} {} [{}ms]",
                record.step.to_string(),
                record.outcome,
                record.elapsed_ms
            )?;
        }
        let counts = self.counts();
        write!(
            f,
            "  summary: {} applied, {} already satisfied, {} failed",
            counts.applied, counts.already_satisfied, counts.failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    fn record(step: StepId, stage: Stage, outcome: StepOutcome) -> StepRecord {
        StepRecord {
            step,
            stage,
            outcome,
            elapsed_ms: 1,
        }
    }

    #[tokio::test]
    async fn test_collector_and_plan_ordering() {
        let plan = Topology::blog_cluster().plan().unwrap();
        let collector = ReportCollector::new();
        collector
            .record(record(
                StepId::initiate_replica_set("shard2"),
                Stage::ShardReplicaSets,
                StepOutcome::Applied,
            ))
            .await;
        collector
            .record(record(
                StepId::initiate_replica_set("cfg"),
                Stage::ConfigReplicaSet,
                StepOutcome::AlreadySatisfied,
            ))
            .await;

        let report = RunReport::assemble(
            Uuid::new_v4(),
            Utc::now(),
            RunState::Completed,
            &plan,
            collector.snapshot().await,
        );
        assert_eq!(report.steps[0].step, StepId::initiate_replica_set("cfg"));
        assert_eq!(
            report.counts(),
            OutcomeCounts {
                already_satisfied: 1,
                applied: 1,
                failed: 0
            }
        );
        assert_eq!(report.exit_code(), 0);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunState::Completed.exit_code(), 0);
        assert_ne!(RunState::CompletedWithFailures.exit_code(), 0);
        assert_ne!(RunState::Aborted.exit_code(), 0);
        assert_ne!(RunState::Cancelled.exit_code(), 0);
        assert!(!RunState::Running.is_finished());
    }

    #[test]
    fn test_outcome_serializes_with_reason() {
        let outcome = StepOutcome::failed(FailureReason::conflict("E11000 duplicate key"));
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["kind"], "semantic_conflict");
        assert_eq!(json["detail"], "E11000 duplicate key");
        assert_eq!(outcome.to_string(), "FAILED (conflict: E11000 duplicate key)");
    }
}
