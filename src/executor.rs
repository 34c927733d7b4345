//! Applies exactly one mutating action per step.

use crate::client::{ControlPlane, ControlPlaneError, codes};
use crate::plan::{PlannedStep, StepAction};
use crate::report::{FailureReason, StepOutcome};
use std::sync::Arc;

/// Runs a step's mutation and translates the engine's answer.
///
/// Never retries; a failed step is reported and left for the next run.
#[derive(Clone)]
pub struct StepExecutor {
    control: Arc<dyn ControlPlane>,
}

impl StepExecutor {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self { control }
    }

    pub async fn execute(&self, step: &PlannedStep) -> StepOutcome {
        let result = match &step.action {
            StepAction::InitiateReplicaSet(rs) => {
                match self.control.initiate_replica_set(rs).await {
                    // Another run initiated it between our probe and now.
                    Err(err) if err.has_code(codes::ALREADY_INITIALIZED) => {
                        return StepOutcome::AlreadySatisfied;
                    }
                    other => other,
                }
            }
            StepAction::RegisterShard {
                shard,
                connection_string,
                ..
            } => self.control.add_shard(shard, connection_string).await,
            StepAction::EnableSharding { database } => self.control.enable_sharding(database).await,
            StepAction::ShardCollection(collection) => {
                self.control.shard_collection(collection).await
            }
            StepAction::CreateIndex(index) => self.control.create_index(index).await,
        };
        classify(result)
    }
}

fn classify(result: Result<(), ControlPlaneError>) -> StepOutcome {
    match result {
        Ok(()) => StepOutcome::Applied,
        Err(err) => StepOutcome::failed(FailureReason::from_control_error(&err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryControlPlane, Operation};
    use crate::plan::StepId;
    use crate::report::FailureKind;
    use crate::topology::Topology;
    use serde_json::json;

    fn setup() -> (InMemoryControlPlane, StepExecutor, crate::plan::BootstrapPlan) {
        let topology = Topology::blog_cluster();
        let cluster = InMemoryControlPlane::new(topology.router.clone());
        let executor = StepExecutor::new(Arc::new(cluster.clone()));
        (cluster, executor, topology.plan().unwrap())
    }

    #[tokio::test]
    async fn test_initiate_twice_is_already_satisfied() {
        let (_cluster, executor, plan) = setup();
        let step = plan.step(&StepId::initiate_replica_set("cfg")).unwrap();
        assert_eq!(executor.execute(step).await, StepOutcome::Applied);
        assert_eq!(executor.execute(step).await, StepOutcome::AlreadySatisfied);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let (cluster, executor, plan) = setup();
        cluster
            .fail(
                Operation::AddShard,
                Some("shard1"),
                ControlPlaneError::Timeout {
                    target: "mongos:27017".to_string(),
                    after_ms: 100,
                },
            )
            .await;
        let step = plan.step(&StepId::register_shard("shard1")).unwrap();
        let outcome = executor.execute(step).await;
        assert_eq!(
            outcome.failure().map(|r| r.kind),
            Some(FailureKind::TransientCommunication)
        );
    }

    #[tokio::test]
    async fn test_duplicate_data_is_semantic_conflict() {
        let (cluster, executor, plan) = setup();
        cluster
            .seed_documents(
                "blog_db.users",
                vec![json!({"username": "ann"}), json!({"username": "ann"})],
            )
            .await;
        let step = plan
            .step(&StepId::create_index("blog_db.users", "uidx_users_username"))
            .unwrap();
        let outcome = executor.execute(step).await;
        let reason = outcome.failure().unwrap();
        assert_eq!(reason.kind, FailureKind::SemanticConflict);
        assert!(reason.detail.contains("E11000"));
    }

    #[tokio::test]
    async fn test_shard_collection_before_enable_is_conflict() {
        let (_cluster, executor, plan) = setup();
        let step = plan
            .step(&StepId::shard_collection("blog_db.blogs"))
            .unwrap();
        let outcome = executor.execute(step).await;
        assert_eq!(
            outcome.failure().map(|r| r.kind),
            Some(FailureKind::SemanticConflict)
        );
    }
}
