//! Read-only probes that decide whether a step still needs to run.

use crate::client::{ControlPlane, ControlPlaneError, codes};
use crate::plan::{PlannedStep, StepAction};
use crate::topology::{IndexSpec, ReplicaSetSpec, ShardedCollectionSpec};
use std::sync::Arc;

/// What a probe learned about the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    /// The step's goal already holds; skip it.
    Satisfied,
    /// The goal does not hold yet; apply the step.
    NotSatisfied,
    /// The probe got an answer it cannot interpret; treated as not satisfied.
    Inconclusive(String),
    /// The cluster holds something incompatible with the goal.
    Conflict(String),
    /// The probe could not talk to the cluster at all.
    Unreachable(ControlPlaneError),
}

impl ProbeVerdict {
    /// True if the executor should run after this verdict.
    pub fn requires_apply(&self) -> bool {
        matches!(self, ProbeVerdict::NotSatisfied | ProbeVerdict::Inconclusive(_))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GuardPolicy {
    /// Skip the database and collection sharding probes and rely on the
    /// engine treating repeated enablement as a no-op.
    pub trust_engine_idempotence: bool,
}

/// Probes current cluster state for a step without side effects.
#[derive(Clone)]
pub struct IdempotencyGuard {
    control: Arc<dyn ControlPlane>,
    policy: GuardPolicy,
}

impl IdempotencyGuard {
    pub fn new(control: Arc<dyn ControlPlane>, policy: GuardPolicy) -> Self {
        Self { control, policy }
    }

    pub fn policy(&self) -> GuardPolicy {
        self.policy
    }

    pub async fn probe(&self, step: &PlannedStep) -> ProbeVerdict {
        match &step.action {
            StepAction::InitiateReplicaSet(rs) => self.probe_replica_set(rs).await,
            StepAction::RegisterShard { shard, hosts, .. } => {
                self.probe_shard(&shard.name, hosts).await
            }
            StepAction::EnableSharding { database } => self.probe_database(database).await,
            StepAction::ShardCollection(collection) => self.probe_collection(collection).await,
            StepAction::CreateIndex(index) => self.probe_index(index).await,
        }
    }

    async fn probe_replica_set(&self, rs: &ReplicaSetSpec) -> ProbeVerdict {
        match self.control.replica_set_status(rs).await {
            Ok(status) if status.set_name != rs.name => ProbeVerdict::Conflict(format!(
                "seed member {} belongs to replica set '{}', expected '{}'",
                rs.seed_host().unwrap_or_default(),
                status.set_name,
                rs.name
            )),
            Ok(status) if status.is_healthy() => ProbeVerdict::Satisfied,
            Ok(status) => ProbeVerdict::Inconclusive(format!(
                "replica set '{}' is initialized but has no primary ({})",
                rs.name,
                status
                    .members
                    .iter()
                    .map(|m| format!("{}={}", m.host, m.state.as_str()))
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            Err(err) if err.has_code(codes::NOT_YET_INITIALIZED) => ProbeVerdict::NotSatisfied,
            Err(err) => classify_probe_error(err),
        }
    }

    async fn probe_shard(&self, name: &str, hosts: &[String]) -> ProbeVerdict {
        let shards = match self.control.list_shards().await {
            Ok(shards) => shards,
            Err(err) => return classify_probe_error(err),
        };
        let Some(existing) = shards.iter().find(|s| s.name == name) else {
            return ProbeVerdict::NotSatisfied;
        };
        let mut wanted = hosts.iter().map(String::as_str).collect::<Vec<_>>();
        wanted.sort_unstable();
        if existing.hosts() == wanted {
            ProbeVerdict::Satisfied
        } else {
            ProbeVerdict::Conflict(format!(
                "shard '{}' is already registered as '{}' with different members",
                name, existing.host
            ))
        }
    }

    async fn probe_database(&self, database: &str) -> ProbeVerdict {
        if self.policy.trust_engine_idempotence {
            return ProbeVerdict::NotSatisfied;
        }
        match self.control.database_sharding(database).await {
            Ok(true) => ProbeVerdict::Satisfied,
            Ok(false) => ProbeVerdict::NotSatisfied,
            Err(err) => classify_probe_error(err),
        }
    }

    async fn probe_collection(&self, collection: &ShardedCollectionSpec) -> ProbeVerdict {
        if self.policy.trust_engine_idempotence {
            return ProbeVerdict::NotSatisfied;
        }
        match self
            .control
            .collection_shard_key(&collection.database, &collection.collection)
            .await
        {
            Ok(Some(key)) if key == collection.shard_key => ProbeVerdict::Satisfied,
            Ok(Some(key)) => ProbeVerdict::Conflict(format!(
                "collection '{}' is already sharded by {} instead of {}",
                collection.namespace(),
                key,
                collection.shard_key
            )),
            Ok(None) => ProbeVerdict::NotSatisfied,
            Err(err) => classify_probe_error(err),
        }
    }

    async fn probe_index(&self, index: &IndexSpec) -> ProbeVerdict {
        let existing = match self
            .control
            .list_indexes(&index.database, &index.collection)
            .await
        {
            Ok(existing) => existing,
            Err(err) if err.has_code(codes::NAMESPACE_NOT_FOUND) => return ProbeVerdict::NotSatisfied,
            Err(err) => return classify_probe_error(err),
        };

        if let Some(same_name) = existing.iter().find(|i| i.name == index.options.name) {
            if same_name.matches(index) {
                return ProbeVerdict::Satisfied;
            }
            return ProbeVerdict::Conflict(format!(
                "index '{}' on '{}' exists as {} (unique={}, sparse={}), wanted {} (unique={}, sparse={})",
                same_name.name,
                index.namespace(),
                same_name.keys,
                same_name.unique,
                same_name.sparse,
                index.keys,
                index.options.unique,
                index.options.sparse
            ));
        }
        if let Some(same_keys) = existing.iter().find(|i| i.keys == index.keys) {
            return ProbeVerdict::Conflict(format!(
                "key pattern {} on '{}' is already indexed as '{}'",
                index.keys,
                index.namespace(),
                same_keys.name
            ));
        }
        ProbeVerdict::NotSatisfied
    }
}

/// Communication failures stay failures; engine errors and undecodable
/// replies on a read-only probe only make the probe inconclusive.
fn classify_probe_error(err: ControlPlaneError) -> ProbeVerdict {
    if err.is_communication() {
        ProbeVerdict::Unreachable(err)
    } else {
        ProbeVerdict::Inconclusive(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{InMemoryControlPlane, Operation};
    use crate::plan::StepId;
    use crate::topology::Topology;

    fn setup() -> (InMemoryControlPlane, IdempotencyGuard, crate::plan::BootstrapPlan) {
        let topology = Topology::blog_cluster();
        let cluster = InMemoryControlPlane::new(topology.router.clone());
        let guard = IdempotencyGuard::new(Arc::new(cluster.clone()), GuardPolicy::default());
        (cluster, guard, topology.plan().unwrap())
    }

    #[tokio::test]
    async fn test_uninitialized_replica_set_is_not_satisfied() {
        let (_cluster, guard, plan) = setup();
        let step = plan.step(&StepId::initiate_replica_set("cfg")).unwrap();
        assert_eq!(guard.probe(step).await, ProbeVerdict::NotSatisfied);
    }

    #[tokio::test]
    async fn test_replica_set_without_primary_is_inconclusive() {
        let (cluster, guard, plan) = setup();
        let step = plan.step(&StepId::initiate_replica_set("shard1")).unwrap();
        cluster.hold_elections(true).await;
        if let StepAction::InitiateReplicaSet(rs) = &step.action {
            cluster.initiate_replica_set(rs).await.unwrap();
        }
        let verdict = guard.probe(step).await;
        assert!(matches!(verdict, ProbeVerdict::Inconclusive(_)));
        assert!(verdict.requires_apply());
    }

    #[tokio::test]
    async fn test_unreachable_seed_is_not_masked() {
        let (cluster, guard, plan) = setup();
        cluster.set_unreachable("mongo-cfg1:27017", true).await;
        let step = plan.step(&StepId::initiate_replica_set("cfg")).unwrap();
        let verdict = guard.probe(step).await;
        assert!(matches!(verdict, ProbeVerdict::Unreachable(_)));
        assert!(!verdict.requires_apply());
    }

    #[tokio::test]
    async fn test_list_shards_command_error_is_inconclusive() {
        let (cluster, guard, plan) = setup();
        cluster
            .fail(
                Operation::ListShards,
                None,
                ControlPlaneError::command(codes::OPERATION_FAILED, "OperationFailed", "boom"),
            )
            .await;
        let step = plan.step(&StepId::register_shard("shard1")).unwrap();
        assert!(matches!(guard.probe(step).await, ProbeVerdict::Inconclusive(_)));
    }

    #[tokio::test]
    async fn test_trusting_engine_skips_sharding_probes() {
        let (cluster, _guard, plan) = setup();
        let guard = IdempotencyGuard::new(
            Arc::new(cluster.clone()),
            GuardPolicy {
                trust_engine_idempotence: true,
            },
        );
        let step = plan.step(&StepId::enable_sharding("blog_db")).unwrap();
        assert_eq!(guard.probe(step).await, ProbeVerdict::NotSatisfied);
        assert!(cluster.calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_index_with_other_name_conflicts() {
        let (cluster, guard, plan) = setup();
        let renamed = IndexSpec::new(
            "blog_db",
            "blogs",
            "tags_1",
            crate::topology::KeyPattern::new().asc("tags"),
        );
        cluster.create_index(&renamed).await.unwrap();
        let step = plan
            .step(&StepId::create_index("blog_db.blogs", "idx_blogs_tags"))
            .unwrap();
        assert!(matches!(guard.probe(step).await, ProbeVerdict::Conflict(_)));
    }
}
