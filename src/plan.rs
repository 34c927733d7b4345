//! The bootstrap procedure as an ordered dependency graph of named steps.

use crate::core::{BootError, Result};
use crate::topology::{IndexSpec, ReplicaSetSpec, ShardRegistration, ShardedCollectionSpec, Topology};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Stages run strictly in this order, separated by a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    ConfigReplicaSet,
    ShardReplicaSets,
    ShardRegistration,
    DatabaseSharding,
    CollectionSharding,
    Indexes,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::ConfigReplicaSet,
        Stage::ShardReplicaSets,
        Stage::ShardRegistration,
        Stage::DatabaseSharding,
        Stage::CollectionSharding,
        Stage::Indexes,
    ];

    /// 1-based position in the run.
    pub fn ordinal(self) -> u8 {
        match self {
            Stage::ConfigReplicaSet => 1,
            Stage::ShardReplicaSets => 2,
            Stage::ShardRegistration => 3,
            Stage::DatabaseSharding => 4,
            Stage::CollectionSharding => 5,
            Stage::Indexes => 6,
        }
    }

    /// A failure here leaves no healthy replica set to build on, so the
    /// run stops instead of continuing with later stages.
    pub fn aborts_on_failure(self) -> bool {
        matches!(self, Stage::ConfigReplicaSet | Stage::ShardReplicaSets)
    }

    pub fn label(self) -> &'static str {
        match self {
            Stage::ConfigReplicaSet => "config replica set",
            Stage::ShardReplicaSets => "shard replica sets",
            Stage::ShardRegistration => "shard registration",
            Stage::DatabaseSharding => "database sharding",
            Stage::CollectionSharding => "collection sharding",
            Stage::Indexes => "indexes",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}. {}", self.ordinal(), self.label())
    }
}

/// Stable identity of a step, unique within a plan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepId {
    InitiateReplicaSet { replica_set: String },
    RegisterShard { shard: String },
    EnableSharding { database: String },
    ShardCollection { namespace: String },
    CreateIndex { namespace: String, name: String },
}

impl StepId {
    pub fn initiate_replica_set(name: impl Into<String>) -> Self {
        Self::InitiateReplicaSet {
            replica_set: name.into(),
        }
    }

    pub fn register_shard(name: impl Into<String>) -> Self {
        Self::RegisterShard { shard: name.into() }
    }

    pub fn enable_sharding(database: impl Into<String>) -> Self {
        Self::EnableSharding {
            database: database.into(),
        }
    }

    pub fn shard_collection(namespace: impl Into<String>) -> Self {
        Self::ShardCollection {
            namespace: namespace.into(),
        }
    }

    pub fn create_index(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::CreateIndex {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepId::InitiateReplicaSet { replica_set } => {
                write!(f, "initiate-replica-set:{}", replica_set)
            }
            StepId::RegisterShard { shard } => write!(f, "register-shard:{}", shard),
            StepId::EnableSharding { database } => write!(f, "enable-sharding:{}", database),
            StepId::ShardCollection { namespace } => write!(f, "shard-collection:{}", namespace),
            StepId::CreateIndex { namespace, name } => {
                write!(f, "create-index:{}/{}", namespace, name)
            }
        }
    }
}

/// The mutating action a step performs, with everything it needs resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    InitiateReplicaSet(ReplicaSetSpec),
    RegisterShard {
        shard: ShardRegistration,
        connection_string: String,
        hosts: Vec<String>,
    },
    EnableSharding {
        database: String,
    },
    ShardCollection(ShardedCollectionSpec),
    CreateIndex(IndexSpec),
}

/// Preconditions a step has on earlier steps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    None,
    /// Every listed step must resolve Applied or AlreadySatisfied.
    AllOf(Vec<StepId>),
    /// At least one listed step must resolve Applied or AlreadySatisfied.
    AnyOf(Vec<StepId>),
}

impl Dependency {
    pub fn steps(&self) -> &[StepId] {
        match self {
            Dependency::None => &[],
            Dependency::AllOf(ids) | Dependency::AnyOf(ids) => ids,
        }
    }

    /// Decides whether the precondition holds given a lookup of resolved steps.
    ///
    /// `succeeded` returns `Some(true)` for a step that resolved Applied or
    /// AlreadySatisfied, `Some(false)` for a failed one and `None` if the step
    /// has not resolved.
    pub fn is_met<F>(&self, succeeded: F) -> bool
    where
        F: Fn(&StepId) -> Option<bool>,
    {
        match self {
            Dependency::None => true,
            Dependency::AllOf(ids) => ids.iter().all(|id| succeeded(id) == Some(true)),
            Dependency::AnyOf(ids) => ids.iter().any(|id| succeeded(id) == Some(true)),
        }
    }
}

/// One node of the plan graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStep {
    pub id: StepId,
    pub stage: Stage,
    pub action: StepAction,
    pub dependency: Dependency,
}

/// All steps of one stage; they are mutually independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedStage {
    pub stage: Stage,
    pub steps: Vec<PlannedStep>,
}

/// Ordered stages of the bootstrap procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapPlan {
    stages: Vec<PlannedStage>,
}

impl BootstrapPlan {
    /// Builds the plan for a topology, validating the topology first.
    pub fn from_topology(topology: &Topology) -> Result<Self> {
        topology.validate()?;

        let config_rs = topology
            .config_replica_set()
            .ok_or_else(|| BootError::config("no config-server replica set declared"))?;
        let config_step = StepId::initiate_replica_set(&config_rs.name);

        let mut stages = Stage::ALL
            .iter()
            .map(|stage| PlannedStage {
                stage: *stage,
                steps: Vec::new(),
            })
            .collect::<Vec<_>>();
        let mut push = |step: PlannedStep| {
            let slot = (step.stage.ordinal() - 1) as usize;
            stages[slot].steps.push(step);
        };

        push(PlannedStep {
            id: config_step.clone(),
            stage: Stage::ConfigReplicaSet,
            action: StepAction::InitiateReplicaSet(config_rs.clone()),
            dependency: Dependency::None,
        });

        for rs in topology.data_replica_sets() {
            push(PlannedStep {
                id: StepId::initiate_replica_set(&rs.name),
                stage: Stage::ShardReplicaSets,
                action: StepAction::InitiateReplicaSet(rs.clone()),
                dependency: Dependency::AllOf(vec![config_step.clone()]),
            });
        }

        let mut shard_steps = Vec::with_capacity(topology.shards.len());
        for shard in &topology.shards {
            let rs = topology.replica_set(&shard.replica_set).ok_or_else(|| {
                BootError::config(format!(
                    "shard '{}' references unknown replica set '{}'",
                    shard.name, shard.replica_set
                ))
            })?;
            let id = StepId::register_shard(&shard.name);
            shard_steps.push(id.clone());
            push(PlannedStep {
                id,
                stage: Stage::ShardRegistration,
                action: StepAction::RegisterShard {
                    shard: shard.clone(),
                    connection_string: rs.connection_string(),
                    hosts: rs.hosts().into_iter().map(str::to_string).collect(),
                },
                dependency: Dependency::AllOf(vec![StepId::initiate_replica_set(&rs.name)]),
            });
        }

        for db in &topology.databases {
            let enable = StepId::enable_sharding(&db.name);
            push(PlannedStep {
                id: enable.clone(),
                stage: Stage::DatabaseSharding,
                action: StepAction::EnableSharding {
                    database: db.name.clone(),
                },
                dependency: Dependency::AnyOf(shard_steps.clone()),
            });
            for collection in db.sharded_collections() {
                push(PlannedStep {
                    id: StepId::shard_collection(collection.namespace()),
                    stage: Stage::CollectionSharding,
                    action: StepAction::ShardCollection(collection),
                    dependency: Dependency::AllOf(vec![enable.clone()]),
                });
            }
        }

        for index in &topology.indexes {
            push(PlannedStep {
                id: StepId::create_index(index.namespace(), &index.options.name),
                stage: Stage::Indexes,
                action: StepAction::CreateIndex(index.clone()),
                dependency: Dependency::None,
            });
        }

        let plan = Self { stages };
        plan.check_graph()?;
        Ok(plan)
    }

    /// Ensures ids are unique and every dependency points into an earlier stage.
    fn check_graph(&self) -> Result<()> {
        let mut placed: HashMap<&StepId, Stage> = HashMap::new();
        for planned in &self.stages {
            for step in &planned.steps {
                for dep in step.dependency.steps() {
                    match placed.get(dep) {
                        Some(stage) if *stage < step.stage => {}
                        _ => {
                            return Err(BootError::ExecutionError(format!(
                                "step '{}' depends on '{}' which is not scheduled before it",
                                step.id, dep
                            )));
                        }
                    }
                }
            }
            for step in &planned.steps {
                if placed.insert(&step.id, step.stage).is_some() {
                    return Err(BootError::config(format!(
                        "step '{}' is planned more than once",
                        step.id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Stages in execution order, including empty ones.
    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn steps(&self) -> impl Iterator<Item = &PlannedStep> {
        self.stages.iter().flat_map(|s| s.steps.iter())
    }

    pub fn step(&self, id: &StepId) -> Option<&PlannedStep> {
        self.steps().find(|s| &s.id == id)
    }

    pub fn len(&self) -> usize {
        self.stages.iter().map(|s| s.steps.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for BootstrapPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for planned in &self.stages {
            writeln!(f, "{}", planned.stage)?;
            if planned.steps.is_empty() {
                writeln!(f, "    (nothing to do)")?;
            }
            for step in &planned.steps {
                match &step.dependency {
                    Dependency::None => writeln!(f, "    {}", step.id)?,
                    Dependency::AllOf(ids) => writeln!(
                        f,
                        "    {}  <- all of [{}]",
                        step.id,
                        join_ids(ids)
                    )?,
                    Dependency::AnyOf(ids) => writeln!(
                        f,
                        "    {}  <- any of [{}]",
                        step.id,
                        join_ids(ids)
                    )?,
                }
            }
        }
        Ok(())
    }
}

fn join_ids(ids: &[StepId]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blog_cluster_plan_shape() {
        let plan = Topology::blog_cluster().plan().unwrap();
        let counts = plan
            .stages()
            .iter()
            .map(|s| s.steps.len())
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![1, 2, 2, 1, 2, 8]);
        assert_eq!(plan.len(), 16);
        assert!(!plan.is_empty());
    }

    #[test]
    fn test_shard_registration_depends_on_own_replica_set() {
        let plan = Topology::blog_cluster().plan().unwrap();
        let step = plan.step(&StepId::register_shard("shard2")).unwrap();
        assert_eq!(
            step.dependency,
            Dependency::AllOf(vec![StepId::initiate_replica_set("shard2")])
        );
        match &step.action {
            StepAction::RegisterShard {
                connection_string, ..
            } => assert_eq!(
                connection_string,
                "shard2/mongo-shard2-1:27017,mongo-shard2-2:27017,mongo-shard2-3:27017"
            ),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_enable_sharding_needs_any_shard() {
        let plan = Topology::blog_cluster().plan().unwrap();
        let step = plan.step(&StepId::enable_sharding("blog_db")).unwrap();
        let dep = &step.dependency;
        assert!(matches!(dep, Dependency::AnyOf(ids) if ids.len() == 2));

        let shard1 = StepId::register_shard("shard1");
        assert!(dep.is_met(|id| Some(id == &shard1)));
        assert!(!dep.is_met(|_| Some(false)));
        assert!(!dep.is_met(|_| None));
    }

    #[test]
    fn test_step_id_display() {
        assert_eq!(
            StepId::create_index("blog_db.users", "uidx_users_email").to_string(),
            "create-index:blog_db.users/uidx_users_email"
        );
        assert_eq!(
            StepId::initiate_replica_set("cfg").to_string(),
            "initiate-replica-set:cfg"
        );
    }

    #[test]
    fn test_only_first_two_stages_abort() {
        let aborting = Stage::ALL
            .iter()
            .filter(|s| s.aborts_on_failure())
            .count();
        assert_eq!(aborting, 2);
        assert!(Stage::ShardReplicaSets < Stage::ShardRegistration);
    }

    #[test]
    fn test_plan_rendering_lists_every_stage() {
        let rendered = Topology::blog_cluster().plan().unwrap().to_string();
        for stage in Stage::ALL {
            assert!(rendered.contains(&stage.to_string()));
        }
        assert!(rendered.contains("register-shard:shard1  <- all of [initiate-replica-set:shard1]"));
    }
}
