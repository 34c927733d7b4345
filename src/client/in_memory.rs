use super::{
    ControlPlane, ControlPlaneError, ControlResult, ExistingIndex, MemberState, MemberStatus,
    RegisteredShard, ReplicaSetStatus, codes,
};
use crate::topology::{IndexSpec, KeyPattern, ReplicaSetSpec, ShardRegistration, ShardedCollectionSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

/// Control-plane operations, used to address faults and to read the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    ReplicaSetStatus,
    InitiateReplicaSet,
    ListShards,
    AddShard,
    EnableSharding,
    DatabaseSharding,
    ShardCollection,
    CollectionShardKey,
    CreateIndex,
    ListIndexes,
}

impl Operation {
    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            Operation::InitiateReplicaSet
                | Operation::AddShard
                | Operation::EnableSharding
                | Operation::ShardCollection
                | Operation::CreateIndex
        )
    }
}

/// One call received by the simulated cluster.
///
/// `target` names what the call is about: the replica set, shard, database,
/// namespace, `namespace/index`, or `router` for shard listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPlaneCall {
    pub operation: Operation,
    pub target: String,
}

#[derive(Debug, Clone)]
struct Fault {
    operation: Operation,
    target: Option<String>,
    error: ControlPlaneError,
    remaining: Option<u32>,
}

#[derive(Debug, Clone)]
struct SimulatedReplicaSet {
    spec: ReplicaSetSpec,
    primary_elected: bool,
}

#[derive(Debug, Default)]
struct SimulatedCluster {
    /// Initiated replica sets keyed by seed host.
    replica_sets: HashMap<String, SimulatedReplicaSet>,
    shards: Vec<RegisteredShard>,
    sharded_databases: HashSet<String>,
    shard_keys: HashMap<String, KeyPattern>,
    indexes: HashMap<String, Vec<ExistingIndex>>,
    documents: HashMap<String, Vec<JsonValue>>,
    unreachable: HashSet<String>,
    latency: HashMap<Operation, Duration>,
    faults: Vec<Fault>,
    calls: Vec<ControlPlaneCall>,
    hold_elections: bool,
}

impl SimulatedCluster {
    fn take_fault(&mut self, operation: Operation, target: &str) -> Option<ControlPlaneError> {
        let position = self.faults.iter().position(|fault| {
            fault.operation == operation
                && fault.target.as_deref().is_none_or(|t| t == target)
                && fault.remaining != Some(0)
        })?;
        let fault = &mut self.faults[position];
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(fault.error.clone())
    }

    fn namespace_exists(&self, namespace: &str) -> bool {
        self.indexes.contains_key(namespace)
            || self.documents.contains_key(namespace)
            || self.shard_keys.contains_key(namespace)
    }

    /// Creates the implicit `_id_` index the first time a namespace is touched.
    fn ensure_namespace(&mut self, namespace: &str) -> &mut Vec<ExistingIndex> {
        self.indexes.entry(namespace.to_string()).or_insert_with(|| {
            vec![ExistingIndex {
                name: "_id_".to_string(),
                keys: KeyPattern::new().asc("_id"),
                unique: false,
                sparse: false,
            }]
        })
    }

    fn duplicate_values(&self, namespace: &str, keys: &KeyPattern, sparse: bool) -> Option<String> {
        let documents = self.documents.get(namespace)?;
        let mut seen = HashSet::new();
        for doc in documents {
            let values = keys
                .fields()
                .iter()
                .map(|k| doc.get(&k.field).cloned().unwrap_or(JsonValue::Null))
                .collect::<Vec<_>>();
            if sparse && values.iter().all(JsonValue::is_null) {
                continue;
            }
            let rendered = JsonValue::Array(values).to_string();
            if !seen.insert(rendered.clone()) {
                return Some(rendered);
            }
        }
        None
    }
}

/// A simulated cluster implementing [`ControlPlane`] in memory.
///
/// It honours the engine's preconditions (a shard needs an initiated replica
/// set with a primary, enabling sharding needs a shard, sharding a collection
/// needs its database enabled) and its idempotence rules, and supports fault
/// injection, unreachable hosts and artificial latency. Clones share state.
#[derive(Clone, Default)]
pub struct InMemoryControlPlane {
    router: String,
    state: Arc<Mutex<SimulatedCluster>>,
}

impl InMemoryControlPlane {
    /// Creates an empty, uninitialized cluster behind `router`.
    pub fn new(router: impl Into<String>) -> Self {
        Self {
            router: router.into(),
            state: Arc::new(Mutex::new(SimulatedCluster::default())),
        }
    }

    /// Marks a host as unreachable (or reachable again).
    pub async fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.state.lock().await;
        if unreachable {
            state.unreachable.insert(host.to_string());
        } else {
            state.unreachable.remove(host);
        }
    }

    /// Makes every future call of `operation` (on `target`, if given) fail.
    pub async fn fail(&self, operation: Operation, target: Option<&str>, error: ControlPlaneError) {
        self.push_fault(operation, target, error, None).await;
    }

    /// Makes the next call of `operation` (on `target`, if given) fail.
    pub async fn fail_once(&self, operation: Operation, target: Option<&str>, error: ControlPlaneError) {
        self.push_fault(operation, target, error, Some(1)).await;
    }

    async fn push_fault(
        &self,
        operation: Operation,
        target: Option<&str>,
        error: ControlPlaneError,
        remaining: Option<u32>,
    ) {
        let mut state = self.state.lock().await;
        state.faults.push(Fault {
            operation,
            target: target.map(str::to_string),
            error,
            remaining,
        });
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }

    /// Delays every call of `operation` before it is handled.
    pub async fn set_latency(&self, operation: Operation, latency: Duration) {
        self.state.lock().await.latency.insert(operation, latency);
    }

    /// When held, initiated replica sets report no primary until released.
    pub async fn hold_elections(&self, hold: bool) {
        let mut state = self.state.lock().await;
        state.hold_elections = hold;
        if !hold {
            for rs in state.replica_sets.values_mut() {
                rs.primary_elected = true;
            }
        }
    }

    /// Seeds documents into a collection, e.g. to provoke unique-index conflicts.
    pub async fn seed_documents(&self, namespace: &str, documents: Vec<JsonValue>) {
        let mut state = self.state.lock().await;
        state.ensure_namespace(namespace);
        state
            .documents
            .entry(namespace.to_string())
            .or_default()
            .extend(documents);
    }

    pub async fn calls(&self) -> Vec<ControlPlaneCall> {
        self.state.lock().await.calls.clone()
    }

    /// Calls that reached a mutating operation.
    pub async fn mutations(&self) -> Vec<ControlPlaneCall> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation.is_mutation())
            .cloned()
            .collect()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn is_initiated(&self, replica_set: &str) -> bool {
        self.state
            .lock()
            .await
            .replica_sets
            .values()
            .any(|rs| rs.spec.name == replica_set)
    }

    pub async fn registered_shards(&self) -> Vec<RegisteredShard> {
        self.state.lock().await.shards.clone()
    }

    pub async fn indexes(&self, namespace: &str) -> Vec<ExistingIndex> {
        self.state
            .lock()
            .await
            .indexes
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Records the call, applies latency, reachability and injected faults.
    async fn enter(&self, operation: Operation, target: &str, host: &str) -> ControlResult<()> {
        let latency = {
            let mut state = self.state.lock().await;
            state.calls.push(ControlPlaneCall {
                operation,
                target: target.to_string(),
            });
            state.latency.get(&operation).copied()
        };
        if let Some(latency) = latency {
            sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        if state.unreachable.contains(host) {
            return Err(ControlPlaneError::Unreachable {
                target: host.to_string(),
                detail: "connection refused".to_string(),
            });
        }
        match state.take_fault(operation, target) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn seed(replica_set: &ReplicaSetSpec) -> ControlResult<&str> {
        replica_set.seed_host().ok_or_else(|| {
            ControlPlaneError::Protocol(format!("replica set '{}' has no members", replica_set.name))
        })
    }
}

#[async_trait]
impl ControlPlane for InMemoryControlPlane {
    async fn replica_set_status(&self, replica_set: &ReplicaSetSpec) -> ControlResult<ReplicaSetStatus> {
        let seed = Self::seed(replica_set)?;
        self.enter(Operation::ReplicaSetStatus, &replica_set.name, seed)
            .await?;
        let state = self.state.lock().await;
        let Some(rs) = state.replica_sets.get(seed) else {
            return Err(ControlPlaneError::command(
                codes::NOT_YET_INITIALIZED,
                "NotYetInitialized",
                "no replset config has been received",
            ));
        };
        let members = rs
            .spec
            .members
            .iter()
            .map(|m| MemberStatus {
                id: m.id,
                host: m.host.clone(),
                state: match (rs.primary_elected, m.id) {
                    (true, 0) => MemberState::Primary,
                    (true, _) => MemberState::Secondary,
                    (false, _) => MemberState::Startup2,
                },
            })
            .collect();
        Ok(ReplicaSetStatus {
            set_name: rs.spec.name.clone(),
            members,
        })
    }

    async fn initiate_replica_set(&self, replica_set: &ReplicaSetSpec) -> ControlResult<()> {
        let seed = Self::seed(replica_set)?;
        self.enter(Operation::InitiateReplicaSet, &replica_set.name, seed)
            .await?;
        let mut state = self.state.lock().await;
        if state.replica_sets.contains_key(seed) {
            return Err(ControlPlaneError::command(
                codes::ALREADY_INITIALIZED,
                "AlreadyInitialized",
                "already initialized",
            ));
        }
        if let Some(down) = replica_set
            .hosts()
            .into_iter()
            .find(|h| state.unreachable.contains(*h))
        {
            return Err(ControlPlaneError::command(
                codes::NODE_NOT_FOUND,
                "NodeNotFound",
                format!("replSetInitiate quorum check failed because {} is down", down),
            ));
        }
        let primary_elected = !state.hold_elections;
        state.replica_sets.insert(
            seed.to_string(),
            SimulatedReplicaSet {
                spec: replica_set.clone(),
                primary_elected,
            },
        );
        Ok(())
    }

    async fn list_shards(&self) -> ControlResult<Vec<RegisteredShard>> {
        self.enter(Operation::ListShards, "router", &self.router)
            .await?;
        Ok(self.state.lock().await.shards.clone())
    }

    async fn add_shard(&self, shard: &ShardRegistration, connection_string: &str) -> ControlResult<()> {
        self.enter(Operation::AddShard, &shard.name, &self.router)
            .await?;
        let candidate = RegisteredShard {
            name: shard.name.clone(),
            host: connection_string.to_string(),
        };
        let (set_name, hosts) = connection_string.split_once('/').ok_or_else(|| {
            ControlPlaneError::command(
                codes::OPERATION_FAILED,
                "FailedToParse",
                format!("invalid shard connection string '{}'", connection_string),
            )
        })?;
        let seed = hosts.split(',').next().unwrap_or_default();

        let mut state = self.state.lock().await;
        match state.replica_sets.get(seed) {
            Some(rs) if rs.spec.name == set_name && rs.primary_elected => {}
            Some(rs) if rs.spec.name != set_name => {
                return Err(ControlPlaneError::command(
                    codes::OPERATION_FAILED,
                    "OperationFailed",
                    format!(
                        "host {} belongs to replica set '{}', not '{}'",
                        seed, rs.spec.name, set_name
                    ),
                ));
            }
            Some(_) => {
                return Err(ControlPlaneError::command(
                    codes::FAILED_TO_SATISFY_READ_PREFERENCE,
                    "FailedToSatisfyReadPreference",
                    format!("could not find host matching read preference for set {}", set_name),
                ));
            }
            None => {
                return Err(ControlPlaneError::command(
                    codes::OPERATION_FAILED,
                    "OperationFailed",
                    format!("replica set {} is not initiated", set_name),
                ));
            }
        }

        if let Some(existing) = state.shards.iter().find(|s| s.name == shard.name) {
            if existing.hosts() == candidate.hosts() {
                return Ok(());
            }
            return Err(ControlPlaneError::command(
                codes::ILLEGAL_OPERATION,
                "IllegalOperation",
                format!(
                    "a shard named '{}' already exists with hosts '{}'",
                    shard.name, existing.host
                ),
            ));
        }
        if let Some(existing) = state
            .shards
            .iter()
            .find(|s| s.host.split_once('/').map(|(rs, _)| rs) == Some(set_name))
        {
            return Err(ControlPlaneError::command(
                codes::ILLEGAL_OPERATION,
                "IllegalOperation",
                format!(
                    "replica set '{}' is already registered as shard '{}'",
                    set_name, existing.name
                ),
            ));
        }
        state.shards.push(candidate);
        Ok(())
    }

    async fn enable_sharding(&self, database: &str) -> ControlResult<()> {
        self.enter(Operation::EnableSharding, database, &self.router)
            .await?;
        let mut state = self.state.lock().await;
        if state.shards.is_empty() {
            return Err(ControlPlaneError::command(
                codes::SHARD_NOT_FOUND,
                "ShardNotFound",
                "no shards found",
            ));
        }
        state.sharded_databases.insert(database.to_string());
        Ok(())
    }

    async fn database_sharding(&self, database: &str) -> ControlResult<bool> {
        self.enter(Operation::DatabaseSharding, database, &self.router)
            .await?;
        Ok(self.state.lock().await.sharded_databases.contains(database))
    }

    async fn shard_collection(&self, collection: &ShardedCollectionSpec) -> ControlResult<()> {
        let namespace = collection.namespace();
        self.enter(Operation::ShardCollection, &namespace, &self.router)
            .await?;
        let mut state = self.state.lock().await;
        if !state.sharded_databases.contains(&collection.database) {
            return Err(ControlPlaneError::command(
                codes::ILLEGAL_OPERATION,
                "IllegalOperation",
                format!("sharding not enabled for db {}", collection.database),
            ));
        }
        let current = state.shard_keys.get(&namespace).cloned();
        match current {
            Some(existing) if existing == collection.shard_key => Ok(()),
            Some(existing) => Err(ControlPlaneError::command(
                codes::ALREADY_INITIALIZED,
                "AlreadyInitialized",
                format!("sharding already enabled for collection {} with options {}", namespace, existing),
            )),
            None => {
                state.ensure_namespace(&namespace);
                state
                    .shard_keys
                    .insert(namespace, collection.shard_key.clone());
                Ok(())
            }
        }
    }

    async fn collection_shard_key(
        &self,
        database: &str,
        collection: &str,
    ) -> ControlResult<Option<KeyPattern>> {
        let namespace = format!("{}.{}", database, collection);
        self.enter(Operation::CollectionShardKey, &namespace, &self.router)
            .await?;
        Ok(self.state.lock().await.shard_keys.get(&namespace).cloned())
    }

    async fn create_index(&self, index: &IndexSpec) -> ControlResult<()> {
        let namespace = index.namespace();
        self.enter(
            Operation::CreateIndex,
            &format!("{}/{}", namespace, index.options.name),
            &self.router,
        )
        .await?;

        let mut state = self.state.lock().await;
        let existing = state.indexes.get(&namespace).cloned().unwrap_or_default();
        if let Some(same_name) = existing.iter().find(|i| i.name == index.options.name) {
            if same_name.matches(index) {
                return Ok(());
            }
            let (code, code_name) = if same_name.keys != index.keys {
                (codes::INDEX_KEY_SPECS_CONFLICT, "IndexKeySpecsConflict")
            } else {
                (codes::INDEX_OPTIONS_CONFLICT, "IndexOptionsConflict")
            };
            return Err(ControlPlaneError::command(
                code,
                code_name,
                format!(
                    "An existing index has the same name as the requested index: {}",
                    same_name.name
                ),
            ));
        }
        if let Some(same_keys) = existing.iter().find(|i| i.keys == index.keys) {
            return Err(ControlPlaneError::command(
                codes::INDEX_OPTIONS_CONFLICT,
                "IndexOptionsConflict",
                format!("Index already exists with a different name: {}", same_keys.name),
            ));
        }
        if index.options.unique {
            if let Some(dup) = state.duplicate_values(&namespace, &index.keys, index.options.sparse) {
                return Err(ControlPlaneError::command(
                    codes::DUPLICATE_KEY,
                    "DuplicateKey",
                    format!(
                        "E11000 duplicate key error collection: {} index: {} dup key: {}",
                        namespace, index.options.name, dup
                    ),
                ));
            }
        }
        state
            .ensure_namespace(&namespace)
            .push(ExistingIndex::from_spec(index));
        Ok(())
    }

    async fn list_indexes(&self, database: &str, collection: &str) -> ControlResult<Vec<ExistingIndex>> {
        let namespace = format!("{}.{}", database, collection);
        self.enter(Operation::ListIndexes, &namespace, &self.router)
            .await?;
        let state = self.state.lock().await;
        if !state.namespace_exists(&namespace) {
            return Err(ControlPlaneError::command(
                codes::NAMESPACE_NOT_FOUND,
                "NamespaceNotFound",
                format!("ns does not exist: {}", namespace),
            ));
        }
        Ok(state.indexes.get(&namespace).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rs(name: &str, prefix: &str) -> ReplicaSetSpec {
        ReplicaSetSpec::new(name, [format!("{}-1:27017", prefix), format!("{}-2:27017", prefix)])
    }

    #[tokio::test]
    async fn test_status_before_and_after_initiate() {
        let cluster = InMemoryControlPlane::new("mongos:27017");
        let spec = rs("shard1", "s1");

        let err = cluster.replica_set_status(&spec).await.unwrap_err();
        assert!(err.has_code(codes::NOT_YET_INITIALIZED));

        cluster.initiate_replica_set(&spec).await.unwrap();
        let status = cluster.replica_set_status(&spec).await.unwrap();
        assert!(status.is_healthy());
        assert_eq!(status.set_name, "shard1");

        let again = cluster.initiate_replica_set(&spec).await.unwrap_err();
        assert!(again.has_code(codes::ALREADY_INITIALIZED));
    }

    #[tokio::test]
    async fn test_add_shard_requires_initiated_set() {
        let cluster = InMemoryControlPlane::new("mongos:27017");
        let spec = rs("shard1", "s1");
        let shard = ShardRegistration::new("shard1", "shard1");

        let err = cluster
            .add_shard(&shard, &spec.connection_string())
            .await
            .unwrap_err();
        assert!(err.has_code(codes::OPERATION_FAILED));

        cluster.initiate_replica_set(&spec).await.unwrap();
        cluster
            .add_shard(&shard, &spec.connection_string())
            .await
            .unwrap();
        // Re-adding the same membership is a no-op.
        cluster
            .add_shard(&shard, &spec.connection_string())
            .await
            .unwrap();
        assert_eq!(cluster.registered_shards().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unique_index_conflicts_with_duplicates() {
        let cluster = InMemoryControlPlane::new("mongos:27017");
        cluster
            .seed_documents(
                "blog_db.users",
                vec![json!({"email": "a@x.io"}), json!({"email": "a@x.io"})],
            )
            .await;
        let index = IndexSpec::new("blog_db", "users", "uidx_users_email", KeyPattern::new().asc("email"))
            .unique();
        let err = cluster.create_index(&index).await.unwrap_err();
        assert!(err.has_code(codes::DUPLICATE_KEY));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_faults_and_unreachable_hosts() {
        let cluster = InMemoryControlPlane::new("mongos:27017");
        cluster
            .fail_once(
                Operation::ListShards,
                None,
                ControlPlaneError::Timeout {
                    target: "mongos:27017".to_string(),
                    after_ms: 10,
                },
            )
            .await;
        assert!(cluster.list_shards().await.is_err());
        assert!(cluster.list_shards().await.is_ok());

        cluster.set_unreachable("mongos:27017", true).await;
        let err = cluster.enable_sharding("blog_db").await.unwrap_err();
        assert!(err.is_communication());

        let calls = cluster.calls().await;
        assert_eq!(calls.len(), 3);
        assert_eq!(cluster.mutations().await.len(), 1);
    }

    #[tokio::test]
    async fn test_list_indexes_on_missing_namespace() {
        let cluster = InMemoryControlPlane::new("mongos:27017");
        let err = cluster.list_indexes("blog_db", "blogs").await.unwrap_err();
        assert!(err.has_code(codes::NAMESPACE_NOT_FOUND));

        let index = IndexSpec::new("blog_db", "blogs", "idx_blogs_tags", KeyPattern::new().asc("tags"));
        cluster.create_index(&index).await.unwrap();
        let names = cluster
            .list_indexes("blog_db", "blogs")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["_id_", "idx_blogs_tags"]);
    }
}
