//! Narrow request/response contract with the cluster's control plane.
//!
//! The orchestrator only ever talks to the cluster through [`ControlPlane`].
//! [`HttpControlPlane`] relays commands through an HTTP command gateway;
//! [`InMemoryControlPlane`] simulates a cluster for tests and rehearsals.

pub mod commands;
pub mod http;
pub mod in_memory;

use crate::topology::{IndexSpec, KeyPattern, ReplicaSetSpec, ShardRegistration, ShardedCollectionSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use http::HttpControlPlane;
pub use in_memory::{ControlPlaneCall, InMemoryControlPlane, Operation};

/// Engine error codes the bootstrap logic needs to recognise.
pub mod codes {
    pub const HOST_UNREACHABLE: i32 = 6;
    pub const HOST_NOT_FOUND: i32 = 7;
    pub const ILLEGAL_OPERATION: i32 = 20;
    pub const ALREADY_INITIALIZED: i32 = 23;
    pub const NAMESPACE_NOT_FOUND: i32 = 26;
    pub const SHARD_NOT_FOUND: i32 = 70;
    pub const NODE_NOT_FOUND: i32 = 74;
    pub const INDEX_OPTIONS_CONFLICT: i32 = 85;
    pub const INDEX_KEY_SPECS_CONFLICT: i32 = 86;
    pub const NETWORK_TIMEOUT: i32 = 89;
    pub const SHUTDOWN_IN_PROGRESS: i32 = 91;
    pub const INVALID_REPLICA_SET_CONFIG: i32 = 93;
    pub const NOT_YET_INITIALIZED: i32 = 94;
    pub const OPERATION_FAILED: i32 = 96;
    pub const FAILED_TO_SATISFY_READ_PREFERENCE: i32 = 133;
    pub const PRIMARY_STEPPED_DOWN: i32 = 189;
    pub const EXCEEDED_TIME_LIMIT: i32 = 262;
    pub const DUPLICATE_KEY: i32 = 11000;
    pub const INTERRUPTED_DUE_TO_REPL_STATE_CHANGE: i32 = 11602;
    pub const NOT_WRITABLE_PRIMARY: i32 = 10107;
    pub const NOT_PRIMARY_NO_SECONDARY_OK: i32 = 13435;

    /// Codes that describe a cluster which is not ready yet rather than a
    /// request that can never succeed.
    pub const TRANSIENT: &[i32] = &[
        HOST_UNREACHABLE,
        HOST_NOT_FOUND,
        NODE_NOT_FOUND,
        NETWORK_TIMEOUT,
        SHUTDOWN_IN_PROGRESS,
        NOT_YET_INITIALIZED,
        FAILED_TO_SATISFY_READ_PREFERENCE,
        PRIMARY_STEPPED_DOWN,
        EXCEEDED_TIME_LIMIT,
        INTERRUPTED_DUE_TO_REPL_STATE_CHANGE,
        NOT_WRITABLE_PRIMARY,
        NOT_PRIMARY_NO_SECONDARY_OK,
    ];
}

/// Failure reported by a control-plane call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlPlaneError {
    #[error("'{target}' is unreachable: {detail}")]
    Unreachable { target: String, detail: String },

    #[error("request to '{target}' timed out after {after_ms}ms")]
    Timeout { target: String, after_ms: u64 },

    /// The engine answered and rejected the command.
    #[error("{code_name} (code {code}): {message}")]
    Command {
        code: i32,
        code_name: String,
        message: String,
    },

    /// The gateway answered with something that is not a command reply.
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type ControlResult<T> = std::result::Result<T, ControlPlaneError>;

impl ControlPlaneError {
    pub fn command(code: i32, code_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Command {
            code,
            code_name: code_name.into(),
            message: message.into(),
        }
    }

    /// Engine error code, if the engine produced this error.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Command { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn has_code(&self, code: i32) -> bool {
        self.code() == Some(code)
    }

    /// True when the request never reached the engine or got no answer in
    /// time. An answer that could not be decoded is not a connectivity failure.
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::Timeout { .. })
    }

    /// True when running the same command later may succeed unchanged.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Command { code, .. } => codes::TRANSIENT.contains(code),
            _ => true,
        }
    }
}

/// Replica-set member state as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberState {
    Primary,
    Secondary,
    Startup,
    Startup2,
    Recovering,
    Arbiter,
    Down,
    Other(String),
}

impl MemberState {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "PRIMARY" => Self::Primary,
            "SECONDARY" => Self::Secondary,
            "STARTUP" => Self::Startup,
            "STARTUP2" => Self::Startup2,
            "RECOVERING" => Self::Recovering,
            "ARBITER" => Self::Arbiter,
            "DOWN" => Self::Down,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Secondary => "SECONDARY",
            Self::Startup => "STARTUP",
            Self::Startup2 => "STARTUP2",
            Self::Recovering => "RECOVERING",
            Self::Arbiter => "ARBITER",
            Self::Down => "DOWN",
            Self::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberStatus {
    pub id: u32,
    pub host: String,
    pub state: MemberState,
}

/// Answer to a replica-set status query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetStatus {
    pub set_name: String,
    pub members: Vec<MemberStatus>,
}

impl ReplicaSetStatus {
    pub fn primary(&self) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.state == MemberState::Primary)
    }

    /// Initialized and able to accept writes.
    pub fn is_healthy(&self) -> bool {
        self.primary().is_some()
    }
}

/// A shard as listed by the router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredShard {
    pub name: String,
    /// Connection string, `rs/host1,host2`.
    pub host: String,
}

impl RegisteredShard {
    /// Member hosts parsed from the connection string, sorted.
    pub fn hosts(&self) -> Vec<&str> {
        let list = self
            .host
            .split_once('/')
            .map(|(_, hosts)| hosts)
            .unwrap_or(self.host.as_str());
        let mut hosts = list
            .split(',')
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .collect::<Vec<_>>();
        hosts.sort_unstable();
        hosts
    }
}

/// An index that already exists on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingIndex {
    pub name: String,
    pub keys: KeyPattern,
    pub unique: bool,
    pub sparse: bool,
}

impl ExistingIndex {
    pub fn from_spec(spec: &IndexSpec) -> Self {
        Self {
            name: spec.options.name.clone(),
            keys: spec.keys.clone(),
            unique: spec.options.unique,
            sparse: spec.options.sparse,
        }
    }

    /// Same name, key pattern and options.
    pub fn matches(&self, spec: &IndexSpec) -> bool {
        self.name == spec.options.name
            && self.keys == spec.keys
            && self.unique == spec.options.unique
            && self.sparse == spec.options.sparse
    }
}

/// Operations the bootstrap core needs from the cluster.
///
/// Status, listing and metadata lookups are read-only; the remaining calls
/// mutate cluster state and are only issued by the step executor.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Queries a replica set's status through its seed member.
    async fn replica_set_status(&self, replica_set: &ReplicaSetSpec) -> ControlResult<ReplicaSetStatus>;

    /// Initiates a replica set with its member list.
    async fn initiate_replica_set(&self, replica_set: &ReplicaSetSpec) -> ControlResult<()>;

    /// Lists shards registered with the router.
    async fn list_shards(&self) -> ControlResult<Vec<RegisteredShard>>;

    /// Registers a shard with the router.
    async fn add_shard(&self, shard: &ShardRegistration, connection_string: &str) -> ControlResult<()>;

    /// Enables sharding on a database.
    async fn enable_sharding(&self, database: &str) -> ControlResult<()>;

    /// Reports whether sharding is enabled on a database.
    async fn database_sharding(&self, database: &str) -> ControlResult<bool>;

    /// Assigns a shard key to a collection.
    async fn shard_collection(&self, collection: &ShardedCollectionSpec) -> ControlResult<()>;

    /// Current shard key of a collection, `None` if it is not sharded.
    async fn collection_shard_key(
        &self,
        database: &str,
        collection: &str,
    ) -> ControlResult<Option<KeyPattern>>;

    /// Creates one index.
    async fn create_index(&self, index: &IndexSpec) -> ControlResult<()>;

    /// Lists the indexes of a collection.
    async fn list_indexes(&self, database: &str, collection: &str) -> ControlResult<Vec<ExistingIndex>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = ControlPlaneError::Timeout {
            target: "mongos:27017".to_string(),
            after_ms: 500,
        };
        assert!(timeout.is_communication());
        assert!(timeout.is_transient());

        let dup = ControlPlaneError::command(codes::DUPLICATE_KEY, "DuplicateKey", "E11000");
        assert!(!dup.is_communication());
        assert!(!dup.is_transient());
        assert!(dup.has_code(codes::DUPLICATE_KEY));

        let not_init =
            ControlPlaneError::command(codes::NOT_YET_INITIALIZED, "NotYetInitialized", "no config");
        assert!(!not_init.is_communication());
        assert!(not_init.is_transient());

        let garbled = ControlPlaneError::Protocol("decode reply: EOF".to_string());
        assert!(!garbled.is_communication());
    }

    #[test]
    fn test_registered_shard_hosts_are_sorted() {
        let shard = RegisteredShard {
            name: "shard1".to_string(),
            host: "shard1/b:27017,a:27017".to_string(),
        };
        assert_eq!(shard.hosts(), vec!["a:27017", "b:27017"]);
    }

    #[test]
    fn test_replica_set_health_needs_primary() {
        let mut status = ReplicaSetStatus {
            set_name: "cfg".to_string(),
            members: vec![MemberStatus {
                id: 0,
                host: "cfg1:27019".to_string(),
                state: MemberState::parse("STARTUP2"),
            }],
        };
        assert!(!status.is_healthy());
        status.members[0].state = MemberState::parse("PRIMARY");
        assert!(status.is_healthy());
        assert_eq!(status.primary().unwrap().state.as_str(), "PRIMARY");
    }
}
