//! Static description of the desired cluster shape.
//!
//! A [`Topology`] is loaded once per run and never mutated afterwards. Loading
//! always validates it, so an inconsistent descriptor is rejected before any
//! control-plane call is made.

use crate::core::{BootError, Result};
use crate::plan::BootstrapPlan;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

// Descriptor internals are split by concern, sharing one module scope.
include!("topology/keys.rs");
include!("topology/specs.rs");
include!("topology/validation.rs");
include!("topology/blog_cluster.rs");

/// The complete desired topology of a sharded cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Address of the cluster router that accepts shard and sharding commands.
    pub router: String,
    pub replica_sets: Vec<ReplicaSetSpec>,
    #[serde(default)]
    pub shards: Vec<ShardRegistration>,
    #[serde(default)]
    pub databases: Vec<ShardedDatabaseSpec>,
    #[serde(default)]
    pub indexes: Vec<IndexSpec>,
}

impl Topology {
    /// Parses and validates a descriptor from its JSON form.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let topology: Self = serde_json::from_str(raw)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Reads, parses and validates a descriptor file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            BootError::IoError(format!("read topology '{}': {}", path.display(), err))
        })?;
        Self::from_json_str(&raw)
    }

    /// Serializes the descriptor in the same JSON form accepted by [`Topology::load`].
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Looks up a replica set by name.
    pub fn replica_set(&self, name: &str) -> Option<&ReplicaSetSpec> {
        self.replica_sets.iter().find(|rs| rs.name == name)
    }

    /// The replica set that stores cluster metadata.
    pub fn config_replica_set(&self) -> Option<&ReplicaSetSpec> {
        self.replica_sets.iter().find(|rs| rs.config_server)
    }

    /// Data-bearing replica sets, in declaration order.
    pub fn data_replica_sets(&self) -> impl Iterator<Item = &ReplicaSetSpec> {
        self.replica_sets.iter().filter(|rs| !rs.config_server)
    }

    /// Flattened view over every sharded collection of every database.
    pub fn sharded_collections(&self) -> Vec<ShardedCollectionSpec> {
        self.databases
            .iter()
            .flat_map(|db| db.sharded_collections())
            .collect()
    }

    /// Resolves the connection string a shard is registered with.
    pub fn shard_connection_string(&self, shard: &ShardRegistration) -> Result<String> {
        self.replica_set(&shard.replica_set)
            .map(ReplicaSetSpec::connection_string)
            .ok_or_else(|| {
                BootError::config(format!(
                    "shard '{}' references unknown replica set '{}'",
                    shard.name, shard.replica_set
                ))
            })
    }

    /// Compiles the descriptor into its ordered dependency graph of steps.
    pub fn plan(&self) -> Result<BootstrapPlan> {
        BootstrapPlan::from_topology(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "router": "mongos:27017",
            "replica_sets": [
                {"name": "cfg", "config_server": true, "members": [{"id": 0, "host": "cfg1:27019"}]},
                {"name": "rs-a", "members": [{"id": 0, "host": "a1:27018"}, {"id": 1, "host": "a2:27018"}]}
            ],
            "shards": [{"name": "shard-a", "replica_set": "rs-a"}],
            "databases": [
                {"name": "app", "collections": [{"name": "events", "shard_key": {"tenant": 1, "at": -1}}]}
            ],
            "indexes": [
                {"database": "app", "collection": "events", "keys": {"at": -1}, "name": "idx_at"}
            ]
        }"#
    }

    #[test]
    fn test_parse_minimal_topology() {
        let topology = Topology::from_json_str(minimal_json()).unwrap();
        assert_eq!(topology.replica_sets.len(), 2);
        assert_eq!(topology.config_replica_set().unwrap().name, "cfg");
        assert_eq!(topology.data_replica_sets().count(), 1);

        let collections = topology.sharded_collections();
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].namespace(), "app.events");
        assert_eq!(collections[0].shard_key.to_string(), "{ tenant: 1, at: -1 }");

        let index = &topology.indexes[0];
        assert_eq!(index.options.name, "idx_at");
        assert!(!index.options.unique);
        assert!(!index.options.sparse);
    }

    #[test]
    fn test_shard_connection_string_uses_member_order() {
        let topology = Topology::from_json_str(minimal_json()).unwrap();
        let conn = topology
            .shard_connection_string(&topology.shards[0])
            .unwrap();
        assert_eq!(conn, "rs-a/a1:27018,a2:27018");
    }

    #[test]
    fn test_json_round_trip_keeps_key_order() {
        let topology = Topology::blog_cluster();
        let raw = topology.to_json_pretty().unwrap();
        let reparsed = Topology::from_json_str(&raw).unwrap();
        assert_eq!(reparsed, topology);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let err = Topology::load("/definitely/not/here/topology.json").unwrap_err();
        assert!(matches!(err, BootError::IoError(_)));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = Topology::from_json_str("{\"router\": 1").unwrap_err();
        assert!(matches!(err, BootError::ParseError(_)));
    }
}
