use shardstrap::{
    BootError, IndexSpec, KeyPattern, MemberSpec, ReplicaSetSpec, ShardRegistration,
    ShardedDatabaseSpec, Topology,
};
use std::io::Write;

fn assert_config_error(topology: &Topology, needle: &str) {
    match topology.validate() {
        Err(BootError::ConfigurationError(msg)) => {
            assert!(msg.contains(needle), "'{}' does not mention '{}'", msg, needle)
        }
        other => panic!("expected configuration error, got {:?}", other),
    }
}

#[test]
fn test_blog_cluster_is_valid() {
    let topology = Topology::blog_cluster();
    topology.validate().unwrap();
    assert_eq!(topology.router, "mongos:27017");
    assert!(topology.config_replica_set().unwrap().config_server);
    assert_eq!(topology.shards.len(), 2);
    assert_eq!(topology.indexes.len(), 8);

    let collections = topology.sharded_collections();
    let names = collections.iter().map(|c| c.namespace()).collect::<Vec<_>>();
    assert_eq!(names, vec!["blog_db.blogs", "blog_db.comments"]);
    assert!(!names.contains(&"blog_db.users".to_string()));
}

#[test]
fn test_unknown_replica_set_reference() {
    let mut topology = Topology::blog_cluster();
    topology.shards.push(ShardRegistration::new("shard3", "shard3"));
    assert_config_error(&topology, "unknown replica set 'shard3'");
}

#[test]
fn test_exactly_one_config_server_set() {
    let mut topology = Topology::blog_cluster();
    topology.replica_sets[1].config_server = true;
    assert_config_error(&topology, "exactly one config-server");

    let mut topology = Topology::blog_cluster();
    topology.replica_sets.retain(|rs| !rs.config_server);
    assert_config_error(&topology, "found 0");
}

#[test]
fn test_host_in_two_replica_sets() {
    let mut topology = Topology::blog_cluster();
    topology.replica_sets.push(ReplicaSetSpec::new(
        "shard3",
        ["mongo-shard1-1:27017", "mongo-shard3-2:27017"],
    ));
    assert_config_error(&topology, "member of both");
}

#[test]
fn test_member_ids_must_be_contiguous() {
    let mut topology = Topology::blog_cluster();
    topology.replica_sets[2].members[1] = MemberSpec {
        id: 7,
        host: "mongo-shard2-2:27017".to_string(),
    };
    assert_config_error(&topology, "contiguous");
}

#[test]
fn test_invalid_hosts() {
    let mut topology = Topology::blog_cluster();
    topology.replica_sets[0].members[0].host = "mongo-cfg1".to_string();
    assert_config_error(&topology, "host:port");

    let mut topology = Topology::blog_cluster();
    topology.replica_sets[0].members[0].host = "mongo-cfg1:99999".to_string();
    assert_config_error(&topology, "out of range");

    let mut topology = Topology::blog_cluster();
    topology.router = "mongo-cfg1:27017".to_string();
    assert_config_error(&topology, "router address");
}

#[test]
fn test_config_set_cannot_back_a_shard() {
    let mut topology = Topology::blog_cluster();
    topology.shards[0].replica_set = "cfg".to_string();
    assert_config_error(&topology, "config-server replica set");
}

#[test]
fn test_replica_set_backs_one_shard_only() {
    let mut topology = Topology::blog_cluster();
    topology.shards[1].replica_set = "shard1".to_string();
    assert_config_error(&topology, "backs both");
}

#[test]
fn test_databases_without_shards() {
    let mut topology = Topology::blog_cluster();
    topology.shards.clear();
    assert_config_error(&topology, "no shard is registered");
}

#[test]
fn test_invalid_shard_keys() {
    let mut topology = Topology::blog_cluster();
    topology.databases[0] = ShardedDatabaseSpec::new("blog_db").collection("blogs", KeyPattern::new());
    assert_config_error(&topology, "must not be empty");

    let mut topology = Topology::blog_cluster();
    topology.databases[0] = ShardedDatabaseSpec::new("blog_db")
        .collection("blogs", KeyPattern::new().asc("author_id"))
        .collection("blogs", KeyPattern::new().asc("created_at"));
    assert_config_error(&topology, "sharded more than once");

    let mut topology = Topology::blog_cluster();
    topology.databases[0] = ShardedDatabaseSpec::new("blog.db");
    assert_config_error(&topology, "forbidden character");
}

#[test]
fn test_duplicate_index_declarations() {
    let mut topology = Topology::blog_cluster();
    topology.indexes.push(IndexSpec::new(
        "blog_db",
        "blogs",
        "idx_blogs_tags",
        KeyPattern::new().desc("tags"),
    ));
    assert_config_error(&topology, "declared twice");

    let mut topology = Topology::blog_cluster();
    topology.indexes.push(
        IndexSpec::new("blog_db", "users", "email_again", KeyPattern::new().asc("email")).unique(),
    );
    assert_config_error(&topology, "key pattern");
}

#[test]
fn test_load_descriptor_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    let json = Topology::blog_cluster().to_json_pretty().unwrap();
    file.write_all(json.as_bytes()).unwrap();

    let loaded = Topology::load(file.path()).unwrap();
    assert_eq!(loaded, Topology::blog_cluster());
    assert_eq!(loaded.plan().unwrap().len(), 16);
}

#[test]
fn test_rejects_bad_index_direction() {
    let raw = r#"{
        "router": "router:27017",
        "replica_sets": [
            {"name": "cfg", "config_server": true, "members": [{"id": 0, "host": "cfg-1:27019"}]}
        ],
        "indexes": [
            {"database": "app", "collection": "events", "keys": {"at": 2}, "name": "idx_at"}
        ]
    }"#;
    let err = Topology::from_json_str(raw).unwrap_err();
    assert!(matches!(err, BootError::ParseError(_)));
}
