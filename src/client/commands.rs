//! Command documents sent through the gateway and parsers for their replies.

use super::{
    ControlPlaneError, ControlResult, ExistingIndex, MemberState, MemberStatus, RegisteredShard,
    ReplicaSetStatus, codes,
};
use crate::topology::{IndexSpec, KeyPattern, ReplicaSetSpec, ShardedCollectionSpec};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};

/// One admin command addressed to a specific host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRequest {
    pub host: String,
    pub db: String,
    pub command: JsonValue,
}

impl CommandRequest {
    fn admin(host: &str, command: JsonValue) -> Self {
        Self {
            host: host.to_string(),
            db: "admin".to_string(),
            command,
        }
    }

    fn on(host: &str, db: &str, command: JsonValue) -> Self {
        Self {
            host: host.to_string(),
            db: db.to_string(),
            command,
        }
    }

    /// First key of the command document, which names the command.
    pub fn name(&self) -> &str {
        self.command
            .as_object()
            .and_then(|doc| doc.keys().next())
            .map(String::as_str)
            .unwrap_or("")
    }
}

pub fn replica_set_status(seed: &str) -> CommandRequest {
    CommandRequest::admin(seed, json!({ "replSetGetStatus": 1 }))
}

pub fn initiate_replica_set(seed: &str, rs: &ReplicaSetSpec) -> CommandRequest {
    let members = rs
        .members
        .iter()
        .map(|m| json!({ "_id": m.id, "host": m.host }))
        .collect::<Vec<_>>();
    let mut config = json!({ "_id": rs.name, "members": members });
    if rs.config_server {
        config["configsvr"] = JsonValue::Bool(true);
    }
    CommandRequest::admin(seed, json!({ "replSetInitiate": config }))
}

pub fn list_shards(router: &str) -> CommandRequest {
    CommandRequest::admin(router, json!({ "listShards": 1 }))
}

pub fn add_shard(router: &str, name: &str, connection_string: &str) -> CommandRequest {
    CommandRequest::admin(router, json!({ "addShard": connection_string, "name": name }))
}

pub fn enable_sharding(router: &str, database: &str) -> CommandRequest {
    CommandRequest::admin(router, json!({ "enableSharding": database }))
}

pub fn find_database_entry(router: &str, database: &str) -> CommandRequest {
    CommandRequest::on(
        router,
        "config",
        json!({ "find": "databases", "filter": { "_id": database }, "limit": 1 }),
    )
}

pub fn shard_collection(router: &str, collection: &ShardedCollectionSpec) -> CommandRequest {
    CommandRequest::admin(
        router,
        json!({
            "shardCollection": collection.namespace(),
            "key": collection.shard_key.to_document(),
        }),
    )
}

pub fn find_collection_entry(router: &str, namespace: &str) -> CommandRequest {
    CommandRequest::on(
        router,
        "config",
        json!({ "find": "collections", "filter": { "_id": namespace }, "limit": 1 }),
    )
}

pub fn create_index(router: &str, index: &IndexSpec) -> CommandRequest {
    let mut definition = json!({
        "key": index.keys.to_document(),
        "name": index.options.name,
    });
    if index.options.unique {
        definition["unique"] = JsonValue::Bool(true);
    }
    if index.options.sparse {
        definition["sparse"] = JsonValue::Bool(true);
    }
    CommandRequest::on(
        router,
        &index.database,
        json!({ "createIndexes": index.collection, "indexes": [definition] }),
    )
}

pub fn list_indexes(router: &str, database: &str, collection: &str) -> CommandRequest {
    CommandRequest::on(router, database, json!({ "listIndexes": collection }))
}

fn is_ok(reply: &JsonValue) -> bool {
    match reply.get("ok") {
        Some(JsonValue::Bool(ok)) => *ok,
        Some(JsonValue::Number(n)) => n.as_f64() == Some(1.0),
        _ => false,
    }
}

/// Turns an `ok: 0` reply into a [`ControlPlaneError::Command`].
pub fn check_reply(reply: JsonValue) -> ControlResult<JsonValue> {
    if !reply.is_object() {
        return Err(ControlPlaneError::Protocol(format!(
            "command reply must be a document, got {}",
            reply
        )));
    }
    if is_ok(&reply) {
        return Ok(reply);
    }
    let code = reply
        .get("code")
        .and_then(JsonValue::as_i64)
        .unwrap_or(codes::OPERATION_FAILED as i64) as i32;
    let code_name = reply
        .get("codeName")
        .and_then(JsonValue::as_str)
        .unwrap_or("UnknownError");
    let message = reply
        .get("errmsg")
        .and_then(JsonValue::as_str)
        .unwrap_or("command failed without errmsg");
    Err(ControlPlaneError::command(code, code_name, message))
}

fn protocol(what: &str, reply: &JsonValue) -> ControlPlaneError {
    ControlPlaneError::Protocol(format!("{}: unexpected reply {}", what, reply))
}

pub fn parse_replica_set_status(reply: &JsonValue) -> ControlResult<ReplicaSetStatus> {
    let set_name = reply
        .get("set")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| protocol("replSetGetStatus", reply))?;
    let members = reply
        .get("members")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| protocol("replSetGetStatus", reply))?
        .iter()
        .map(|m| {
            Ok(MemberStatus {
                id: m
                    .get("_id")
                    .and_then(JsonValue::as_u64)
                    .ok_or_else(|| protocol("replSetGetStatus member", m))? as u32,
                host: m
                    .get("name")
                    .and_then(JsonValue::as_str)
                    .ok_or_else(|| protocol("replSetGetStatus member", m))?
                    .to_string(),
                state: MemberState::parse(
                    m.get("stateStr").and_then(JsonValue::as_str).unwrap_or("UNKNOWN"),
                ),
            })
        })
        .collect::<ControlResult<Vec<_>>>()?;
    Ok(ReplicaSetStatus {
        set_name: set_name.to_string(),
        members,
    })
}

pub fn parse_shards(reply: &JsonValue) -> ControlResult<Vec<RegisteredShard>> {
    reply
        .get("shards")
        .and_then(JsonValue::as_array)
        .ok_or_else(|| protocol("listShards", reply))?
        .iter()
        .map(|s| {
            let name = s.get("_id").and_then(JsonValue::as_str);
            let host = s.get("host").and_then(JsonValue::as_str);
            match (name, host) {
                (Some(name), Some(host)) => Ok(RegisteredShard {
                    name: name.to_string(),
                    host: host.to_string(),
                }),
                _ => Err(protocol("listShards entry", s)),
            }
        })
        .collect()
}

/// Documents of the first cursor batch of a `find` or `list*` reply.
pub fn first_batch(reply: &JsonValue) -> ControlResult<&Vec<JsonValue>> {
    reply
        .get("cursor")
        .and_then(|c| c.get("firstBatch"))
        .and_then(JsonValue::as_array)
        .ok_or_else(|| protocol("cursor", reply))
}

/// A database entry counts as sharded unless it is explicitly marked
/// `partitioned: false`; recent engines no longer record the flag.
pub fn parse_database_sharding(reply: &JsonValue) -> ControlResult<bool> {
    Ok(first_batch(reply)?.first().is_some_and(|entry| {
        entry
            .get("partitioned")
            .and_then(JsonValue::as_bool)
            .unwrap_or(true)
    }))
}

pub fn parse_collection_shard_key(reply: &JsonValue) -> ControlResult<Option<KeyPattern>> {
    let Some(entry) = first_batch(reply)?.first() else {
        return Ok(None);
    };
    if entry.get("dropped").and_then(JsonValue::as_bool) == Some(true) {
        return Ok(None);
    }
    let key = entry
        .get("key")
        .ok_or_else(|| protocol("config.collections entry", entry))?;
    KeyPattern::from_document(key)
        .map(Some)
        .map_err(ControlPlaneError::Protocol)
}

pub fn parse_indexes(reply: &JsonValue) -> ControlResult<Vec<ExistingIndex>> {
    first_batch(reply)?
        .iter()
        .map(|doc| {
            let name = doc
                .get("name")
                .and_then(JsonValue::as_str)
                .ok_or_else(|| protocol("listIndexes entry", doc))?;
            let key = doc
                .get("key")
                .ok_or_else(|| protocol("listIndexes entry", doc))?;
            Ok(ExistingIndex {
                name: name.to_string(),
                keys: KeyPattern::from_document(key).map_err(ControlPlaneError::Protocol)?,
                unique: doc.get("unique").and_then(JsonValue::as_bool).unwrap_or(false),
                sparse: doc.get("sparse").and_then(JsonValue::as_bool).unwrap_or(false),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    #[test]
    fn test_initiate_marks_config_server() {
        let topology = Topology::blog_cluster();
        let cfg = topology.config_replica_set().unwrap();
        let request = initiate_replica_set(cfg.seed_host().unwrap(), cfg);
        assert_eq!(request.host, "mongo-cfg1:27017");
        assert_eq!(request.db, "admin");
        assert_eq!(request.name(), "replSetInitiate");
        assert_eq!(request.command["replSetInitiate"]["configsvr"], json!(true));
        assert_eq!(
            request.command["replSetInitiate"]["members"][2],
            json!({"_id": 2, "host": "mongo-cfg3:27017"})
        );

        let shard = topology.replica_set("shard1").unwrap();
        let request = initiate_replica_set(shard.seed_host().unwrap(), shard);
        assert!(request.command["replSetInitiate"].get("configsvr").is_none());
    }

    #[test]
    fn test_create_index_document_keeps_key_order() {
        let topology = Topology::blog_cluster();
        let request = create_index("mongos:27017", &topology.indexes[0]);
        assert_eq!(request.db, "blog_db");
        let raw = serde_json::to_string(&request.command).unwrap();
        assert_eq!(
            raw,
            r#"{"createIndexes":"blogs","indexes":[{"key":{"author_id":1,"created_at":-1},"name":"idx_blogs_author_createdAt"}]}"#
        );

        let unique = create_index("mongos:27017", &topology.indexes[6]);
        assert_eq!(unique.command["indexes"][0]["unique"], json!(true));
    }

    #[test]
    fn test_check_reply_maps_engine_errors() {
        assert!(check_reply(json!({"ok": 1.0})).is_ok());
        assert!(check_reply(json!({"ok": true})).is_ok());

        let err = check_reply(json!({
            "ok": 0,
            "code": 94,
            "codeName": "NotYetInitialized",
            "errmsg": "no replset config has been received"
        }))
        .unwrap_err();
        assert!(err.has_code(codes::NOT_YET_INITIALIZED));

        let err = check_reply(json!("gateway says hi")).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Protocol(_)));
    }

    #[test]
    fn test_parse_replica_set_status() {
        let status = parse_replica_set_status(&json!({
            "ok": 1,
            "set": "shard1",
            "members": [
                {"_id": 0, "name": "mongo-shard1-1:27017", "stateStr": "PRIMARY"},
                {"_id": 1, "name": "mongo-shard1-2:27017", "stateStr": "SECONDARY"}
            ]
        }))
        .unwrap();
        assert_eq!(status.set_name, "shard1");
        assert!(status.is_healthy());
        assert_eq!(status.members[1].state, MemberState::Secondary);
    }

    #[test]
    fn test_parse_cursor_replies() {
        let db = json!({"ok": 1, "cursor": {"firstBatch": [{"_id": "blog_db", "primary": "shard1"}]}});
        assert!(parse_database_sharding(&db).unwrap());
        let empty = json!({"ok": 1, "cursor": {"firstBatch": []}});
        assert!(!parse_database_sharding(&empty).unwrap());
        assert_eq!(parse_collection_shard_key(&empty).unwrap(), None);

        let coll = json!({"ok": 1, "cursor": {"firstBatch": [
            {"_id": "blog_db.blogs", "key": {"author_id": 1}}
        ]}});
        assert_eq!(
            parse_collection_shard_key(&coll).unwrap(),
            Some(KeyPattern::new().asc("author_id"))
        );

        let indexes = json!({"ok": 1, "cursor": {"firstBatch": [
            {"v": 2, "key": {"_id": 1}, "name": "_id_"},
            {"v": 2, "key": {"email": 1.0}, "name": "uidx_users_email", "unique": true}
        ]}});
        let parsed = parse_indexes(&indexes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parsed[1].unique);
        assert_eq!(parsed[1].keys, KeyPattern::new().asc("email"));
    }

    #[test]
    fn test_parse_indexes_keeps_special_index_types() {
        let reply = json!({"ok": 1, "cursor": {"firstBatch": [
            {"v": 2, "key": {"_id": 1}, "name": "_id_"},
            {"v": 2, "key": {"_fts": "text", "_ftsx": 1}, "name": "title_text"},
            {"v": 2, "key": {"author_id": "hashed"}, "name": "author_id_hashed"},
            {"v": 2, "key": {"location": "2dsphere"}, "name": "location_2dsphere"}
        ]}});
        let parsed = parse_indexes(&reply).unwrap();
        assert_eq!(parsed.len(), 4);
        assert_eq!(
            parsed[1].keys,
            KeyPattern::new().special("_fts", "text").asc("_ftsx")
        );
        assert_eq!(parsed[2].keys.to_string(), "{ author_id: \"hashed\" }");
        assert!(!parsed[3].keys.fields()[0].direction.is_ordered());

        let bad = json!({"ok": 1, "cursor": {"firstBatch": [
            {"key": {"a": 2}, "name": "a_2"}
        ]}});
        let err = parse_indexes(&bad).unwrap_err();
        assert!(matches!(err, ControlPlaneError::Protocol(_)));
        assert!(!err.is_communication());
    }
}
