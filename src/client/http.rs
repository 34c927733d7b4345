use super::commands::{self, CommandRequest};
use super::{
    ControlPlane, ControlPlaneError, ControlResult, ExistingIndex, RegisteredShard,
    ReplicaSetStatus, codes,
};
use crate::core::{BootError, Result};
use crate::topology::{IndexSpec, KeyPattern, ReplicaSetSpec, ShardRegistration, ShardedCollectionSpec};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::debug;

/// Control plane reached through an HTTP command gateway.
///
/// Every operation becomes one `POST {gateway}/v1/command` carrying the
/// target host, database and command document. Replica-set commands go to
/// the set's seed member, everything else to the router.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    http: reqwest::Client,
    endpoint: String,
    router: String,
    timeout: Duration,
}

impl HttpControlPlane {
    /// Creates a client with a per-request timeout.
    pub fn new(gateway_url: &str, router: impl Into<String>, timeout: Duration) -> Result<Self> {
        let gateway_url = gateway_url.trim_end_matches('/');
        if !(gateway_url.starts_with("http://") || gateway_url.starts_with("https://")) {
            return Err(BootError::config(format!(
                "gateway url '{}' must start with http:// or https://",
                gateway_url
            )));
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|err| BootError::ExecutionError(format!("build http client: {}", err)))?;
        Ok(Self {
            http,
            endpoint: format!("{}/v1/command", gateway_url),
            router: router.into(),
            timeout,
        })
    }

    pub fn router(&self) -> &str {
        &self.router
    }

    async fn run(&self, request: CommandRequest) -> ControlResult<JsonValue> {
        debug!(host = %request.host, db = %request.db, command = request.name(), "sending command");
        let target = request.host.clone();
        let response = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|err| self.transport_error(&target, err))?;

        let status = response.status();
        match status {
            StatusCode::GATEWAY_TIMEOUT => {
                return Err(ControlPlaneError::Timeout {
                    target,
                    after_ms: self.timeout.as_millis() as u64,
                });
            }
            StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
                let detail = response.text().await.unwrap_or_default();
                return Err(ControlPlaneError::Unreachable {
                    target,
                    detail: format!("gateway answered {}: {}", status, detail.trim()),
                });
            }
            _ if !status.is_success() => {
                return Err(ControlPlaneError::Protocol(format!(
                    "gateway answered {} for '{}'",
                    status, target
                )));
            }
            _ => {}
        }

        let reply = response
            .json::<JsonValue>()
            .await
            .map_err(|err| ControlPlaneError::Protocol(format!("decode reply: {}", err)))?;
        commands::check_reply(reply)
    }

    fn transport_error(&self, target: &str, err: reqwest::Error) -> ControlPlaneError {
        if err.is_timeout() {
            ControlPlaneError::Timeout {
                target: target.to_string(),
                after_ms: self.timeout.as_millis() as u64,
            }
        } else if err.is_connect() {
            ControlPlaneError::Unreachable {
                target: target.to_string(),
                detail: err.to_string(),
            }
        } else {
            ControlPlaneError::Protocol(err.to_string())
        }
    }

    fn seed(replica_set: &ReplicaSetSpec) -> ControlResult<&str> {
        replica_set.seed_host().ok_or_else(|| {
            ControlPlaneError::Protocol(format!("replica set '{}' has no members", replica_set.name))
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn replica_set_status(&self, replica_set: &ReplicaSetSpec) -> ControlResult<ReplicaSetStatus> {
        let reply = self
            .run(commands::replica_set_status(Self::seed(replica_set)?))
            .await?;
        commands::parse_replica_set_status(&reply)
    }

    async fn initiate_replica_set(&self, replica_set: &ReplicaSetSpec) -> ControlResult<()> {
        let seed = Self::seed(replica_set)?;
        self.run(commands::initiate_replica_set(seed, replica_set))
            .await
            .map(|_| ())
    }

    async fn list_shards(&self) -> ControlResult<Vec<RegisteredShard>> {
        let reply = self.run(commands::list_shards(&self.router)).await?;
        commands::parse_shards(&reply)
    }

    async fn add_shard(&self, shard: &ShardRegistration, connection_string: &str) -> ControlResult<()> {
        self.run(commands::add_shard(&self.router, &shard.name, connection_string))
            .await
            .map(|_| ())
    }

    async fn enable_sharding(&self, database: &str) -> ControlResult<()> {
        self.run(commands::enable_sharding(&self.router, database))
            .await
            .map(|_| ())
    }

    async fn database_sharding(&self, database: &str) -> ControlResult<bool> {
        let reply = self
            .run(commands::find_database_entry(&self.router, database))
            .await?;
        commands::parse_database_sharding(&reply)
    }

    async fn shard_collection(&self, collection: &ShardedCollectionSpec) -> ControlResult<()> {
        self.run(commands::shard_collection(&self.router, collection))
            .await
            .map(|_| ())
    }

    async fn collection_shard_key(
        &self,
        database: &str,
        collection: &str,
    ) -> ControlResult<Option<KeyPattern>> {
        let namespace = format!("{}.{}", database, collection);
        let reply = self
            .run(commands::find_collection_entry(&self.router, &namespace))
            .await?;
        commands::parse_collection_shard_key(&reply)
    }

    async fn create_index(&self, index: &IndexSpec) -> ControlResult<()> {
        self.run(commands::create_index(&self.router, index))
            .await
            .map(|_| ())
    }

    async fn list_indexes(&self, database: &str, collection: &str) -> ControlResult<Vec<ExistingIndex>> {
        match self
            .run(commands::list_indexes(&self.router, database, collection))
            .await
        {
            Ok(reply) => commands::parse_indexes(&reply),
            Err(err) if err.has_code(codes::NAMESPACE_NOT_FOUND) => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_non_http_gateway() {
        let err = HttpControlPlane::new("tcp://gateway:8080", "mongos:27017", Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_endpoint_is_normalised() {
        let client =
            HttpControlPlane::new("http://gateway:8080/", "mongos:27017", Duration::from_secs(1))
                .unwrap();
        assert_eq!(client.endpoint, "http://gateway:8080/v1/command");
        assert_eq!(client.router(), "mongos:27017");
    }
}
