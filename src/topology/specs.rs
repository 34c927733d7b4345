/// One member of a replica set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSpec {
    pub id: u32,
    /// `host:port` the member listens on.
    pub host: String,
}

/// A replica set to initiate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    pub name: String,
    /// True for the replica set that stores cluster routing metadata.
    #[serde(default)]
    pub config_server: bool,
    pub members: Vec<MemberSpec>,
}

impl ReplicaSetSpec {
    /// Creates a data-bearing replica set with contiguous member ids.
    pub fn new<I, S>(name: impl Into<String>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members = hosts
            .into_iter()
            .enumerate()
            .map(|(idx, host)| MemberSpec {
                id: idx as u32,
                host: host.into(),
            })
            .collect();
        Self {
            name: name.into(),
            config_server: false,
            members,
        }
    }

    /// Creates the config-server replica set with contiguous member ids.
    pub fn config_server<I, S>(name: impl Into<String>, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut spec = Self::new(name, hosts);
        spec.config_server = true;
        spec
    }

    /// Member that receives the status and initiate commands.
    pub fn seed_host(&self) -> Option<&str> {
        self.members.first().map(|m| m.host.as_str())
    }

    pub fn hosts(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.host.as_str()).collect()
    }

    /// `name/host1,host2,...`, the form the router expects for a shard.
    pub fn connection_string(&self) -> String {
        format!("{}/{}", self.name, self.hosts().join(","))
    }
}

/// A shard backed by one of the descriptor's replica sets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRegistration {
    pub name: String,
    pub replica_set: String,
}

impl ShardRegistration {
    pub fn new(name: impl Into<String>, replica_set: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            replica_set: replica_set.into(),
        }
    }
}

/// Shard key assignment for one collection, as declared inside a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionKeySpec {
    pub name: String,
    pub shard_key: KeyPattern,
}

/// A database with sharding enabled and the collections sharded inside it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedDatabaseSpec {
    pub name: String,
    #[serde(default)]
    pub collections: Vec<CollectionKeySpec>,
}

impl ShardedDatabaseSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            collections: Vec::new(),
        }
    }

    /// Adds a sharded collection to the database.
    pub fn collection(mut self, name: impl Into<String>, shard_key: KeyPattern) -> Self {
        self.collections.push(CollectionKeySpec {
            name: name.into(),
            shard_key,
        });
        self
    }

    pub fn sharded_collections(&self) -> Vec<ShardedCollectionSpec> {
        self.collections
            .iter()
            .map(|c| ShardedCollectionSpec {
                database: self.name.clone(),
                collection: c.name.clone(),
                shard_key: c.shard_key.clone(),
            })
            .collect()
    }
}

/// Read-only view: a collection and the key it is sharded by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardedCollectionSpec {
    pub database: String,
    pub collection: String,
    pub shard_key: KeyPattern,
}

impl ShardedCollectionSpec {
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

/// Options accepted when creating an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    pub name: String,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub sparse: bool,
}

/// A secondary index to provision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub database: String,
    pub collection: String,
    pub keys: KeyPattern,
    #[serde(flatten)]
    pub options: IndexOptions,
}

impl IndexSpec {
    /// Creates a non-unique, non-sparse index.
    pub fn new(
        database: impl Into<String>,
        collection: impl Into<String>,
        name: impl Into<String>,
        keys: KeyPattern,
    ) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
            keys,
            options: IndexOptions {
                name: name.into(),
                unique: false,
                sparse: false,
            },
        }
    }

    pub fn unique(mut self) -> Self {
        self.options.unique = true;
        self
    }

    pub fn sparse(mut self) -> Self {
        self.options.sparse = true;
        self
    }

    pub fn namespace(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}
