lazy_static! {
    static ref HOST_PORT: Regex =
        Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9.\-]*[A-Za-z0-9])?:([0-9]{1,5})$").unwrap();
}

/// Validates a `host:port` address.
fn validate_host(host: &str, owner: &str) -> Result<()> {
    let captures = HOST_PORT.captures(host).ok_or_else(|| {
        BootError::config(format!("{}: '{}' is not a valid host:port address", owner, host))
    })?;
    let port = captures
        .get(2)
        .and_then(|m| m.as_str().parse::<u32>().ok())
        .unwrap_or(0);
    if port == 0 || port > u16::MAX as u32 {
        return Err(BootError::config(format!(
            "{}: port of '{}' is out of range",
            owner, host
        )));
    }
    Ok(())
}

/// Validates an identifier that ends up inside connection strings or namespaces.
fn validate_name(kind: &str, name: &str, forbidden: &[char]) -> Result<()> {
    if name.trim().is_empty() {
        return Err(BootError::config(format!("{} name must not be empty", kind)));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| c.is_whitespace() || forbidden.contains(c))
    {
        return Err(BootError::config(format!(
            "{} name '{}' contains forbidden character {:?}",
            kind, name, bad
        )));
    }
    Ok(())
}

fn validate_key_pattern(owner: &str, pattern: &KeyPattern) -> Result<()> {
    if pattern.is_empty() {
        return Err(BootError::config(format!("{}: key pattern must not be empty", owner)));
    }
    let mut seen = HashSet::new();
    for key in pattern.fields() {
        if key.field.trim().is_empty() || key.field.starts_with('$') {
            return Err(BootError::config(format!(
                "{}: invalid key field '{}'",
                owner, key.field
            )));
        }
        if !seen.insert(key.field.as_str()) {
            return Err(BootError::config(format!(
                "{}: key field '{}' appears more than once",
                owner, key.field
            )));
        }
    }
    Ok(())
}

impl ReplicaSetSpec {
    /// Checks member invariants: at least one member, ids contiguous from 0,
    /// well-formed and distinct hosts.
    pub fn validate(&self) -> Result<()> {
        validate_name("replica set", &self.name, &['/', ','])?;
        let owner = format!("replica set '{}'", self.name);
        if self.members.is_empty() {
            return Err(BootError::config(format!("{} has no members", owner)));
        }

        let mut ids = self.members.iter().map(|m| m.id).collect::<Vec<_>>();
        ids.sort_unstable();
        for (expected, id) in ids.iter().enumerate() {
            if *id != expected as u32 {
                return Err(BootError::config(format!(
                    "{}: member ids must be unique and contiguous from 0, got {:?}",
                    owner,
                    self.members.iter().map(|m| m.id).collect::<Vec<_>>()
                )));
            }
        }

        let mut hosts = HashSet::new();
        for member in &self.members {
            validate_host(&member.host, &owner)?;
            if !hosts.insert(member.host.as_str()) {
                return Err(BootError::config(format!(
                    "{}: host '{}' listed more than once",
                    owner, member.host
                )));
            }
        }
        Ok(())
    }
}

impl Topology {
    /// Checks that the descriptor is total and referentially consistent.
    ///
    /// Runs before any step executes; a failure here means nothing has been
    /// sent to the cluster.
    pub fn validate(&self) -> Result<()> {
        validate_host(&self.router, "router")?;
        let replica_sets = self.validate_replica_sets()?;
        self.validate_shards(&replica_sets)?;
        self.validate_databases()?;
        self.validate_indexes()?;
        Ok(())
    }

    fn validate_replica_sets(&self) -> Result<HashMap<&str, &ReplicaSetSpec>> {
        let mut by_name = HashMap::new();
        let mut host_owner: HashMap<&str, &str> = HashMap::new();
        for rs in &self.replica_sets {
            rs.validate()?;
            if by_name.insert(rs.name.as_str(), rs).is_some() {
                return Err(BootError::config(format!(
                    "duplicate replica set name '{}'",
                    rs.name
                )));
            }
            for host in rs.hosts() {
                if let Some(previous) = host_owner.insert(host, rs.name.as_str()) {
                    return Err(BootError::config(format!(
                        "host '{}' is a member of both '{}' and '{}'",
                        host, previous, rs.name
                    )));
                }
            }
        }

        let config_sets = self
            .replica_sets
            .iter()
            .filter(|rs| rs.config_server)
            .count();
        if config_sets != 1 {
            return Err(BootError::config(format!(
                "exactly one config-server replica set is required, found {}",
                config_sets
            )));
        }
        if host_owner.contains_key(self.router.as_str()) {
            return Err(BootError::config(format!(
                "router address '{}' is also a replica set member",
                self.router
            )));
        }
        Ok(by_name)
    }

    fn validate_shards(&self, replica_sets: &HashMap<&str, &ReplicaSetSpec>) -> Result<()> {
        let mut names = HashSet::new();
        let mut backing: HashMap<&str, &str> = HashMap::new();
        for shard in &self.shards {
            validate_name("shard", &shard.name, &['/', ','])?;
            if !names.insert(shard.name.as_str()) {
                return Err(BootError::config(format!(
                    "duplicate shard name '{}'",
                    shard.name
                )));
            }
            let rs = replica_sets.get(shard.replica_set.as_str()).ok_or_else(|| {
                BootError::config(format!(
                    "shard '{}' references unknown replica set '{}'",
                    shard.name, shard.replica_set
                ))
            })?;
            if rs.config_server {
                return Err(BootError::config(format!(
                    "shard '{}' cannot be backed by config-server replica set '{}'",
                    shard.name, rs.name
                )));
            }
            if let Some(other) = backing.insert(rs.name.as_str(), shard.name.as_str()) {
                return Err(BootError::config(format!(
                    "replica set '{}' backs both shard '{}' and shard '{}'",
                    rs.name, other, shard.name
                )));
            }
        }
        Ok(())
    }

    fn validate_databases(&self) -> Result<()> {
        if !self.databases.is_empty() && self.shards.is_empty() {
            return Err(BootError::config(
                "sharded databases are declared but no shard is registered",
            ));
        }

        let mut names = HashSet::new();
        for db in &self.databases {
            validate_name("database", &db.name, &['.', '/', '\\', '$', '"'])?;
            if !names.insert(db.name.as_str()) {
                return Err(BootError::config(format!(
                    "duplicate sharded database '{}'",
                    db.name
                )));
            }
            let mut collections = HashSet::new();
            for collection in &db.collections {
                validate_name("collection", &collection.name, &['$'])?;
                if !collections.insert(collection.name.as_str()) {
                    return Err(BootError::config(format!(
                        "collection '{}.{}' is sharded more than once",
                        db.name, collection.name
                    )));
                }
                validate_key_pattern(
                    &format!("shard key of '{}.{}'", db.name, collection.name),
                    &collection.shard_key,
                )?;
            }
        }
        Ok(())
    }

    fn validate_indexes(&self) -> Result<()> {
        let mut names = HashSet::new();
        let mut patterns = HashSet::new();
        for index in &self.indexes {
            validate_name("database", &index.database, &['.', '/', '\\', '$', '"'])?;
            validate_name("collection", &index.collection, &['$'])?;
            validate_name("index", &index.options.name, &[])?;
            let ns = index.namespace();
            validate_key_pattern(&format!("index '{}' on '{}'", index.options.name, ns), &index.keys)?;
            if !names.insert((ns.clone(), index.options.name.as_str())) {
                return Err(BootError::config(format!(
                    "index name '{}' is declared twice on '{}'",
                    index.options.name, ns
                )));
            }
            if !patterns.insert((ns.clone(), index.keys.clone())) {
                return Err(BootError::config(format!(
                    "key pattern {} is declared twice on '{}'",
                    index.keys, ns
                )));
            }
        }
        Ok(())
    }
}
