impl Topology {
    /// The blog deployment: a three-member config set, two three-member
    /// shards, `blog_db` sharded on `blogs` and `comments`, plus the read-path
    /// indexes for blogs, comments and users.
    pub fn blog_cluster() -> Self {
        let db = "blog_db";
        Self {
            router: "mongos:27017".to_string(),
            replica_sets: vec![
                ReplicaSetSpec::config_server(
                    "cfg",
                    ["mongo-cfg1:27017", "mongo-cfg2:27017", "mongo-cfg3:27017"],
                ),
                ReplicaSetSpec::new(
                    "shard1",
                    ["mongo-shard1-1:27017", "mongo-shard1-2:27017", "mongo-shard1-3:27017"],
                ),
                ReplicaSetSpec::new(
                    "shard2",
                    ["mongo-shard2-1:27017", "mongo-shard2-2:27017", "mongo-shard2-3:27017"],
                ),
            ],
            shards: vec![
                ShardRegistration::new("shard1", "shard1"),
                ShardRegistration::new("shard2", "shard2"),
            ],
            databases: vec![
                ShardedDatabaseSpec::new(db)
                    .collection("blogs", KeyPattern::new().asc("author_id"))
                    .collection("comments", KeyPattern::new().asc("blog_id")),
            ],
            indexes: vec![
                IndexSpec::new(
                    db,
                    "blogs",
                    "idx_blogs_author_createdAt",
                    KeyPattern::new().asc("author_id").desc("created_at"),
                ),
                IndexSpec::new(
                    db,
                    "blogs",
                    "idx_blogs_createdAt_desc",
                    KeyPattern::new().desc("created_at"),
                ),
                IndexSpec::new(
                    db,
                    "blogs",
                    "idx_blogs_viewCount_desc",
                    KeyPattern::new().desc("view_count"),
                ),
                IndexSpec::new(db, "blogs", "idx_blogs_tags", KeyPattern::new().asc("tags")),
                IndexSpec::new(
                    db,
                    "comments",
                    "idx_comments_blog_root_createdAt",
                    KeyPattern::new().asc("blog_id").asc("is_root").asc("created_at"),
                ),
                IndexSpec::new(
                    db,
                    "comments",
                    "idx_comments_root_rootFlag_createdAt",
                    KeyPattern::new().asc("root_id").asc("is_root").asc("created_at"),
                ),
                IndexSpec::new(db, "users", "uidx_users_email", KeyPattern::new().asc("email"))
                    .unique(),
                IndexSpec::new(
                    db,
                    "users",
                    "uidx_users_username",
                    KeyPattern::new().asc("username"),
                )
                .unique(),
            ],
        }
    }
}
