use std::sync::Arc;

use pool_migrate_core::memory::{InMemoryDirectory, InMemoryObjectStore, InMemoryTable};
use pool_migrate_core::{Clients, Group, PoolMetadata, Snapshot, User, UserStatus};

pub const SOURCE_POOL: &str = "eu-west-2_source";
pub const TARGET_POOL: &str = "eu-west-2_target";
pub const BUCKET: &str = "pool-snapshots";

pub struct Harness {
    pub directory: Arc<InMemoryDirectory>,
    pub objects: Arc<InMemoryObjectStore>,
    pub table: Arc<InMemoryTable>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_directory(InMemoryDirectory::new())
    }

    pub fn with_directory(directory: InMemoryDirectory) -> Self {
        directory.add_pool(SOURCE_POOL, "source");
        directory.add_pool(TARGET_POOL, "target");
        Self {
            directory: Arc::new(directory),
            objects: Arc::new(InMemoryObjectStore::new(BUCKET)),
            table: Arc::new(InMemoryTable::new(true)),
        }
    }

    pub fn clients(&self) -> Clients {
        Clients {
            directory: self.directory.clone(),
            objects: self.objects.clone(),
            table: Some(self.table.clone()),
        }
    }

    pub fn clients_without_table(&self) -> Clients {
        Clients { table: None, ..self.clients() }
    }

    /// Store `snapshot` under `key` and return the key.
    pub fn store_snapshot(&self, key: &str, snapshot: &Snapshot) -> String {
        let bytes = snapshot
            .to_json_bytes()
            .unwrap_or_else(|err| panic!("fixture snapshot must encode: {err}"));
        self.objects.insert(key, bytes);
        key.to_string()
    }
}

pub fn snapshot_of(users: Vec<User>, groups: Vec<Group>) -> Snapshot {
    Snapshot {
        timestamp: "2024-03-05T10:20:30Z".to_string(),
        pool: PoolMetadata::default(),
        users,
        groups,
    }
}

pub fn confirmed_user(username: &str, sub: &str) -> User {
    User::new(username)
        .with_attribute("sub", sub)
        .with_attribute("email", format!("{username}@example.com"))
        .with_status(UserStatus::Confirmed)
}
