//! In-process implementations of the client traits.
//!
//! They follow the managed services' documented contracts closely enough to
//! drive the snapshot and restore flows end to end, and expose failure
//! injection hooks so partial-failure paths can be exercised.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Map;
use ulid::Ulid;

use crate::{
    Attribute, BackendError, Delivery, Directory, Group, Item, ItemKey, KeyValueTable, NewUser,
    ObjectStore, PoolMetadata, User, UserPage, UserStatus, SUB_ATTRIBUTE,
};

const DEFAULT_PAGE_SIZE: usize = 60;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredUser {
    attributes: Vec<Attribute>,
    status: UserStatus,
    groups: BTreeSet<String>,
    passwords: Vec<(String, bool)>,
}

#[derive(Debug, Clone, Default)]
struct PoolState {
    metadata: PoolMetadata,
    users: BTreeMap<String, StoredUser>,
    groups: BTreeMap<String, Group>,
}

#[derive(Debug, Default)]
struct DirectoryState {
    pools: BTreeMap<String, PoolState>,
    failing_user_creates: BTreeSet<String>,
    failing_user_lookups: BTreeSet<String>,
    failing_password_sets: BTreeSet<String>,
    failing_group_lookups: BTreeSet<String>,
    failing_memberships: BTreeSet<(String, String)>,
    fail_group_listing: bool,
    fail_describe: bool,
    mutations: usize,
}

/// Directory with any number of pools held in memory.
#[derive(Debug)]
pub struct InMemoryDirectory {
    state: Mutex<DirectoryState>,
    page_size: usize,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self { state: Mutex::new(DirectoryState::default()), page_size: page_size.max(1) }
    }

    pub fn add_pool(&self, pool_id: &str, name: &str) {
        let metadata = PoolMetadata {
            id: Some(pool_id.to_string()),
            name: Some(name.to_string()),
            extra: Map::new(),
        };
        lock(&self.state)
            .pools
            .insert(pool_id.to_string(), PoolState { metadata, ..PoolState::default() });
    }

    /// Seed a user exactly as given, `sub` included. Missing pools are created.
    pub fn seed_user(&self, pool_id: &str, user: &User) {
        let mut state = lock(&self.state);
        let pool = state.pools.entry(pool_id.to_string()).or_default();
        pool.users.insert(
            user.username.clone(),
            StoredUser {
                attributes: user.attributes.clone(),
                status: user.status.unwrap_or(UserStatus::Confirmed),
                groups: user.groups.iter().cloned().collect(),
                passwords: Vec::new(),
            },
        );
    }

    pub fn seed_group(&self, pool_id: &str, group: &Group) {
        let mut state = lock(&self.state);
        let pool = state.pools.entry(pool_id.to_string()).or_default();
        pool.groups.insert(group.name.clone(), group.clone());
    }

    pub fn fail_user_create(&self, username: &str) {
        lock(&self.state).failing_user_creates.insert(username.to_string());
    }

    pub fn fail_user_lookup(&self, username: &str) {
        lock(&self.state).failing_user_lookups.insert(username.to_string());
    }

    pub fn fail_password_set(&self, username: &str) {
        lock(&self.state).failing_password_sets.insert(username.to_string());
    }

    pub fn fail_groups_for_user(&self, username: &str) {
        lock(&self.state).failing_group_lookups.insert(username.to_string());
    }

    pub fn fail_membership(&self, username: &str, group_name: &str) {
        lock(&self.state).failing_memberships.insert((username.to_string(), group_name.to_string()));
    }

    pub fn fail_group_listing(&self) {
        lock(&self.state).fail_group_listing = true;
    }

    pub fn fail_describe(&self) {
        lock(&self.state).fail_describe = true;
    }

    #[must_use]
    pub fn user(&self, pool_id: &str, username: &str) -> Option<User> {
        let state = lock(&self.state);
        let stored = state.pools.get(pool_id)?.users.get(username)?;
        Some(User {
            username: username.to_string(),
            attributes: stored.attributes.clone(),
            status: Some(stored.status),
            groups: stored.groups.iter().cloned().collect(),
            extra: Map::new(),
        })
    }

    #[must_use]
    pub fn group(&self, pool_id: &str, group_name: &str) -> Option<Group> {
        lock(&self.state).pools.get(pool_id)?.groups.get(group_name).cloned()
    }

    /// Passwords set for a user, in call order, with their permanence flag.
    #[must_use]
    pub fn password_history(&self, pool_id: &str, username: &str) -> Vec<(String, bool)> {
        lock(&self.state)
            .pools
            .get(pool_id)
            .and_then(|pool| pool.users.get(username))
            .map(|user| user.passwords.clone())
            .unwrap_or_default()
    }

    /// Count of successful state-changing calls across all pools.
    #[must_use]
    pub fn mutation_count(&self) -> usize {
        lock(&self.state).mutations
    }

    fn pool_missing(pool_id: &str) -> BackendError {
        BackendError::not_found(format!("User pool {pool_id} does not exist."))
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn describe_pool(&self, pool_id: &str) -> Result<PoolMetadata, BackendError> {
        let state = lock(&self.state);
        if state.fail_describe {
            return Err(BackendError::other("describe user pool is unavailable"));
        }
        state
            .pools
            .get(pool_id)
            .map(|pool| pool.metadata.clone())
            .ok_or_else(|| Self::pool_missing(pool_id))
    }

    async fn list_users(
        &self,
        pool_id: &str,
        next_token: Option<&str>,
    ) -> Result<UserPage, BackendError> {
        let state = lock(&self.state);
        let pool = state.pools.get(pool_id).ok_or_else(|| Self::pool_missing(pool_id))?;
        let start = match next_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| BackendError::other(format!("invalid pagination token: {token}")))?,
            None => 0,
        };

        let users = pool
            .users
            .iter()
            .skip(start)
            .take(self.page_size)
            .map(|(username, stored)| User {
                username: username.clone(),
                attributes: stored.attributes.clone(),
                status: Some(stored.status),
                groups: Vec::new(),
                extra: Map::new(),
            })
            .collect::<Vec<_>>();

        let consumed = start + users.len();
        let next_token = (consumed < pool.users.len()).then(|| consumed.to_string());
        Ok(UserPage { users, next_token })
    }

    async fn list_groups(&self, pool_id: &str) -> Result<Vec<Group>, BackendError> {
        let state = lock(&self.state);
        if state.fail_group_listing {
            return Err(BackendError::other("list groups is unavailable"));
        }
        let pool = state.pools.get(pool_id).ok_or_else(|| Self::pool_missing(pool_id))?;
        Ok(pool.groups.values().cloned().collect())
    }

    async fn list_groups_for_user(
        &self,
        pool_id: &str,
        username: &str,
    ) -> Result<Vec<String>, BackendError> {
        let state = lock(&self.state);
        if state.failing_group_lookups.contains(username) {
            return Err(BackendError::other(format!("cannot list groups for {username}")));
        }
        let pool = state.pools.get(pool_id).ok_or_else(|| Self::pool_missing(pool_id))?;
        let user = pool
            .users
            .get(username)
            .ok_or_else(|| BackendError::not_found(format!("User does not exist: {username}")))?;
        Ok(user.groups.iter().cloned().collect())
    }

    async fn create_group(&self, pool_id: &str, group: &Group) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        let pool = state.pools.get_mut(pool_id).ok_or_else(|| Self::pool_missing(pool_id))?;
        if pool.groups.contains_key(&group.name) {
            return Err(BackendError::already_exists(format!(
                "A group with the name {} already exists.",
                group.name
            )));
        }
        pool.groups.insert(
            group.name.clone(),
            Group {
                name: group.name.clone(),
                description: group.description.clone(),
                precedence: group.precedence,
                extra: Map::new(),
            },
        );
        state.mutations += 1;
        Ok(())
    }

    async fn create_user(
        &self,
        pool_id: &str,
        user: &NewUser,
    ) -> Result<Vec<Attribute>, BackendError> {
        let mut state = lock(&self.state);
        if state.failing_user_creates.contains(&user.username) {
            return Err(BackendError::other(format!("cannot create user {}", user.username)));
        }
        if user.attributes.iter().any(|attribute| attribute.name == SUB_ATTRIBUTE) {
            return Err(BackendError::other("Cannot modify the non-mutable attribute sub"));
        }
        let pool = state.pools.get_mut(pool_id).ok_or_else(|| Self::pool_missing(pool_id))?;
        if pool.users.contains_key(&user.username) {
            return Err(BackendError::already_exists("User account already exists"));
        }

        let mut attributes =
            vec![Attribute::new(SUB_ATTRIBUTE, Ulid::new().to_string().to_lowercase())];
        attributes.extend(user.attributes.iter().cloned());

        let passwords = match &user.delivery {
            Delivery::Email => Vec::new(),
            Delivery::Suppressed { temporary_password } => {
                vec![(temporary_password.clone(), false)]
            }
        };
        pool.users.insert(
            user.username.clone(),
            StoredUser {
                attributes: attributes.clone(),
                status: UserStatus::ForceChangePassword,
                groups: BTreeSet::new(),
                passwords,
            },
        );
        state.mutations += 1;
        Ok(attributes)
    }

    async fn set_user_password(
        &self,
        pool_id: &str,
        username: &str,
        password: &str,
        permanent: bool,
    ) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if state.failing_password_sets.contains(username) {
            return Err(BackendError::other(format!(
                "Password does not conform to policy for {username}"
            )));
        }
        let pool = state.pools.get_mut(pool_id).ok_or_else(|| Self::pool_missing(pool_id))?;
        let user = pool
            .users
            .get_mut(username)
            .ok_or_else(|| BackendError::not_found(format!("User does not exist: {username}")))?;
        user.passwords.push((password.to_string(), permanent));
        if permanent {
            user.status = UserStatus::Confirmed;
        }
        state.mutations += 1;
        Ok(())
    }

    async fn add_user_to_group(
        &self,
        pool_id: &str,
        username: &str,
        group_name: &str,
    ) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if state.failing_memberships.contains(&(username.to_string(), group_name.to_string())) {
            return Err(BackendError::other(format!("cannot add {username} to {group_name}")));
        }
        let pool = state.pools.get_mut(pool_id).ok_or_else(|| Self::pool_missing(pool_id))?;
        if !pool.groups.contains_key(group_name) {
            return Err(BackendError::not_found(format!("Group not found: {group_name}")));
        }
        let user = pool
            .users
            .get_mut(username)
            .ok_or_else(|| BackendError::not_found(format!("User does not exist: {username}")))?;
        user.groups.insert(group_name.to_string());
        state.mutations += 1;
        Ok(())
    }

    async fn get_user_attributes(
        &self,
        pool_id: &str,
        username: &str,
    ) -> Result<Vec<Attribute>, BackendError> {
        let state = lock(&self.state);
        if state.failing_user_lookups.contains(username) {
            return Err(BackendError::other(format!("cannot look up {username}")));
        }
        let pool = state.pools.get(pool_id).ok_or_else(|| Self::pool_missing(pool_id))?;
        pool.users
            .get(username)
            .map(|user| user.attributes.clone())
            .ok_or_else(|| BackendError::not_found(format!("User does not exist: {username}")))
    }
}

/// Bucket-like blob store.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    bucket: String,
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_puts: Mutex<bool>,
}

impl InMemoryObjectStore {
    #[must_use]
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            objects: Mutex::new(BTreeMap::new()),
            fail_puts: Mutex::new(false),
        }
    }

    pub fn insert(&self, key: &str, body: Vec<u8>) {
        lock(&self.objects).insert(key.to_string(), body);
    }

    #[must_use]
    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(key).cloned()
    }

    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    pub fn fail_puts(&self) {
        *lock(&self.fail_puts) = true;
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), BackendError> {
        if *lock(&self.fail_puts) {
            return Err(BackendError::other(format!("Access Denied writing {key}")));
        }
        lock(&self.objects).insert(key.to_string(), body);
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        lock(&self.objects)
            .get(key)
            .cloned()
            .ok_or_else(|| BackendError::not_found(format!("The specified key does not exist: {key}")))
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }
}

#[derive(Debug, Default)]
struct TableState {
    items: BTreeMap<ItemKey, Item>,
    failing_queries: BTreeSet<String>,
    failing_puts: BTreeSet<String>,
    writes: usize,
}

/// Two-part-key table. `transactional` selects whether `replace_item` is
/// applied as one unit or as a plain delete followed by a put.
#[derive(Debug)]
pub struct InMemoryTable {
    state: Mutex<TableState>,
    transactional: bool,
}

impl InMemoryTable {
    #[must_use]
    pub fn new(transactional: bool) -> Self {
        Self { state: Mutex::new(TableState::default()), transactional }
    }

    pub fn seed(&self, item: Item) {
        lock(&self.state).items.insert(item.key(), item);
    }

    pub fn fail_query(&self, partition_key: &str) {
        lock(&self.state).failing_queries.insert(partition_key.to_string());
    }

    /// Reject every put whose partition key is `partition_key`.
    pub fn fail_puts_to(&self, partition_key: &str) {
        lock(&self.state).failing_puts.insert(partition_key.to_string());
    }

    #[must_use]
    pub fn get(&self, key: &ItemKey) -> Option<Item> {
        lock(&self.state).items.get(key).cloned()
    }

    #[must_use]
    pub fn items_in(&self, partition_key: &str) -> Vec<Item> {
        lock(&self.state)
            .items
            .values()
            .filter(|item| item.partition_key == partition_key)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.state).items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of successful item writes (puts and deletes).
    #[must_use]
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    fn rejected_put(partition_key: &str) -> BackendError {
        BackendError::other(format!("put rejected for partition {partition_key}"))
    }
}

#[async_trait]
impl KeyValueTable for InMemoryTable {
    async fn query_partition(&self, partition_key: &str) -> Result<Vec<Item>, BackendError> {
        let state = lock(&self.state);
        if state.failing_queries.contains(partition_key) {
            return Err(BackendError::other(format!("query failed for {partition_key}")));
        }
        Ok(state
            .items
            .values()
            .filter(|item| item.partition_key == partition_key)
            .cloned()
            .collect())
    }

    async fn put_item(&self, item: &Item) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        if state.failing_puts.contains(&item.partition_key) {
            return Err(Self::rejected_put(&item.partition_key));
        }
        state.items.insert(item.key(), item.clone());
        state.writes += 1;
        Ok(())
    }

    async fn delete_item(&self, key: &ItemKey) -> Result<(), BackendError> {
        let mut state = lock(&self.state);
        state.items.remove(key);
        state.writes += 1;
        Ok(())
    }

    async fn replace_item(&self, old: &ItemKey, new: &Item) -> Result<(), BackendError> {
        if !self.transactional {
            self.delete_item(old).await?;
            return self.put_item(new).await;
        }

        let mut state = lock(&self.state);
        if state.failing_puts.contains(&new.partition_key) {
            return Err(Self::rejected_put(&new.partition_key));
        }
        state.items.remove(old);
        state.items.insert(new.key(), new.clone());
        state.writes += 2;
        Ok(())
    }
}
