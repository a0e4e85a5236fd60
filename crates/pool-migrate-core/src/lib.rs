use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::macros::format_description;
use time::OffsetDateTime;

pub mod memory;

/// Directory-assigned identifier attribute; never sent back on user creation.
pub const SUB_ATTRIBUTE: &str = "sub";
pub const SNAPSHOT_PREFIX: &str = "cognito-backups";
pub const PARTITION_PREFIX: &str = "u#";
pub const DEFAULT_REGION: &str = "eu-west-2";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AlreadyExists,
    NotFound,
    Other,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::Other => "other",
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a directory, object-store, or key-value client.
///
/// The `kind` tag is what callers branch on; `message` is only for logs and
/// response bodies.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
#[error("{message}")]
pub struct BackendError {
    pub kind: ErrorKind,
    pub message: String,
}

impl BackendError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    #[must_use]
    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AlreadyExists, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Other, message)
    }

    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        self.kind == ErrorKind::AlreadyExists
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ModelError {
    #[error("snapshot encode error: {0}")]
    Encode(String),
    #[error("snapshot decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ConfigError {
    #[error("BACKUP_BUCKET_NAME is required")]
    MissingBackupBucket,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct Attribute {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Value", default)]
    pub value: String,
}

impl Attribute {
    #[must_use]
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Return the non-empty `sub` value carried in an attribute list.
#[must_use]
pub fn find_sub(attributes: &[Attribute]) -> Option<&str> {
    attributes
        .iter()
        .find(|attribute| attribute.name == SUB_ATTRIBUTE)
        .map(|attribute| attribute.value.as_str())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserStatus {
    Unconfirmed,
    Confirmed,
    Archived,
    Compromised,
    ResetRequired,
    ForceChangePassword,
    ExternalProvider,
    #[serde(other)]
    Unknown,
}

impl UserStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconfirmed => "UNCONFIRMED",
            Self::Confirmed => "CONFIRMED",
            Self::Archived => "ARCHIVED",
            Self::Compromised => "COMPROMISED",
            Self::ResetRequired => "RESET_REQUIRED",
            Self::ForceChangePassword => "FORCE_CHANGE_PASSWORD",
            Self::ExternalProvider => "EXTERNAL_PROVIDER",
            Self::Unknown => "UNKNOWN",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "UNCONFIRMED" => Self::Unconfirmed,
            "CONFIRMED" => Self::Confirmed,
            "ARCHIVED" => Self::Archived,
            "COMPROMISED" => Self::Compromised,
            "RESET_REQUIRED" => Self::ResetRequired,
            "FORCE_CHANGE_PASSWORD" => Self::ForceChangePassword,
            "EXTERNAL_PROVIDER" => Self::ExternalProvider,
            _ => Self::Unknown,
        }
    }
}

/// One directory user as captured in a snapshot.
///
/// Field names follow the directory's own wire shape so snapshots written by
/// earlier tooling stay readable. Anything not modelled here is carried in
/// `extra` untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    #[serde(rename = "Username")]
    pub username: String,
    #[serde(rename = "Attributes", default)]
    pub attributes: Vec<Attribute>,
    #[serde(rename = "UserStatus", default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UserStatus>,
    #[serde(rename = "Groups", default)]
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl User {
    #[must_use]
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            attributes: Vec::new(),
            status: None,
            groups: Vec::new(),
            extra: Map::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push(Attribute::new(name, value));
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: UserStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn sub(&self) -> Option<&str> {
        find_sub(&self.attributes)
    }

    /// Attributes suitable for a create call: everything except `sub`.
    #[must_use]
    pub fn creatable_attributes(&self) -> Vec<Attribute> {
        self.attributes
            .iter()
            .filter(|attribute| attribute.name != SUB_ATTRIBUTE)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.status == Some(UserStatus::Confirmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    #[serde(rename = "GroupName")]
    pub name: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Precedence", default, skip_serializing_if = "Option::is_none")]
    pub precedence: Option<i32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Group {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), description: None, precedence: None, extra: Map::new() }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    #[must_use]
    pub fn with_precedence(mut self, precedence: i32) -> Self {
        self.precedence = Some(precedence);
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PoolMetadata {
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "Name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Point-in-time export of one pool. Written once, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub timestamp: String,
    #[serde(rename = "user_pool", default)]
    pub pool: PoolMetadata,
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl Snapshot {
    /// Assemble a snapshot stamped with `taken_at` in RFC 3339 form.
    ///
    /// # Errors
    /// Returns an error when the timestamp cannot be formatted.
    pub fn new(
        taken_at: OffsetDateTime,
        pool: PoolMetadata,
        users: Vec<User>,
        groups: Vec<Group>,
    ) -> Result<Self, ModelError> {
        let timestamp = taken_at
            .format(&time::format_description::well_known::Rfc3339)
            .map_err(|err| ModelError::Encode(err.to_string()))?;
        Ok(Self { timestamp, pool, users, groups })
    }

    /// Serialize as indented JSON, the on-disk snapshot format.
    ///
    /// # Errors
    /// Returns an error when serialization fails.
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, ModelError> {
        serde_json::to_vec_pretty(self).map_err(|err| ModelError::Encode(err.to_string()))
    }

    /// Parse a snapshot previously written by [`Snapshot::to_json_bytes`].
    ///
    /// # Errors
    /// Returns an error when the bytes are not a valid snapshot document.
    pub fn from_json_slice(bytes: &[u8]) -> Result<Self, ModelError> {
        serde_json::from_slice(bytes).map_err(|err| ModelError::Decode(err.to_string()))
    }
}

/// Object-store key for a snapshot of `pool_id` taken at `taken_at`.
///
/// # Errors
/// Returns an error when the timestamp cannot be formatted.
pub fn snapshot_key(pool_id: &str, taken_at: OffsetDateTime) -> Result<String, ModelError> {
    let stamp = taken_at
        .format(format_description!("[year]-[month]-[day]_[hour]-[minute]-[second]"))
        .map_err(|err| ModelError::Encode(err.to_string()))?;
    Ok(format!("{SNAPSHOT_PREFIX}/{pool_id}/{stamp}.json"))
}

/// Key-value partition key owned by the user with identifier `sub`.
#[must_use]
pub fn partition_key_for(sub: &str) -> String {
    format!("{PARTITION_PREFIX}{sub}")
}

/// Old and new directory identifier for one re-created user.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct IdentifierRemap {
    pub username: String,
    pub old_sub: String,
    pub new_sub: String,
}

impl IdentifierRemap {
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        old_sub: impl Into<String>,
        new_sub: impl Into<String>,
    ) -> Self {
        Self { username: username.into(), old_sub: old_sub.into(), new_sub: new_sub.into() }
    }

    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.old_sub == self.new_sub
    }
}

/// Opaque key-value attribute. Mirrors the table's native value shapes so
/// rows can be copied without interpretation.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ItemValue {
    S(String),
    N(String),
    B(Vec<u8>),
    Bool(bool),
    Null,
    L(Vec<ItemValue>),
    M(BTreeMap<String, ItemValue>),
    Ss(Vec<String>),
    Ns(Vec<String>),
    Bs(Vec<Vec<u8>>),
}

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ItemKey {
    pub partition_key: String,
    pub sort_key: String,
}

impl ItemKey {
    #[must_use]
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self { partition_key: partition_key.into(), sort_key: sort_key.into() }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Item {
    pub partition_key: String,
    pub sort_key: String,
    pub attributes: BTreeMap<String, ItemValue>,
}

impl Item {
    #[must_use]
    pub fn new(partition_key: impl Into<String>, sort_key: impl Into<String>) -> Self {
        Self {
            partition_key: partition_key.into(),
            sort_key: sort_key.into(),
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: impl Into<String>, value: ItemValue) -> Self {
        self.attributes.insert(name.into(), value);
        self
    }

    #[must_use]
    pub fn key(&self) -> ItemKey {
        ItemKey::new(self.partition_key.clone(), self.sort_key.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct UserPage {
    pub users: Vec<User>,
    pub next_token: Option<String>,
}

/// How the directory hands the first credential to a newly created user.
#[derive(Clone, Eq, PartialEq)]
pub enum Delivery {
    Email,
    Suppressed { temporary_password: String },
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Email => f.write_str("Email"),
            Self::Suppressed { .. } => f.write_str("Suppressed { temporary_password: <redacted> }"),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewUser {
    pub username: String,
    pub attributes: Vec<Attribute>,
    pub delivery: Delivery,
}

#[async_trait]
pub trait Directory: Send + Sync {
    async fn describe_pool(&self, pool_id: &str) -> Result<PoolMetadata, BackendError>;

    /// One page of users; pass the previous page's `next_token` to continue.
    async fn list_users(
        &self,
        pool_id: &str,
        next_token: Option<&str>,
    ) -> Result<UserPage, BackendError>;

    async fn list_groups(&self, pool_id: &str) -> Result<Vec<Group>, BackendError>;

    async fn list_groups_for_user(
        &self,
        pool_id: &str,
        username: &str,
    ) -> Result<Vec<String>, BackendError>;

    async fn create_group(&self, pool_id: &str, group: &Group) -> Result<(), BackendError>;

    /// Create a user and return the attributes the directory assigned,
    /// including the freshly minted `sub`.
    async fn create_user(
        &self,
        pool_id: &str,
        user: &NewUser,
    ) -> Result<Vec<Attribute>, BackendError>;

    async fn set_user_password(
        &self,
        pool_id: &str,
        username: &str,
        password: &str,
        permanent: bool,
    ) -> Result<(), BackendError>;

    async fn add_user_to_group(
        &self,
        pool_id: &str,
        username: &str,
        group_name: &str,
    ) -> Result<(), BackendError>;

    async fn get_user_attributes(
        &self,
        pool_id: &str,
        username: &str,
    ) -> Result<Vec<Attribute>, BackendError>;
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), BackendError>;

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, BackendError>;

    /// Human-readable location of `key`, e.g. `s3://bucket/key`.
    fn location(&self, key: &str) -> String;
}

#[async_trait]
pub trait KeyValueTable: Send + Sync {
    async fn query_partition(&self, partition_key: &str) -> Result<Vec<Item>, BackendError>;

    async fn put_item(&self, item: &Item) -> Result<(), BackendError>;

    async fn delete_item(&self, key: &ItemKey) -> Result<(), BackendError>;

    /// Move a row to a new key. Stores with multi-item transactions override
    /// this so the delete and the put land together; the default leaves a
    /// window between the two writes.
    async fn replace_item(&self, old: &ItemKey, new: &Item) -> Result<(), BackendError> {
        self.delete_item(old).await?;
        self.put_item(new).await
    }
}

/// Client handles built once at process start and passed to every operation.
#[derive(Clone)]
pub struct Clients {
    pub directory: Arc<dyn Directory>,
    pub objects: Arc<dyn ObjectStore>,
    pub table: Option<Arc<dyn KeyValueTable>>,
}

impl std::fmt::Debug for Clients {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clients")
            .field("objects", &self.objects.location(""))
            .field("table_configured", &self.table.is_some())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Eq, PartialEq)]
pub struct Config {
    pub region: String,
    pub backup_bucket: String,
    pub dynamodb_table: Option<String>,
    pub endpoint_url: Option<String>,
    pub temporary_password: Option<String>,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("region", &self.region)
            .field("backup_bucket", &self.backup_bucket)
            .field("dynamodb_table", &self.dynamodb_table)
            .field("endpoint_url", &self.endpoint_url)
            .field("temporary_password", &self.temporary_password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Config {
    /// Read configuration from process environment variables.
    ///
    /// # Errors
    /// Returns an error when `BACKUP_BUCKET_NAME` is unset or empty.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through an arbitrary variable lookup.
    ///
    /// Empty values count as unset.
    ///
    /// # Errors
    /// Returns an error when `BACKUP_BUCKET_NAME` is missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        Ok(Self {
            region: get("REGION").unwrap_or_else(|| DEFAULT_REGION.to_string()),
            backup_bucket: get("BACKUP_BUCKET_NAME").ok_or(ConfigError::MissingBackupBucket)?,
            dynamodb_table: get("DYNAMODB_TABLE_NAME"),
            endpoint_url: get("AWS_ENDPOINT_URL"),
            temporary_password: get("RESTORE_TEMPORARY_PASSWORD"),
        })
    }
}
