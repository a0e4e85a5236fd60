use anyhow::Result;
use pool_migrate_core::{Clients, Config};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

mod reconcile;
mod restore;
mod snapshot;
#[cfg(test)]
mod test_support;

pub use reconcile::{reconcile, remap_item, remap_sort_key, FailedUpdate, ReconcileStats};
pub use restore::{restore, CredentialPolicy, RestoreError, RestoreOptions, RestoreSummary};
pub use snapshot::{backup, backup_at, BackupSummary};

pub const API_CONTRACT_VERSION: &str = "invoke.v1";

pub const INVALID_OPERATION_MESSAGE: &str = r#"Invalid operation. Use "backup" or "restore""#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Backup,
    Restore,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backup => "backup",
            Self::Restore => "restore",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "backup" => Some(Self::Backup),
            "restore" => Some(Self::Restore),
            _ => None,
        }
    }
}

/// Invocation event. Every field is optional on the wire; presence is
/// checked per operation so the caller gets a field-specific message.
/// A field holding anything other than a JSON string reads as absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvocationRequest {
    #[serde(default, deserialize_with = "text_or_absent", skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, deserialize_with = "text_or_absent", skip_serializing_if = "Option::is_none")]
    pub user_pool_id: Option<String>,
    #[serde(default, deserialize_with = "text_or_absent", skip_serializing_if = "Option::is_none")]
    pub backup_key: Option<String>,
    #[serde(default, deserialize_with = "text_or_absent", skip_serializing_if = "Option::is_none")]
    pub target_user_pool_id: Option<String>,
}

fn text_or_absent<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(text) => Ok(Some(text)),
        _ => Ok(None),
    }
}

impl InvocationRequest {
    #[must_use]
    pub fn backup(user_pool_id: impl Into<String>) -> Self {
        Self {
            operation: Some(Operation::Backup.as_str().to_string()),
            user_pool_id: Some(user_pool_id.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn restore(backup_key: impl Into<String>, target_user_pool_id: impl Into<String>) -> Self {
        Self {
            operation: Some(Operation::Restore.as_str().to_string()),
            backup_key: Some(backup_key.into()),
            target_user_pool_id: Some(target_user_pool_id.into()),
            ..Self::default()
        }
    }
}

/// Status-coded reply; `body` is itself a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvocationResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub body: String,
}

impl InvocationResponse {
    #[must_use]
    pub fn success<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_string(payload) {
            Ok(body) => Self { status_code: 200, body },
            Err(err) => Self::error(500, &format!("failed to encode response: {err}")),
        }
    }

    #[must_use]
    pub fn error(status_code: u16, message: &str) -> Self {
        Self { status_code, body: json!({ "error": message }).to_string() }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }

    /// Parse `body` back into JSON.
    ///
    /// # Errors
    /// Returns an error when the body is not valid JSON.
    pub fn body_json(&self) -> serde_json::Result<Value> {
        serde_json::from_str(&self.body)
    }
}

impl RestoreOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        let credential_policy = match &config.temporary_password {
            Some(password) => CredentialPolicy::TemporaryPassword(password.clone()),
            None => CredentialPolicy::EmailInvite,
        };
        Self { credential_policy }
    }
}

fn present(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|value| !value.is_empty())
}

/// Backup / restore entry point over one set of client handles.
#[derive(Debug, Clone)]
pub struct MigrationService {
    clients: Clients,
    options: RestoreOptions,
}

impl MigrationService {
    #[must_use]
    pub fn new(clients: Clients) -> Self {
        Self::with_options(clients, RestoreOptions::default())
    }

    #[must_use]
    pub fn with_options(clients: Clients, options: RestoreOptions) -> Self {
        Self { clients, options }
    }

    /// Snapshot `user_pool_id` into the object store.
    ///
    /// # Errors
    /// Returns an error when the pool cannot be read or the snapshot cannot be written.
    pub async fn backup(&self, user_pool_id: &str) -> Result<BackupSummary> {
        snapshot::backup(&self.clients, user_pool_id).await
    }

    /// Restore the snapshot at `backup_key` into `target_user_pool_id`.
    ///
    /// # Errors
    /// Returns an error when the target pool is missing or the snapshot cannot be read.
    pub async fn restore(
        &self,
        backup_key: &str,
        target_user_pool_id: &str,
    ) -> Result<RestoreSummary> {
        restore::restore(&self.clients, &self.options, backup_key, target_user_pool_id).await
    }

    /// Validate and dispatch one invocation. Never fails: caller mistakes map
    /// to 400 and downstream errors to 500.
    pub async fn handle(&self, request: &InvocationRequest) -> InvocationResponse {
        match request.operation.as_deref().and_then(Operation::parse) {
            Some(Operation::Backup) => {
                let Some(user_pool_id) = present(request.user_pool_id.as_ref()) else {
                    return InvocationResponse::error(
                        400,
                        "user_pool_id is required for backup operation",
                    );
                };
                respond(self.backup(user_pool_id).await)
            }
            Some(Operation::Restore) => {
                let Some(backup_key) = present(request.backup_key.as_ref()) else {
                    return InvocationResponse::error(
                        400,
                        "backup_key is required for restore operation",
                    );
                };
                let Some(target_user_pool_id) = present(request.target_user_pool_id.as_ref())
                else {
                    return InvocationResponse::error(
                        400,
                        "target_user_pool_id is required for restore operation",
                    );
                };
                respond(self.restore(backup_key, target_user_pool_id).await)
            }
            None => InvocationResponse::error(400, INVALID_OPERATION_MESSAGE),
        }
    }
}

fn respond<T: Serialize>(result: Result<T>) -> InvocationResponse {
    match result {
        Ok(payload) => InvocationResponse::success(&payload),
        Err(err) => {
            tracing::error!("Invocation failed: {err:#}");
            InvocationResponse::error(500, &format!("{err:#}"))
        }
    }
}
