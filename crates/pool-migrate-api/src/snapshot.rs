use anyhow::{Context, Result};
use pool_migrate_core::{snapshot_key, Clients, Directory, Group, Snapshot, User};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupSummary {
    pub status: String,
    pub backup_location: String,
    pub users_backed_up: usize,
    pub groups_backed_up: usize,
}

/// Export `pool_id` to the object store, stamped with the current UTC time.
///
/// # Errors
/// Returns an error when pool metadata cannot be read, a user page cannot be
/// listed, or the snapshot cannot be written. Group lookups degrade to empty.
pub async fn backup(clients: &Clients, pool_id: &str) -> Result<BackupSummary> {
    backup_at(clients, pool_id, OffsetDateTime::now_utc()).await
}

/// Same as [`backup`] with an explicit snapshot time.
///
/// # Errors
/// See [`backup`].
pub async fn backup_at(
    clients: &Clients,
    pool_id: &str,
    taken_at: OffsetDateTime,
) -> Result<BackupSummary> {
    let directory = clients.directory.as_ref();
    let pool = directory
        .describe_pool(pool_id)
        .await
        .with_context(|| format!("failed to describe user pool {pool_id}"))?;

    let users = users_with_groups(directory, pool_id).await?;
    let groups = all_groups(directory, pool_id).await;
    let (users_backed_up, groups_backed_up) = (users.len(), groups.len());

    let snapshot = Snapshot::new(taken_at, pool, users, groups)?;
    let key = snapshot_key(pool_id, taken_at)?;
    clients
        .objects
        .put_object(&key, snapshot.to_json_bytes()?)
        .await
        .with_context(|| format!("failed to write snapshot {key}"))?;

    tracing::info!("Backup completed for user pool {pool_id}");
    Ok(BackupSummary {
        status: "success".to_string(),
        backup_location: clients.objects.location(&key),
        users_backed_up,
        groups_backed_up,
    })
}

async fn users_with_groups(directory: &dyn Directory, pool_id: &str) -> Result<Vec<User>> {
    let mut users = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
        let page = directory
            .list_users(pool_id, next_token.as_deref())
            .await
            .with_context(|| format!("failed to list users of {pool_id}"))?;

        for mut user in page.users {
            match directory.list_groups_for_user(pool_id, &user.username).await {
                Ok(groups) => {
                    tracing::info!("User {} belongs to groups: {groups:?}", user.username);
                    user.groups = groups;
                }
                Err(err) => {
                    tracing::warn!("Could not retrieve groups for user {}: {err}", user.username);
                    user.groups = Vec::new();
                }
            }
            users.push(user);
        }

        match page.next_token {
            Some(token) => next_token = Some(token),
            None => break,
        }
    }
    Ok(users)
}

async fn all_groups(directory: &dyn Directory, pool_id: &str) -> Vec<Group> {
    match directory.list_groups(pool_id).await {
        Ok(groups) => groups,
        Err(err) => {
            tracing::warn!("Could not retrieve groups: {err}");
            Vec::new()
        }
    }
}
