use anyhow::{anyhow, Context, Result};
use pool_migrate_core::{
    find_sub, Clients, Delivery, Directory, Group, IdentifierRemap, NewUser, Snapshot, User,
};
use serde::{Deserialize, Serialize};

use crate::reconcile::{reconcile, FailedUpdate, ReconcileStats};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum RestoreError {
    #[error("User pool {pool_id} does not exist")]
    PoolNotFound { pool_id: String },
}

/// How restored users receive their first credential.
#[derive(Clone, PartialEq, Eq, Default)]
pub enum CredentialPolicy {
    /// The directory emails an invitation with a generated password.
    #[default]
    EmailInvite,
    /// Invitations are suppressed and every user starts with this password.
    /// Users that were confirmed in the snapshot get it as a permanent one.
    TemporaryPassword(String),
}

impl std::fmt::Debug for CredentialPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmailInvite => f.write_str("EmailInvite"),
            Self::TemporaryPassword(_) => f.write_str("TemporaryPassword(<redacted>)"),
        }
    }
}

impl CredentialPolicy {
    fn delivery(&self) -> Delivery {
        match self {
            Self::EmailInvite => Delivery::Email,
            Self::TemporaryPassword(password) => {
                Delivery::Suppressed { temporary_password: password.clone() }
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    pub credential_policy: CredentialPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RestoreSummary {
    pub status: String,
    pub user_pool_id: String,
    pub users_restored: usize,
    pub groups_restored: usize,
    pub user_group_memberships_restored: usize,
    pub failed_users: Vec<String>,
    pub dynamodb_records_updated: usize,
    pub dynamodb_failed_updates: Vec<FailedUpdate>,
    pub dynamodb_skipped_updates: usize,
    pub backup_timestamp: String,
}

/// Where one snapshot user ended up in the target pool.
enum Placement {
    /// Created or already present, with the identifier the directory holds
    /// for it when one could be read.
    Placed { new_sub: Option<String> },
    Failed,
}

#[derive(Debug, Default)]
struct UserPhase {
    restored: usize,
    memberships: usize,
    failed: Vec<String>,
    remaps: Vec<IdentifierRemap>,
}

/// Rebuild a snapshot's groups and users in `target_pool_id`, then move
/// key-value rows from each user's old identifier to the new one.
///
/// Per-item failures are reported in the summary; only the pool check and
/// the snapshot read abort the run.
///
/// # Errors
/// Returns [`RestoreError::PoolNotFound`] when the target pool is missing,
/// and an error when the pool lookup or snapshot read otherwise fails.
pub async fn restore(
    clients: &Clients,
    options: &RestoreOptions,
    snapshot_key: &str,
    target_pool_id: &str,
) -> Result<RestoreSummary> {
    if target_pool_id.is_empty() {
        return Err(anyhow!("target_user_pool_id is required for restoration"));
    }
    let directory = clients.directory.as_ref();
    verify_pool(directory, target_pool_id).await?;

    let bytes = clients
        .objects
        .get_object(snapshot_key)
        .await
        .with_context(|| format!("failed to read snapshot {snapshot_key}"))?;
    let snapshot = Snapshot::from_json_slice(&bytes)
        .with_context(|| format!("snapshot {snapshot_key} is not valid"))?;

    let groups_restored = restore_groups(directory, target_pool_id, &snapshot.groups).await;
    let users = restore_users(directory, target_pool_id, &snapshot.users, options).await;

    let stats = match &clients.table {
        Some(table) => reconcile(table.as_ref(), &users.remaps).await,
        None => {
            tracing::warn!("DYNAMODB_TABLE_NAME not set, skipping DynamoDB updates");
            ReconcileStats::default()
        }
    };

    tracing::info!("Restore completed for user pool {target_pool_id}");
    Ok(RestoreSummary {
        status: "success".to_string(),
        user_pool_id: target_pool_id.to_string(),
        users_restored: users.restored,
        groups_restored,
        user_group_memberships_restored: users.memberships,
        failed_users: users.failed,
        dynamodb_records_updated: stats.records_updated,
        dynamodb_failed_updates: stats.failed_updates,
        dynamodb_skipped_updates: stats.skipped_updates,
        backup_timestamp: snapshot.timestamp,
    })
}

async fn verify_pool(directory: &dyn Directory, pool_id: &str) -> Result<()> {
    match directory.describe_pool(pool_id).await {
        Ok(_) => {
            tracing::info!("Using existing user pool: {pool_id}");
            Ok(())
        }
        Err(err) if err.is_not_found() => {
            tracing::error!("User pool {pool_id} does not exist");
            Err(RestoreError::PoolNotFound { pool_id: pool_id.to_string() }.into())
        }
        Err(err) => {
            tracing::error!("Failed to verify user pool {pool_id}: {err}");
            Err(anyhow::Error::new(err).context(format!("failed to verify user pool {pool_id}")))
        }
    }
}

async fn restore_groups(directory: &dyn Directory, pool_id: &str, groups: &[Group]) -> usize {
    let mut restored = 0;
    for group in groups {
        match directory.create_group(pool_id, group).await {
            Ok(()) => {
                restored += 1;
                tracing::info!("Restored group: {}", group.name);
            }
            Err(err) if err.is_already_exists() => {
                restored += 1;
                tracing::info!("Group {} already exists, skipping", group.name);
            }
            Err(err) => tracing::warn!("Failed to restore group {}: {err}", group.name),
        }
    }
    restored
}

async fn restore_users(
    directory: &dyn Directory,
    pool_id: &str,
    users: &[User],
    options: &RestoreOptions,
) -> UserPhase {
    let mut phase = UserPhase::default();

    for user in users {
        let username = user.username.as_str();
        let Placement::Placed { new_sub } =
            create_or_locate(directory, pool_id, user, options).await
        else {
            phase.failed.push(username.to_string());
            continue;
        };
        phase.restored += 1;

        match (user.sub(), new_sub) {
            (Some(old_sub), Some(new_sub)) => {
                tracing::info!("Mapped old sub {old_sub} to new sub {new_sub} for user {username}");
                phase.remaps.push(IdentifierRemap::new(username, old_sub, new_sub));
            }
            _ => tracing::info!("No sub mapping recorded for user {username}"),
        }

        phase.memberships += restore_memberships(directory, pool_id, username, &user.groups).await;
    }

    phase
}

/// Create `user`, or find it when it already exists. A created user whose
/// permanent password cannot be set counts as failed.
async fn create_or_locate(
    directory: &dyn Directory,
    pool_id: &str,
    user: &User,
    options: &RestoreOptions,
) -> Placement {
    let username = user.username.as_str();
    let request = NewUser {
        username: username.to_string(),
        attributes: user.creatable_attributes(),
        delivery: options.credential_policy.delivery(),
    };

    match directory.create_user(pool_id, &request).await {
        Ok(attributes) => {
            if let CredentialPolicy::TemporaryPassword(password) = &options.credential_policy {
                if user.is_confirmed() {
                    if let Err(err) =
                        directory.set_user_password(pool_id, username, password, true).await
                    {
                        tracing::warn!("Failed to restore user {username}: {err}");
                        return Placement::Failed;
                    }
                    tracing::info!("Set permanent password for confirmed user {username}");
                }
            }
            tracing::info!("Restored user: {username}");
            Placement::Placed { new_sub: find_sub(&attributes).map(str::to_string) }
        }
        Err(err) if err.is_already_exists() => {
            tracing::info!("User {username} already exists, skipping user creation");
            match directory.get_user_attributes(pool_id, username).await {
                Ok(attributes) => {
                    Placement::Placed { new_sub: find_sub(&attributes).map(str::to_string) }
                }
                Err(err) => {
                    tracing::warn!("Failed to get user {username} details: {err}");
                    Placement::Failed
                }
            }
        }
        Err(err) => {
            tracing::warn!("Failed to restore user {username}: {err}");
            Placement::Failed
        }
    }
}

async fn restore_memberships(
    directory: &dyn Directory,
    pool_id: &str,
    username: &str,
    groups: &[String],
) -> usize {
    let mut restored = 0;
    for group_name in groups {
        match directory.add_user_to_group(pool_id, username, group_name).await {
            Ok(()) => {
                restored += 1;
                tracing::info!("Added user {username} to group {group_name}");
            }
            Err(err) => {
                tracing::warn!("Failed to add user {username} to group {group_name}: {err}");
            }
        }
    }
    restored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{confirmed_user, snapshot_of, Harness, TARGET_POOL};
    use pool_migrate_core::{partition_key_for, Item, ItemKey, ItemValue, UserStatus};

    const KEY: &str = "cognito-backups/eu-west-2_source/2024-03-05_10-20-30.json";

    async fn run(harness: &Harness, options: &RestoreOptions) -> Result<RestoreSummary> {
        restore(&harness.clients(), options, KEY, TARGET_POOL).await
    }

    fn new_sub_of(harness: &Harness, username: &str) -> String {
        harness
            .directory
            .user(TARGET_POOL, username)
            .and_then(|user| user.sub().map(str::to_string))
            .unwrap_or_else(|| panic!("{username} was not restored"))
    }

    #[tokio::test]
    async fn test_group_is_created_in_empty_pool() -> Result<()> {
        let harness = Harness::new();
        harness.store_snapshot(
            KEY,
            &snapshot_of(Vec::new(), vec![Group::new("TestGroup").with_description("Test group")]),
        );

        let summary = run(&harness, &RestoreOptions::default()).await?;

        assert_eq!(summary.groups_restored, 1);
        let group = harness
            .directory
            .group(TARGET_POOL, "TestGroup")
            .unwrap_or_else(|| panic!("TestGroup missing"));
        assert_eq!(group.description.as_deref(), Some("Test group"));
        Ok(())
    }

    #[tokio::test]
    async fn rerunning_group_restore_counts_existing_groups() -> Result<()> {
        let harness = Harness::new();
        harness.directory.seed_group(TARGET_POOL, &Group::new("TestGroup"));
        harness.store_snapshot(
            KEY,
            &snapshot_of(Vec::new(), vec![Group::new("TestGroup").with_description("Test group")]),
        );

        let first = run(&harness, &RestoreOptions::default()).await?;
        let second = run(&harness, &RestoreOptions::default()).await?;

        assert_eq!(first.groups_restored, 1);
        assert_eq!(second.groups_restored, 1);
        Ok(())
    }

    #[tokio::test]
    async fn restored_user_gets_new_sub_and_rows_follow() -> Result<()> {
        let harness = Harness::new();
        harness.store_snapshot(
            KEY,
            &snapshot_of(
                vec![confirmed_user("alice", "old-a")
                    .with_attribute("custom:tier", "gold")
                    .with_groups(["admins"])],
                vec![Group::new("admins")],
            ),
        );
        harness.table.seed(
            Item::new("u#old-a", "profile").with_attribute("plan", ItemValue::S("pro".into())),
        );
        harness.table.seed(Item::new("u#old-a", "u#old-a"));

        let summary = run(&harness, &RestoreOptions::default()).await?;

        assert_eq!(summary.status, "success");
        assert_eq!(summary.user_pool_id, TARGET_POOL);
        assert_eq!(summary.users_restored, 1);
        assert_eq!(summary.user_group_memberships_restored, 1);
        assert!(summary.failed_users.is_empty());
        assert_eq!(summary.dynamodb_records_updated, 2);
        assert_eq!(summary.backup_timestamp, "2024-03-05T10:20:30Z");

        let new_sub = new_sub_of(&harness, "alice");
        assert_ne!(new_sub, "old-a");
        let restored = harness
            .directory
            .user(TARGET_POOL, "alice")
            .unwrap_or_else(|| panic!("alice missing"));
        assert!(restored.attributes.iter().any(|a| a.name == "custom:tier" && a.value == "gold"));
        assert_eq!(restored.groups, vec!["admins"]);

        let new_pk = partition_key_for(&new_sub);
        assert!(harness.table.items_in("u#old-a").is_empty());
        assert!(harness.table.get(&ItemKey::new(new_pk.clone(), "profile")).is_some());
        assert!(harness.table.get(&ItemKey::new(new_pk.clone(), new_pk)).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn existing_user_is_counted_and_remapped_through_lookup() -> Result<()> {
        let harness = Harness::new();
        harness.directory.seed_group(TARGET_POOL, &Group::new("staff"));
        harness.directory.seed_user(TARGET_POOL, &confirmed_user("bob", "current-b"));
        harness.table.seed(Item::new("u#old-b", "profile"));
        harness.store_snapshot(
            KEY,
            &snapshot_of(vec![confirmed_user("bob", "old-b").with_groups(["staff"])], Vec::new()),
        );

        let summary = run(&harness, &RestoreOptions::default()).await?;

        assert_eq!(summary.users_restored, 1);
        assert_eq!(summary.user_group_memberships_restored, 1);
        assert_eq!(summary.dynamodb_records_updated, 1);
        assert!(harness.table.get(&ItemKey::new("u#current-b", "profile")).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn existing_user_with_failed_lookup_is_reported_failed() -> Result<()> {
        let harness = Harness::new();
        harness.directory.seed_group(TARGET_POOL, &Group::new("staff"));
        harness.directory.seed_user(TARGET_POOL, &confirmed_user("bob", "current-b"));
        harness.directory.fail_user_lookup("bob");
        harness.store_snapshot(
            KEY,
            &snapshot_of(vec![confirmed_user("bob", "old-b").with_groups(["staff"])], Vec::new()),
        );

        let summary = run(&harness, &RestoreOptions::default()).await?;

        assert_eq!(summary.users_restored, 0);
        assert_eq!(summary.failed_users, vec!["bob"]);
        assert_eq!(summary.user_group_memberships_restored, 0);
        Ok(())
    }

    #[tokio::test]
    async fn creation_failure_skips_memberships_and_continues() -> Result<()> {
        let harness = Harness::new();
        harness.directory.fail_user_create("carol");
        harness.store_snapshot(
            KEY,
            &snapshot_of(
                vec![
                    confirmed_user("carol", "old-c").with_groups(["admins"]),
                    confirmed_user("dave", "old-d").with_groups(["admins"]),
                ],
                vec![Group::new("admins")],
            ),
        );

        let summary = run(&harness, &RestoreOptions::default()).await?;

        assert_eq!(summary.failed_users, vec!["carol"]);
        assert_eq!(summary.users_restored, 1);
        assert_eq!(summary.user_group_memberships_restored, 1);
        assert!(harness.directory.user(TARGET_POOL, "carol").is_none());
        Ok(())
    }

    #[tokio::test]
    async fn membership_failure_is_skipped() -> Result<()> {
        let harness = Harness::new();
        harness.directory.fail_membership("erin", "ops");
        harness.store_snapshot(
            KEY,
            &snapshot_of(
                vec![confirmed_user("erin", "old-e").with_groups(["ops", "staff", "ghost"])],
                vec![Group::new("ops"), Group::new("staff")],
            ),
        );

        let summary = run(&harness, &RestoreOptions::default()).await?;

        assert_eq!(summary.users_restored, 1);
        assert_eq!(summary.user_group_memberships_restored, 1);
        assert!(summary.failed_users.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn missing_target_pool_is_a_distinct_error() {
        let harness = Harness::new();
        harness.store_snapshot(
            KEY,
            &snapshot_of(
                vec![confirmed_user("alice", "old-a").with_groups(["admins"])],
                vec![Group::new("admins")],
            ),
        );
        harness.table.seed(Item::new("u#old-a", "profile"));
        harness.table.seed(Item::new("u#old-a", "u#old-a"));

        let result =
            restore(&harness.clients(), &RestoreOptions::default(), KEY, "eu-west-2_gone").await;

        let err = match result {
            Ok(summary) => panic!("restore into a missing pool succeeded: {summary:?}"),
            Err(err) => err,
        };
        assert_eq!(
            err.downcast_ref::<RestoreError>(),
            Some(&RestoreError::PoolNotFound { pool_id: "eu-west-2_gone".to_string() })
        );
        assert_eq!(err.to_string(), "User pool eu-west-2_gone does not exist");
        assert_eq!(harness.directory.mutation_count(), 0);
        assert_eq!(harness.table.write_count(), 0);
        assert_eq!(harness.table.items_in("u#old-a").len(), 2);
        assert!(harness.directory.group("eu-west-2_gone", "admins").is_none());
    }

    #[tokio::test]
    async fn other_pool_lookup_errors_propagate_unchanged() {
        let harness = Harness::new();
        harness.directory.fail_describe();
        harness.store_snapshot(KEY, &snapshot_of(Vec::new(), vec![Group::new("admins")]));

        let err = match run(&harness, &RestoreOptions::default()).await {
            Ok(summary) => panic!("restore succeeded without a pool check: {summary:?}"),
            Err(err) => err,
        };
        assert!(err.downcast_ref::<RestoreError>().is_none());
        assert!(format!("{err:#}").starts_with("failed to verify user pool eu-west-2_target"));
        assert_eq!(harness.directory.mutation_count(), 0);
    }

    #[tokio::test]
    async fn missing_snapshot_aborts_before_any_write() {
        let harness = Harness::new();
        let result = run(&harness, &RestoreOptions::default()).await;

        assert!(result.is_err());
        assert_eq!(harness.directory.mutation_count(), 0);
    }

    #[tokio::test]
    async fn without_table_reconciliation_reports_zero() -> Result<()> {
        let harness = Harness::new();
        harness.table.seed(Item::new("u#old-a", "profile"));
        harness
            .store_snapshot(KEY, &snapshot_of(vec![confirmed_user("alice", "old-a")], Vec::new()));

        let summary =
            restore(&harness.clients_without_table(), &RestoreOptions::default(), KEY, TARGET_POOL)
                .await?;

        assert_eq!(summary.users_restored, 1);
        assert_eq!(summary.dynamodb_records_updated, 0);
        assert!(summary.dynamodb_failed_updates.is_empty());
        assert!(harness.table.get(&ItemKey::new("u#old-a", "profile")).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn temporary_password_policy_confirms_only_confirmed_users() -> Result<()> {
        let harness = Harness::new();
        harness.store_snapshot(
            KEY,
            &snapshot_of(
                vec![
                    confirmed_user("frank", "old-f"),
                    confirmed_user("gina", "old-g").with_status(UserStatus::ForceChangePassword),
                ],
                Vec::new(),
            ),
        );
        let options = RestoreOptions {
            credential_policy: CredentialPolicy::TemporaryPassword("Temp0rary!Pass".to_string()),
        };

        let summary = run(&harness, &options).await?;

        assert_eq!(summary.users_restored, 2);
        assert_eq!(
            harness.directory.password_history(TARGET_POOL, "frank"),
            vec![("Temp0rary!Pass".to_string(), false), ("Temp0rary!Pass".to_string(), true)]
        );
        assert_eq!(
            harness.directory.password_history(TARGET_POOL, "gina"),
            vec![("Temp0rary!Pass".to_string(), false)]
        );
        assert_eq!(
            harness.directory.user(TARGET_POOL, "frank").and_then(|user| user.status),
            Some(UserStatus::Confirmed)
        );
        assert_eq!(summary.dynamodb_skipped_updates, 0);
        Ok(())
    }

    #[tokio::test]
    async fn failed_permanent_password_marks_user_failed() -> Result<()> {
        let harness = Harness::new();
        harness.directory.fail_password_set("frank");
        harness.table.seed(Item::new("u#old-f", "profile"));
        harness.store_snapshot(
            KEY,
            &snapshot_of(
                vec![
                    confirmed_user("frank", "old-f").with_groups(["admins"]),
                    confirmed_user("gina", "old-g").with_groups(["admins"]),
                ],
                vec![Group::new("admins")],
            ),
        );
        let options = RestoreOptions {
            credential_policy: CredentialPolicy::TemporaryPassword("Temp0rary!Pass".to_string()),
        };

        let summary = run(&harness, &options).await?;

        assert_eq!(summary.failed_users, vec!["frank"]);
        assert_eq!(summary.users_restored, 1);
        assert_eq!(summary.user_group_memberships_restored, 1);
        assert_eq!(summary.dynamodb_records_updated, 0);
        let frank = harness
            .directory
            .user(TARGET_POOL, "frank")
            .unwrap_or_else(|| panic!("frank was not created"));
        assert!(frank.groups.is_empty());
        assert_eq!(frank.status, Some(UserStatus::ForceChangePassword));
        assert!(harness.table.get(&ItemKey::new("u#old-f", "profile")).is_some());
        Ok(())
    }

    #[test]
    fn credential_policy_debug_hides_password() {
        let policy = CredentialPolicy::TemporaryPassword("hunter2".to_string());
        assert!(!format!("{policy:?}").contains("hunter2"));
    }

    #[test]
    fn summary_uses_invocation_field_names() -> Result<()> {
        let summary = RestoreSummary {
            status: "success".to_string(),
            user_pool_id: TARGET_POOL.to_string(),
            users_restored: 1,
            groups_restored: 2,
            user_group_memberships_restored: 3,
            failed_users: Vec::new(),
            dynamodb_records_updated: 4,
            dynamodb_failed_updates: Vec::new(),
            dynamodb_skipped_updates: 5,
            backup_timestamp: "2024-03-05T10:20:30Z".to_string(),
        };
        let value = serde_json::to_value(&summary)?;
        assert_eq!(value["user_group_memberships_restored"], 3);
        assert_eq!(value["backup_timestamp"], "2024-03-05T10:20:30Z");
        assert_eq!(value["dynamodb_skipped_updates"], 5);
        Ok(())
    }
}
