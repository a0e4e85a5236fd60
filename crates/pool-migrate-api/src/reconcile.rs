//! Moves key-value rows owned by a re-created user to that user's new
//! partition key.

use pool_migrate_core::{partition_key_for, IdentifierRemap, Item, KeyValueTable};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailedUpdate {
    pub username: String,
    pub old_sub: String,
    /// Sort key of the row that failed; absent when the partition query failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sk: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileStats {
    pub records_updated: usize,
    pub failed_updates: Vec<FailedUpdate>,
    pub skipped_updates: usize,
}

/// Rewrite a sort key that embeds the old partition key.
///
/// `u#<old>` and `u#<old>#...` get the new identifier; anything else,
/// including keys that merely share a prefix such as `u#<old>x`, is kept.
#[must_use]
pub fn remap_sort_key(sort_key: &str, old_sub: &str, new_sub: &str) -> String {
    let old_prefix = partition_key_for(old_sub);
    match sort_key.strip_prefix(old_prefix.as_str()) {
        Some(rest) if rest.is_empty() || rest.starts_with('#') => {
            format!("{}{rest}", partition_key_for(new_sub))
        }
        _ => sort_key.to_string(),
    }
}

/// Copy of `item` keyed under the remap's new identifier.
#[must_use]
pub fn remap_item(item: &Item, remap: &IdentifierRemap) -> Item {
    Item {
        partition_key: partition_key_for(&remap.new_sub),
        sort_key: remap_sort_key(&item.sort_key, &remap.old_sub, &remap.new_sub),
        attributes: item.attributes.clone(),
    }
}

/// Apply every remap independently. Failures are collected, never raised.
pub async fn reconcile(table: &dyn KeyValueTable, remaps: &[IdentifierRemap]) -> ReconcileStats {
    let mut stats = ReconcileStats::default();

    for remap in remaps {
        let username = remap.username.as_str();
        if remap.is_noop() {
            tracing::info!(
                "Skipping DynamoDB update for user {username}: old_sub {} equals new_sub {}",
                remap.old_sub,
                remap.new_sub
            );
            stats.skipped_updates += 1;
            continue;
        }

        let old_pk = partition_key_for(&remap.old_sub);
        let rows = match table.query_partition(&old_pk).await {
            Ok(rows) => rows,
            Err(err) => {
                tracing::warn!("Failed to query DynamoDB for user {username} (PK {old_pk}): {err}");
                stats.failed_updates.push(FailedUpdate {
                    username: remap.username.clone(),
                    old_sub: remap.old_sub.clone(),
                    sk: None,
                    error: err.to_string(),
                });
                continue;
            }
        };

        if rows.is_empty() {
            tracing::info!("No DynamoDB records found for user {username} with PK {old_pk}");
            continue;
        }

        for row in rows {
            let moved = remap_item(&row, remap);
            match table.replace_item(&row.key(), &moved).await {
                Ok(()) => {
                    stats.records_updated += 1;
                    tracing::info!(
                        "Updated DynamoDB record for user {username}: PK {old_pk} -> {}, SK {} -> {}",
                        moved.partition_key,
                        row.sort_key,
                        moved.sort_key
                    );
                }
                Err(err) => {
                    tracing::warn!(
                        "Failed to update DynamoDB record for user {username} (PK {old_pk} -> {}, SK {}): {err}",
                        moved.partition_key,
                        row.sort_key
                    );
                    stats.failed_updates.push(FailedUpdate {
                        username: remap.username.clone(),
                        old_sub: remap.old_sub.clone(),
                        sk: Some(row.sort_key.clone()),
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pool_migrate_core::memory::InMemoryTable;
    use pool_migrate_core::{BackendError, ItemKey, ItemValue};

    /// Table that relies on the trait's delete-then-put `replace_item`.
    struct PlainTable(InMemoryTable);

    #[async_trait]
    impl KeyValueTable for PlainTable {
        async fn query_partition(&self, partition_key: &str) -> Result<Vec<Item>, BackendError> {
            self.0.query_partition(partition_key).await
        }

        async fn put_item(&self, item: &Item) -> Result<(), BackendError> {
            self.0.put_item(item).await
        }

        async fn delete_item(&self, key: &ItemKey) -> Result<(), BackendError> {
            self.0.delete_item(key).await
        }
    }

    #[test]
    fn sort_key_rewrites_only_the_owned_prefix() {
        assert_eq!(remap_sort_key("u#old", "old", "new"), "u#new");
        assert_eq!(remap_sort_key("u#old#settings", "old", "new"), "u#new#settings");
        assert_eq!(remap_sort_key("u#older", "old", "new"), "u#older");
        assert_eq!(remap_sort_key("u#someone-else", "old", "new"), "u#someone-else");
        assert_eq!(remap_sort_key("profile", "old", "new"), "profile");
    }

    #[tokio::test]
    async fn rows_move_to_new_partition_with_attributes_intact() {
        let table = InMemoryTable::new(true);
        table.seed(
            Item::new("u#old", "profile").with_attribute("name", ItemValue::S("Alice".into())),
        );
        table.seed(Item::new("u#old", "u#old"));
        table.seed(Item::new("u#other", "profile"));

        let stats = reconcile(&table, &[IdentifierRemap::new("alice", "old", "new")]).await;

        assert_eq!(stats.records_updated, 2);
        assert!(stats.failed_updates.is_empty());
        assert!(table.items_in("u#old").is_empty());
        let moved = table
            .get(&ItemKey::new("u#new", "profile"))
            .unwrap_or_else(|| panic!("profile row was not moved"));
        assert_eq!(moved.attributes.get("name"), Some(&ItemValue::S("Alice".into())));
        assert!(table.get(&ItemKey::new("u#new", "u#new")).is_some());
        assert!(table.get(&ItemKey::new("u#other", "profile")).is_some());
    }

    #[tokio::test]
    async fn identical_identifiers_are_skipped_without_writes() {
        let table = InMemoryTable::new(true);
        table.seed(Item::new("u#same", "profile"));

        let stats = reconcile(&table, &[IdentifierRemap::new("alice", "same", "same")]).await;

        assert_eq!(stats.skipped_updates, 1);
        assert_eq!(stats.records_updated, 0);
        assert_eq!(table.write_count(), 0);
    }

    #[tokio::test]
    async fn users_without_rows_create_nothing() {
        let table = InMemoryTable::new(true);
        let stats = reconcile(&table, &[IdentifierRemap::new("alice", "old", "new")]).await;

        assert_eq!(stats, ReconcileStats::default());
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn query_failure_is_recorded_and_batch_continues() {
        let table = InMemoryTable::new(true);
        table.seed(Item::new("u#b-old", "profile"));
        table.fail_query("u#a-old");

        let stats = reconcile(
            &table,
            &[
                IdentifierRemap::new("a", "a-old", "a-new"),
                IdentifierRemap::new("b", "b-old", "b-new"),
            ],
        )
        .await;

        assert_eq!(stats.records_updated, 1);
        assert_eq!(stats.failed_updates.len(), 1);
        let failure = &stats.failed_updates[0];
        assert_eq!((failure.username.as_str(), failure.old_sub.as_str()), ("a", "a-old"));
        assert_eq!(failure.sk, None);
        assert!(table.get(&ItemKey::new("u#b-new", "profile")).is_some());
    }

    #[tokio::test]
    async fn write_failure_keeps_row_when_store_is_transactional() {
        let table = InMemoryTable::new(true);
        table.seed(Item::new("u#old", "profile"));
        table.fail_puts_to("u#new");

        let stats = reconcile(&table, &[IdentifierRemap::new("alice", "old", "new")]).await;

        assert_eq!(stats.records_updated, 0);
        assert_eq!(stats.failed_updates[0].sk.as_deref(), Some("profile"));
        assert!(table.get(&ItemKey::new("u#old", "profile")).is_some());
    }

    #[tokio::test]
    async fn rows_move_through_non_transactional_replace() {
        let table = InMemoryTable::new(false);
        table.seed(Item::new("u#old", "profile"));
        table.seed(Item::new("u#old", "u#old#settings"));

        let stats = reconcile(&table, &[IdentifierRemap::new("alice", "old", "new")]).await;

        assert_eq!(stats.records_updated, 2);
        assert!(stats.failed_updates.is_empty());
        assert!(table.items_in("u#old").is_empty());
        assert!(table.get(&ItemKey::new("u#new", "profile")).is_some());
        assert!(table.get(&ItemKey::new("u#new", "u#new#settings")).is_some());
        assert_eq!(table.write_count(), 4);
    }

    #[tokio::test]
    async fn rows_move_through_default_replace() {
        let table = PlainTable(InMemoryTable::new(true));
        table.0.seed(Item::new("u#old", "profile").with_attribute("n", ItemValue::N("7".into())));

        let stats = reconcile(&table, &[IdentifierRemap::new("alice", "old", "new")]).await;

        assert_eq!(stats.records_updated, 1);
        assert!(table.0.items_in("u#old").is_empty());
        let moved = table
            .0
            .get(&ItemKey::new("u#new", "profile"))
            .unwrap_or_else(|| panic!("profile row was not moved"));
        assert_eq!(moved.attributes.get("n"), Some(&ItemValue::N("7".into())));
    }

    #[tokio::test]
    async fn default_replace_write_failure_is_reported_after_delete() {
        let table = PlainTable(InMemoryTable::new(true));
        table.0.seed(Item::new("u#old", "profile"));
        table.0.seed(Item::new("u#old", "u#old"));
        table.0.fail_puts_to("u#new");

        let stats = reconcile(&table, &[IdentifierRemap::new("alice", "old", "new")]).await;

        assert_eq!(stats.records_updated, 0);
        let mut failed: Vec<_> =
            stats.failed_updates.iter().filter_map(|failure| failure.sk.as_deref()).collect();
        failed.sort_unstable();
        assert_eq!(failed, vec!["profile", "u#old"]);
        assert!(stats.failed_updates.iter().all(|failure| failure.username == "alice"));
        assert!(table.0.is_empty());
    }

    #[tokio::test]
    async fn non_transactional_write_failure_is_reported_after_delete() {
        let table = InMemoryTable::new(false);
        table.seed(Item::new("u#old", "profile"));
        table.fail_puts_to("u#new");

        let stats = reconcile(&table, &[IdentifierRemap::new("alice", "old", "new")]).await;

        assert_eq!(stats.records_updated, 0);
        assert_eq!(stats.failed_updates.len(), 1);
        assert_eq!(stats.failed_updates[0].sk.as_deref(), Some("profile"));
        assert!(table.is_empty());
    }

    #[test]
    fn failed_update_omits_sort_key_when_absent() {
        let failure = FailedUpdate {
            username: "a".to_string(),
            old_sub: "s".to_string(),
            sk: None,
            error: "boom".to_string(),
        };
        let value = serde_json::to_value(&failure)
            .unwrap_or_else(|err| panic!("failed update must serialize: {err}"));
        assert!(value.get("sk").is_none());
        assert_eq!(value["error"], "boom");
    }
}
