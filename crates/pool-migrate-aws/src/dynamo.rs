use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use aws_sdk_dynamodb::primitives::Blob;
use aws_sdk_dynamodb::types::{AttributeValue, Delete, Put, TransactWriteItem};
use aws_sdk_dynamodb::Client;
use pool_migrate_core::{BackendError, ErrorKind, Item, ItemKey, ItemValue, KeyValueTable};

use crate::sdk_error;

pub const PARTITION_KEY_ATTRIBUTE: &str = "PK";
pub const SORT_KEY_ATTRIBUTE: &str = "SK";

type RawItem = HashMap<String, AttributeValue>;

/// DynamoDB table keyed by string `PK` / `SK` attributes.
///
/// `replace_item` is a two-action `TransactWriteItems` call, so a rewritten
/// row never disappears between the delete and the put.
#[derive(Debug, Clone)]
pub struct DynamoTable {
    client: Client,
    table_name: String,
}

impl DynamoTable {
    #[must_use]
    pub fn new(client: Client, table_name: String) -> Self {
        Self { client, table_name }
    }
}

pub(crate) fn to_attribute_value(value: &ItemValue) -> AttributeValue {
    match value {
        ItemValue::S(text) => AttributeValue::S(text.clone()),
        ItemValue::N(number) => AttributeValue::N(number.clone()),
        ItemValue::B(bytes) => AttributeValue::B(Blob::new(bytes.clone())),
        ItemValue::Bool(flag) => AttributeValue::Bool(*flag),
        ItemValue::Null => AttributeValue::Null(true),
        ItemValue::L(values) => AttributeValue::L(values.iter().map(to_attribute_value).collect()),
        ItemValue::M(entries) => AttributeValue::M(
            entries.iter().map(|(name, value)| (name.clone(), to_attribute_value(value))).collect(),
        ),
        ItemValue::Ss(values) => AttributeValue::Ss(values.clone()),
        ItemValue::Ns(values) => AttributeValue::Ns(values.clone()),
        ItemValue::Bs(values) => {
            AttributeValue::Bs(values.iter().map(|bytes| Blob::new(bytes.clone())).collect())
        }
    }
}

pub(crate) fn from_attribute_value(value: &AttributeValue) -> Result<ItemValue, BackendError> {
    Ok(match value {
        AttributeValue::S(text) => ItemValue::S(text.clone()),
        AttributeValue::N(number) => ItemValue::N(number.clone()),
        AttributeValue::B(blob) => ItemValue::B(blob.as_ref().to_vec()),
        AttributeValue::Bool(flag) => ItemValue::Bool(*flag),
        AttributeValue::Null(_) => ItemValue::Null,
        AttributeValue::L(values) => {
            ItemValue::L(values.iter().map(from_attribute_value).collect::<Result<_, _>>()?)
        }
        AttributeValue::M(entries) => ItemValue::M(
            entries
                .iter()
                .map(|(name, value)| Ok((name.clone(), from_attribute_value(value)?)))
                .collect::<Result<BTreeMap<_, _>, BackendError>>()?,
        ),
        AttributeValue::Ss(values) => ItemValue::Ss(values.clone()),
        AttributeValue::Ns(values) => ItemValue::Ns(values.clone()),
        AttributeValue::Bs(values) => {
            ItemValue::Bs(values.iter().map(|blob| blob.as_ref().to_vec()).collect())
        }
        _ => return Err(BackendError::other("unsupported DynamoDB attribute value type")),
    })
}

fn string_key(raw: &RawItem, name: &str) -> Result<String, BackendError> {
    match raw.get(name) {
        Some(AttributeValue::S(value)) => Ok(value.clone()),
        Some(_) => Err(BackendError::other(format!("key attribute {name} is not a string"))),
        None => Err(BackendError::other(format!("item is missing key attribute {name}"))),
    }
}

pub(crate) fn item_from_raw(raw: &RawItem) -> Result<Item, BackendError> {
    let mut item = Item::new(
        string_key(raw, PARTITION_KEY_ATTRIBUTE)?,
        string_key(raw, SORT_KEY_ATTRIBUTE)?,
    );
    for (name, value) in raw {
        if name == PARTITION_KEY_ATTRIBUTE || name == SORT_KEY_ATTRIBUTE {
            continue;
        }
        item.attributes.insert(name.clone(), from_attribute_value(value)?);
    }
    Ok(item)
}

pub(crate) fn key_to_raw(key: &ItemKey) -> RawItem {
    HashMap::from([
        (PARTITION_KEY_ATTRIBUTE.to_string(), AttributeValue::S(key.partition_key.clone())),
        (SORT_KEY_ATTRIBUTE.to_string(), AttributeValue::S(key.sort_key.clone())),
    ])
}

pub(crate) fn item_to_raw(item: &Item) -> RawItem {
    let mut raw = key_to_raw(&item.key());
    raw.extend(
        item.attributes.iter().map(|(name, value)| (name.clone(), to_attribute_value(value))),
    );
    raw
}

#[async_trait]
impl KeyValueTable for DynamoTable {
    async fn query_partition(&self, partition_key: &str) -> Result<Vec<Item>, BackendError> {
        let mut items = Vec::new();
        let mut start_key: Option<RawItem> = None;
        loop {
            let output = self
                .client
                .query()
                .table_name(&self.table_name)
                .key_condition_expression("#pk = :pk")
                .expression_attribute_names("#pk", PARTITION_KEY_ATTRIBUTE)
                .expression_attribute_values(":pk", AttributeValue::S(partition_key.to_string()))
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(|err| sdk_error(&err, ErrorKind::Other))?;

            for raw in output.items() {
                items.push(item_from_raw(raw)?);
            }
            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }
        Ok(items)
    }

    async fn put_item(&self, item: &Item) -> Result<(), BackendError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(item_to_raw(item)))
            .send()
            .await
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
        Ok(())
    }

    async fn delete_item(&self, key: &ItemKey) -> Result<(), BackendError> {
        self.client
            .delete_item()
            .table_name(&self.table_name)
            .set_key(Some(key_to_raw(key)))
            .send()
            .await
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
        Ok(())
    }

    async fn replace_item(&self, old: &ItemKey, new: &Item) -> Result<(), BackendError> {
        let put = Put::builder()
            .table_name(&self.table_name)
            .set_item(Some(item_to_raw(new)))
            .build()
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
        let delete = Delete::builder()
            .table_name(&self.table_name)
            .set_key(Some(key_to_raw(old)))
            .build()
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;

        self.client
            .transact_write_items()
            .transact_items(TransactWriteItem::builder().put(put).build())
            .transact_items(TransactWriteItem::builder().delete(delete).build())
            .send()
            .await
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
        Ok(())
    }
}
