//! AWS-backed implementations of the `pool-migrate-core` client traits.
//!
//! Cognito user pools serve as the [`Directory`], S3 as the [`ObjectStore`]
//! and DynamoDB as the [`KeyValueTable`]. Service errors are classified into
//! [`ErrorKind`] here so callers never inspect SDK error text.
//!
//! [`Directory`]: pool_migrate_core::Directory
//! [`ObjectStore`]: pool_migrate_core::ObjectStore
//! [`KeyValueTable`]: pool_migrate_core::KeyValueTable

use std::sync::Arc;

use aws_config::BehaviorVersion;
use aws_sdk_cognitoidentityprovider::config::Region;
use aws_sdk_cognitoidentityprovider::error::DisplayErrorContext;
use pool_migrate_core::{BackendError, Clients, Config, ErrorKind, KeyValueTable};

mod cognito;
mod dynamo;
mod s3;

pub use cognito::CognitoDirectory;
pub use dynamo::{DynamoTable, PARTITION_KEY_ATTRIBUTE, SORT_KEY_ATTRIBUTE};
pub use s3::S3ObjectStore;

/// Build every client handle from `config`.
///
/// Credentials come from the default provider chain. When an endpoint
/// override is configured all three services use it, and S3 switches to
/// path-style addressing so local emulators resolve the bucket.
pub async fn connect(config: &Config) -> Clients {
    let mut loader =
        aws_config::defaults(BehaviorVersion::latest()).region(Region::new(config.region.clone()));
    if let Some(endpoint) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let shared = loader.load().await;

    let s3_config = aws_sdk_s3::config::Builder::from(&shared)
        .force_path_style(config.endpoint_url.is_some())
        .build();

    let directory = CognitoDirectory::new(aws_sdk_cognitoidentityprovider::Client::new(&shared));
    let objects =
        S3ObjectStore::new(aws_sdk_s3::Client::from_conf(s3_config), config.backup_bucket.clone());
    let table = config.dynamodb_table.as_ref().map(|table_name| {
        Arc::new(DynamoTable::new(aws_sdk_dynamodb::Client::new(&shared), table_name.clone()))
            as Arc<dyn KeyValueTable>
    });

    tracing::debug!(
        region = %config.region,
        bucket = %config.backup_bucket,
        table = ?config.dynamodb_table,
        endpoint = ?config.endpoint_url,
        "aws clients configured"
    );

    Clients { directory: Arc::new(directory), objects: Arc::new(objects), table }
}

pub(crate) fn sdk_error<E>(err: &E, kind: ErrorKind) -> BackendError
where
    E: std::error::Error,
{
    BackendError::new(kind, DisplayErrorContext(err).to_string())
}
