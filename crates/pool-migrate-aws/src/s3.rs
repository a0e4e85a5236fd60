use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use pool_migrate_core::{BackendError, ErrorKind, ObjectStore};

use crate::sdk_error;

#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    #[must_use]
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<(), BackendError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type("application/json")
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|err| sdk_error(&err, ErrorKind::Other))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Vec<u8>, BackendError> {
        let output =
            self.client.get_object().bucket(&self.bucket).key(key).send().await.map_err(|err| {
                let kind = match err.as_service_error() {
                    Some(GetObjectError::NoSuchKey(_)) => ErrorKind::NotFound,
                    _ => ErrorKind::Other,
                };
                sdk_error(&err, kind)
            })?;

        let body = output.body.collect().await.map_err(|err| {
            BackendError::other(format!("failed to read s3://{}/{key}: {err}", self.bucket))
        })?;
        Ok(body.into_bytes().to_vec())
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }
}
