//! Blob store client used to move binaries into the cluster.
//!
//! [`BlobStore`] is the narrow put/get surface the orchestrator needs.
//! [`S3BlobStore`] speaks the S3 protocol to the in-cluster MinIO pod.

use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::BlobError;

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the bucket if missing and open it for anonymous reads.
    async fn ensure_bucket(&self) -> Result<(), BlobError>;
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError>;
    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError>;
}

/// Builds a [`BlobStore`] for a forwarded endpoint.
#[async_trait]
pub trait BlobConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BlobStore>, BlobError>;
}

/// S3 client against one bucket.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(endpoint: &str, access_key: &str, secret_key: &str, bucket: &str) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Self {
            client: Client::from_conf(config),
            bucket: bucket.to_string(),
        }
    }

    fn read_policy(&self) -> String {
        serde_json::json!({
            "Version": "2012-10-17",
            "Statement": [{
                "Effect": "Allow",
                "Principal": {"AWS": ["*"]},
                "Action": ["s3:GetObject"],
                "Resource": [format!("arn:aws:s3:::{}/*", self.bucket)],
            }],
        })
        .to_string()
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn ensure_bucket(&self) -> Result<(), BlobError> {
        if let Err(err) = self.client.create_bucket().bucket(&self.bucket).send().await {
            let exists = err.as_service_error().is_some_and(|e| {
                e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
            });
            if !exists {
                return Err(BlobError::Connect(DisplayErrorContext(&err).to_string()));
            }
            debug!(bucket = %self.bucket, "bucket already exists");
        }

        self.client
            .put_bucket_policy()
            .bucket(&self.bucket)
            .policy(self.read_policy())
            .send()
            .await
            .map_err(|err| BlobError::Connect(DisplayErrorContext(&err).to_string()))?;
        info!(bucket = %self.bucket, "bucket ready");
        Ok(())
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BlobError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|err| BlobError::Put {
                key: key.to_string(),
                message: DisplayErrorContext(&err).to_string(),
            })?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, BlobError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(BlobError::NotFound(key.to_string()))
            }
            Err(err) => {
                return Err(BlobError::Get {
                    key: key.to_string(),
                    message: DisplayErrorContext(&err).to_string(),
                })
            }
        };
        let data = response.body.collect().await.map_err(|err| BlobError::Get {
            key: key.to_string(),
            message: err.to_string(),
        })?;
        Ok(data.into_bytes().to_vec())
    }
}

/// Connects [`S3BlobStore`]s with fixed credentials.
#[derive(Debug, Clone)]
pub struct S3BlobConnector {
    access_key: String,
    secret_key: String,
    bucket: String,
}

impl S3BlobConnector {
    pub fn new(access_key: &str, secret_key: &str, bucket: &str) -> Self {
        Self {
            access_key: access_key.to_string(),
            secret_key: secret_key.to_string(),
            bucket: bucket.to_string(),
        }
    }
}

#[async_trait]
impl BlobConnector for S3BlobConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BlobStore>, BlobError> {
        debug!(endpoint = %endpoint, bucket = %self.bucket, "connecting to blob store");
        Ok(Arc::new(S3BlobStore::new(
            endpoint,
            &self.access_key,
            &self.secret_key,
            &self.bucket,
        )))
    }
}
