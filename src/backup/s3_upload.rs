// sitebackup/src/backup/s3_upload.rs
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::config::http::HttpResponse;
use s3::error::{DisplayErrorContext, SdkError};
use s3::primitives::ByteStream;
use s3::types::{BucketLocationConstraint, CreateBucketConfiguration, ObjectCannedAcl};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::SpacesConfig;
use crate::errors::StoreError;

/// Content type every chunk is stored with.
pub const CHUNK_CONTENT_TYPE: &str = "application/x-compressed";

/// Outcome of a HEAD on one object. "Not found" is an ordinary answer here.
#[derive(Debug)]
pub enum ObjectStatus {
    /// `bytes` is the stored length, when the store reports one.
    Present { bytes: Option<u64> },
    Absent,
    Error(StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketStatus {
    Existing,
    Created,
    /// HEAD was denied; the bucket may still accept writes.
    Unverified,
}

/// How a failed HEAD request should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadFailure {
    Missing,
    Denied,
    Other,
}

/// `not_found` is the SDK's typed not-found error; `status` the raw HTTP status.
pub fn head_failure(not_found: bool, status: Option<u16>) -> HeadFailure {
    match status {
        _ if not_found => HeadFailure::Missing,
        Some(404) => HeadFailure::Missing,
        Some(403) => HeadFailure::Denied,
        _ => HeadFailure::Other,
    }
}

/// The operations the upload coordinator needs from an object store.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    /// Creates `bucket` when it does not exist. A denied existence check is
    /// only a warning.
    async fn ensure_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError>;

    async fn probe(&self, bucket: &str, key: &str) -> ObjectStatus;

    /// Uploads the file at `body` as `bucket/key`. No retries.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &Path,
        content_type: &str,
        acl: &str,
    ) -> Result<(), StoreError>;
}

/// [`ObjectStore`] backed by an S3-compatible service (AWS, DigitalOcean Spaces, MinIO, ...).
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: s3::Client,
    region: String,
}

impl S3ObjectStore {
    pub async fn from_config(spaces_config: &SpacesConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(spaces_config.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                spaces_config.access_key_id.expose(),
                spaces_config.secret_access_key.expose(),
                None, // session_token
                None, // expiry
                "Static", // provider_name
            ));
        if let Some(endpoint) = &spaces_config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        S3ObjectStore {
            client: s3::Client::new(&sdk_config),
            region: spaces_config.region.clone(),
        }
    }

    async fn create_bucket(&self, bucket: &str) -> Result<(), StoreError> {
        info!("Bucket {} not found, creating it", bucket);
        let mut request = self.client.create_bucket().bucket(bucket);
        // us-east-1 rejects an explicit location constraint.
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(|e| classify("CreateBucket", bucket.to_string(), e))?;
        info!("✓ Created bucket {}", bucket);
        Ok(())
    }
}

impl ObjectStore for S3ObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError> {
        let err = match self.client.head_bucket().bucket(bucket).send().await {
            Ok(_) => return Ok(BucketStatus::Existing),
            Err(err) => err,
        };

        let not_found = err.as_service_error().is_some_and(|e| e.is_not_found());
        match head_failure(not_found, response_status(&err)) {
            HeadFailure::Missing => {
                self.create_bucket(bucket).await?;
                Ok(BucketStatus::Created)
            }
            HeadFailure::Denied => {
                warn!(
                    "⚠️ Access denied checking bucket {}; assuming it exists and is writable",
                    bucket
                );
                Ok(BucketStatus::Unverified)
            }
            HeadFailure::Other => Err(classify("HeadBucket", bucket.to_string(), err)),
        }
    }

    async fn probe(&self, bucket: &str, key: &str) -> ObjectStatus {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(head) => ObjectStatus::Present {
                bytes: head.content_length().and_then(|len| u64::try_from(len).ok()),
            },
            Err(err) => {
                let not_found = err.as_service_error().is_some_and(|e| e.is_not_found());
                match head_failure(not_found, response_status(&err)) {
                    HeadFailure::Missing => ObjectStatus::Absent,
                    HeadFailure::Denied | HeadFailure::Other => {
                        ObjectStatus::Error(classify("HeadObject", format!("{}/{}", bucket, key), err))
                    }
                }
            }
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &Path,
        content_type: &str,
        acl: &str,
    ) -> Result<(), StoreError> {
        debug!("Uploading {} to s3://{}/{}", body.display(), bucket, key);
        let stream = ByteStream::from_path(body)
            .await
            .map_err(|e| StoreError::Body {
                path: body.to_path_buf(),
                message: e.to_string(),
            })?;

        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(stream)
            .content_type(content_type)
            .acl(ObjectCannedAcl::from(acl))
            .send()
            .await
            .map_err(|e| classify("PutObject", format!("{}/{}", bucket, key), e))?;
        Ok(())
    }
}

fn response_status<E>(err: &SdkError<E, HttpResponse>) -> Option<u16> {
    err.raw_response().map(|response| response.status().as_u16())
}

/// Splits SDK failures into answers from the store and failures to get one.
fn classify<E>(operation: &'static str, target: String, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            StoreError::Transport {
                operation,
                target,
                message,
            }
        }
        _ => StoreError::Service {
            operation,
            target,
            status: response_status(&err),
            message,
        },
    }
}
