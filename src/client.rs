//! S3 client
//!
//! Wraps the AWS SDK client with the crate's configuration and implements
//! the [`MultipartOps`] seam the upload engine is written against. All SDK
//! types stay inside this module; the rest of the crate only sees the
//! crate's own types and errors.

use crate::config::ClientConfig;
use crate::error::{NimbusError, NimbusResult};
use crate::multipart::engine::MultipartOps;
use crate::multipart::partition::PartGeometry;
use crate::multipart::source::{ObjectSource, PartBody, PendingPart};
use crate::multipart::Uploader;
use crate::types::{ObjectInfo, ObjectMetadata, PartPage, UploadSession, UploadedPart};
use async_trait::async_trait;
use aws_config::meta::region::RegionProviderChain;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{ChecksumAlgorithm, CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as AwsS3Client;
use aws_smithy_types::byte_stream::Length;
use bytes::Bytes;
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// Client for AWS S3 and S3-compatible storage
#[derive(Clone)]
pub struct Client {
    /// AWS S3 client
    client: AwsS3Client,

    /// Client configuration
    config: ClientConfig,
}

impl Client {
    /// Create a new client with the given configuration
    ///
    /// # Example
    ///
    /// ```no_run
    /// use nimbus::{Client, ClientConfig};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let client = Client::new(ClientConfig::default()).await?;
    ///     Ok(())
    /// }
    /// ```
    pub async fn new(config: ClientConfig) -> NimbusResult<Self> {
        config.validate()?;
        let client = Self::build_aws_client(&config).await;
        Ok(Self { client, config })
    }

    /// Build the AWS SDK S3 client from configuration
    async fn build_aws_client(config: &ClientConfig) -> AwsS3Client {
        let mut aws_config_loader = aws_config::defaults(BehaviorVersion::latest());

        let region_provider = if let Some(region_str) = &config.region {
            RegionProviderChain::first_try(Region::new(region_str.clone()))
        } else {
            RegionProviderChain::default_provider()
        };
        aws_config_loader = aws_config_loader.region(region_provider);

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            let credentials = Credentials::new(
                access_key,
                secret_key,
                config.session_token.clone(),
                None,
                "nimbus-explicit",
            );
            aws_config_loader = aws_config_loader.credentials_provider(credentials);
        }

        let aws_config = aws_config_loader.load().await;

        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint);
        }

        // Required for MinIO, LocalStack and most self-hosted gateways
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let timeout_config = aws_sdk_s3::config::timeout::TimeoutConfig::builder()
            .operation_timeout(Duration::from_secs(config.timeout_seconds))
            .build();
        s3_config_builder = s3_config_builder.timeout_config(timeout_config);

        AwsS3Client::from_conf(s3_config_builder.build())
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Get a reference to the underlying AWS S3 client
    pub fn aws_client(&self) -> &AwsS3Client {
        &self.client
    }

    /// Content type for a key: configured default first, then a guess
    /// from the key's extension.
    fn content_type_for(&self, key: &str) -> Option<String> {
        self.config.content_type.clone().or_else(|| {
            mime_guess::from_path(key)
                .first()
                .map(|mime| mime.essence_str().to_string())
        })
    }

    /// Upload a source as an object.
    ///
    /// Small objects with a known size below the multipart threshold go
    /// through a single PutObject; everything else goes through the
    /// multipart engine. For file sources, retryable failures are retried
    /// up to the configured attempt count, resuming the open session
    /// instead of starting over.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        source: ObjectSource,
    ) -> NimbusResult<ObjectInfo> {
        let size = source.size().await?;
        let content_type = self.content_type_for(key);

        if let Some(size) = size {
            if size < self.config.multipart_threshold {
                return self.put_object_single(bucket, key, source, size, content_type).await;
            }
        }

        let geometry = PartGeometry::for_source(
            size,
            self.config.part_size,
            self.config.legacy_part_sizing,
        )?;
        let uploader = Uploader::new(self.clone(), self.config.effective_parallel_uploads());

        match source {
            ObjectSource::File { path } => {
                let max_attempts = self.config.max_retries.saturating_add(1);
                let mut attempt = 0u32;
                let mut open_session: Option<UploadSession> = None;
                loop {
                    attempt += 1;
                    let src = ObjectSource::file(&path);
                    let result = match open_session.take() {
                        Some(session) => uploader.resume(session, src, geometry).await,
                        None => {
                            uploader
                                .upload(bucket, key, src, geometry, content_type.as_deref())
                                .await
                        }
                    };
                    match result {
                        Ok(info) => return Ok(info),
                        Err(err) if err.is_retryable() && attempt < max_attempts => {
                            if let Some(upload_id) = err.resumable_upload_id() {
                                open_session = Some(UploadSession {
                                    bucket: bucket.to_string(),
                                    key: key.to_string(),
                                    upload_id: upload_id.to_string(),
                                    content_type: content_type.clone(),
                                });
                            }
                            warn!(
                                attempt,
                                max_attempts,
                                error = %err,
                                resuming = open_session.is_some(),
                                "upload attempt failed, retrying"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
            // A consumed stream cannot be replayed; one attempt only.
            stream => {
                uploader
                    .upload(bucket, key, stream, geometry, content_type.as_deref())
                    .await
            }
        }
    }

    async fn put_object_single(
        &self,
        bucket: &str,
        key: &str,
        source: ObjectSource,
        size: u64,
        content_type: Option<String>,
    ) -> NimbusResult<ObjectInfo> {
        debug!(bucket, key, size, "single-request upload");
        let body = match source {
            ObjectSource::File { path } => ByteStream::from_path(&path)
                .await
                .map_err(|e| NimbusError::Io(e.to_string()))?,
            ObjectSource::Stream { mut reader, .. } => {
                use tokio::io::AsyncReadExt;
                let mut data = Vec::with_capacity(size as usize);
                reader.read_to_end(&mut data).await?;
                ByteStream::from(data)
            }
        };

        let response = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type)
            .content_length(size as i64)
            .body(body)
            .send()
            .await?;

        Ok(ObjectInfo {
            bucket: bucket.to_string(),
            key: key.to_string(),
            etag: response.e_tag().map(|s| s.to_string()),
            size,
            version_id: response.version_id().map(|s| s.to_string()),
        })
    }

    /// Resume a multipart upload left open by an earlier attempt.
    ///
    /// The upload id is the resumption token the caller persisted; the
    /// source must be the same bytes the original attempt was uploading.
    pub async fn resume_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        source: ObjectSource,
    ) -> NimbusResult<ObjectInfo> {
        let size = source.size().await?;
        let geometry = PartGeometry::for_source(
            size,
            self.config.part_size,
            self.config.legacy_part_sizing,
        )?;
        let session = UploadSession {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            content_type: self.content_type_for(key),
        };
        let uploader = Uploader::new(self.clone(), self.config.effective_parallel_uploads());
        uploader.resume(session, source, geometry).await
    }

    /// Abort a multipart upload session, discarding its parts
    pub async fn abort_upload(&self, bucket: &str, key: &str, upload_id: &str) -> NimbusResult<()> {
        let session = UploadSession {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id: upload_id.to_string(),
            content_type: None,
        };
        self.abort_upload_session(&session).await
    }

    async fn abort_upload_session(&self, session: &UploadSession) -> NimbusResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .send()
            .await?;
        info!(
            bucket = %session.bucket,
            key = %session.key,
            upload_id = %session.upload_id,
            "multipart upload aborted"
        );
        Ok(())
    }

    /// Check if an object exists
    pub async fn exists(&self, bucket: &str, key: &str) -> NimbusResult<bool> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                let msg = e.to_string();
                if msg.contains("404") || msg.contains("NotFound") {
                    Ok(false)
                } else {
                    Err(NimbusError::from(e))
                }
            }
        }
    }

    /// Get metadata for an object
    pub async fn head_object(&self, bucket: &str, key: &str) -> NimbusResult<ObjectMetadata> {
        let response = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let msg = e.to_string();
                if msg.contains("404") || msg.contains("NotFound") {
                    NimbusError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    NimbusError::from(e)
                }
            })?;

        Ok(ObjectMetadata {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0) as u64,
            last_modified: response
                .last_modified()
                .and_then(|dt| SystemTime::try_from(*dt).ok()),
            etag: response.e_tag().map(|s| s.to_string()),
            content_type: response.content_type().map(|s| s.to_string()),
        })
    }

    /// Download an object's bytes
    pub async fn get_object(&self, bucket: &str, key: &str) -> NimbusResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        let data = response
            .body
            .collect()
            .await
            .map_err(|e| NimbusError::Io(e.to_string()))?;
        Ok(data.into_bytes())
    }

    /// Delete an object
    pub async fn delete_object(&self, bucket: &str, key: &str) -> NimbusResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MultipartOps for Client {
    async fn create_upload(
        &self,
        bucket: &str,
        key: &str,
        content_type: Option<&str>,
    ) -> NimbusResult<UploadSession> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .set_content_type(content_type.map(|s| s.to_string()))
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .send()
            .await?;

        let upload_id = response
            .upload_id()
            .map(|s| s.to_string())
            .ok_or_else(|| NimbusError::MissingUploadId {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;

        Ok(UploadSession {
            bucket: bucket.to_string(),
            key: key.to_string(),
            upload_id,
            content_type: content_type.map(|s| s.to_string()),
        })
    }

    async fn list_parts_page(
        &self,
        session: &UploadSession,
        marker: Option<String>,
    ) -> NimbusResult<PartPage> {
        let response = self
            .client
            .list_parts()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .set_part_number_marker(marker)
            .send()
            .await?;

        let parts = response
            .parts()
            .iter()
            .map(|part| UploadedPart {
                part_number: part.part_number().unwrap_or(0),
                etag: part.e_tag().unwrap_or_default().to_string(),
                size: part.size().unwrap_or(0) as u64,
                sha256: part.checksum_sha256().map(|s| s.to_string()),
            })
            .collect();

        let next_marker = if response.is_truncated().unwrap_or(false) {
            response.next_part_number_marker().map(|s| s.to_string())
        } else {
            None
        };

        Ok(PartPage { parts, next_marker })
    }

    async fn upload_part(
        &self,
        session: &UploadSession,
        part: &PendingPart,
    ) -> NimbusResult<String> {
        let body = match &part.body {
            PartBody::FileRange {
                path,
                offset,
                length,
            } => ByteStream::read_from()
                .path(path)
                .offset(*offset)
                .length(Length::Exact(*length))
                .build()
                .await
                .map_err(|e| NimbusError::Io(e.to_string()))?,
            PartBody::Spill(spill) => ByteStream::from_path(spill.path())
                .await
                .map_err(|e| NimbusError::Io(e.to_string()))?,
            PartBody::Empty => ByteStream::from_static(&[]),
        };

        let response = self
            .client
            .upload_part()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .part_number(part.part_number)
            .content_length(part.size as i64)
            .checksum_sha256(&part.sha256)
            .body(body)
            .send()
            .await?;

        response
            .e_tag()
            .map(|s| s.to_string())
            .ok_or(NimbusError::MissingEtag {
                part_number: part.part_number,
            })
    }

    async fn complete_upload(
        &self,
        session: &UploadSession,
        manifest: &[UploadedPart],
    ) -> NimbusResult<ObjectInfo> {
        let completed_parts: Vec<CompletedPart> = manifest
            .iter()
            .map(|part| {
                CompletedPart::builder()
                    .part_number(part.part_number)
                    .e_tag(&part.etag)
                    .set_checksum_sha256(part.sha256.clone())
                    .build()
            })
            .collect();

        let response = self
            .client
            .complete_multipart_upload()
            .bucket(&session.bucket)
            .key(&session.key)
            .upload_id(&session.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await?;

        Ok(ObjectInfo {
            bucket: session.bucket.clone(),
            key: session.key.clone(),
            etag: response.e_tag().map(|s| s.to_string()),
            size: manifest.iter().map(|p| p.size).sum(),
            version_id: response.version_id().map(|s| s.to_string()),
        })
    }

    async fn abort_upload(&self, session: &UploadSession) -> NimbusResult<()> {
        self.abort_upload_session(session).await
    }
}
