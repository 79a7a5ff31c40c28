//! Client configuration

use crate::error::{NimbusError, NimbusResult};
use crate::limits;
use serde::{Deserialize, Serialize};

/// Maximum number of parallel part uploads the client will allow
pub const MAX_PARALLEL_UPLOADS: usize = 16;

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// AWS region (e.g., "us-east-1")
    pub region: Option<String>,

    /// Custom endpoint URL (for S3-compatible services like MinIO)
    pub endpoint: Option<String>,

    /// Access key ID (optional - uses credential chain if not provided)
    pub access_key: Option<String>,

    /// Secret access key (optional - uses credential chain if not provided)
    pub secret_key: Option<String>,

    /// Session token (for temporary credentials)
    pub session_token: Option<String>,

    /// Path-style addressing (required for some S3-compatible services)
    pub force_path_style: bool,

    /// Part size for multipart uploads in bytes (0 = chosen per object)
    pub part_size: u64,

    /// Use the historical part-size formula instead of the current one.
    ///
    /// Required when resuming uploads whose geometry was issued under the
    /// old default, where the part size divides the maximum object size by
    /// one less than the maximum part count.
    pub legacy_part_sizing: bool,

    /// Number of parallel part uploads (0 = one less than the CPU count)
    pub parallel_uploads: usize,

    /// Objects at or above this size go through multipart upload
    pub multipart_threshold: u64,

    /// Request timeout in seconds
    pub timeout_seconds: u64,

    /// Maximum retry attempts for a resumable upload (0 = no retries)
    pub max_retries: u32,

    /// Default Content-Type for uploads (None = guessed from the key)
    pub content_type: Option<String>,
}

impl ClientConfig {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self {
            region: None,
            endpoint: None,
            access_key: None,
            secret_key: None,
            session_token: None,
            force_path_style: false,
            part_size: 0,
            legacy_part_sizing: false,
            parallel_uploads: 0,
            multipart_threshold: limits::MIN_PART_SIZE,
            timeout_seconds: 300,
            max_retries: 3,
            content_type: None,
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> NimbusResult<()> {
        if self.part_size != 0
            && !(limits::MIN_PART_SIZE..=limits::MAX_PART_SIZE).contains(&self.part_size)
        {
            return Err(NimbusError::InvalidPartSize {
                size: self.part_size,
                min: limits::MIN_PART_SIZE,
                max: limits::MAX_PART_SIZE,
            });
        }

        if self.parallel_uploads > MAX_PARALLEL_UPLOADS {
            return Err(NimbusError::InvalidConfig(format!(
                "parallel uploads {} exceeds maximum {}",
                self.parallel_uploads, MAX_PARALLEL_UPLOADS
            )));
        }

        if self.multipart_threshold > limits::MAX_SINGLE_PUT_SIZE {
            return Err(NimbusError::InvalidConfig(format!(
                "multipart threshold {} exceeds the single-PUT limit {}",
                self.multipart_threshold,
                limits::MAX_SINGLE_PUT_SIZE
            )));
        }

        if self.access_key.is_some() != self.secret_key.is_some() {
            return Err(NimbusError::InvalidConfig(
                "both access_key and secret_key must be provided together".to_string(),
            ));
        }

        Ok(())
    }

    /// Check if using a custom endpoint (S3-compatible service)
    pub fn is_custom_endpoint(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Check if using explicit credentials
    pub fn has_explicit_credentials(&self) -> bool {
        self.access_key.is_some() && self.secret_key.is_some()
    }

    /// Effective worker-pool size for part uploads.
    ///
    /// Defaults to one less than the detected CPU count, never below one.
    pub fn effective_parallel_uploads(&self) -> usize {
        if self.parallel_uploads > 0 {
            return self.parallel_uploads;
        }
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        cpus.saturating_sub(1).max(1)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for ClientConfig
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self {
            config: ClientConfig::new(),
        }
    }

    /// Set the AWS region
    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.config.region = Some(region.into());
        self
    }

    /// Set custom endpoint (for MinIO, LocalStack, etc.)
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = Some(endpoint.into());
        self
    }

    /// Set credentials explicitly
    pub fn credentials(
        mut self,
        access_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        self.config.access_key = Some(access_key.into());
        self.config.secret_key = Some(secret_key.into());
        self
    }

    /// Set session token (for temporary credentials)
    pub fn session_token(mut self, token: impl Into<String>) -> Self {
        self.config.session_token = Some(token.into());
        self
    }

    /// Enable path-style addressing
    pub fn force_path_style(mut self, force: bool) -> Self {
        self.config.force_path_style = force;
        self
    }

    /// Set part size for multipart uploads
    pub fn part_size(mut self, size: u64) -> Self {
        self.config.part_size = size;
        self
    }

    /// Select the historical part-size formula
    pub fn legacy_part_sizing(mut self, legacy: bool) -> Self {
        self.config.legacy_part_sizing = legacy;
        self
    }

    /// Set number of parallel part uploads
    pub fn parallel_uploads(mut self, count: usize) -> Self {
        self.config.parallel_uploads = count;
        self
    }

    /// Set the size at which uploads switch to multipart
    pub fn multipart_threshold(mut self, threshold: u64) -> Self {
        self.config.multipart_threshold = threshold;
        self
    }

    /// Set request timeout
    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.config.timeout_seconds = seconds;
        self
    }

    /// Set maximum retry attempts for resumable uploads
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set default Content-Type for uploads
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.config.content_type = Some(content_type.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> NimbusResult<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ClientConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
