//! S3 credentials and object-store construction.
//!
//! `S3Config` is shared by the session engines (to register `s3://` buckets
//! with DataFusion/Ballista) and by the S3 data connectors (to list keys).

use std::sync::Arc;

use object_store::aws::{AmazonS3, AmazonS3Builder};
use serde::{Deserialize, Serialize};
use sluice_core::{BatchError, Result};

/// Connection settings for S3-compatible storage.
///
/// Secrets are redacted in `Debug` output.
#[derive(Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Custom endpoint for MinIO / LocalStack.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub allow_http: bool,
}

impl std::fmt::Debug for S3Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Config")
            .field("region", &self.region)
            .field("access_key_id", &"***")
            .field("secret_access_key", &"***")
            .field("endpoint_url", &self.endpoint_url)
            .field("allow_http", &self.allow_http)
            .finish()
    }
}

impl S3Config {
    /// Read AWS_REGION, AWS_ACCESS_KEY_ID, AWS_SECRET_ACCESS_KEY,
    /// AWS_ENDPOINT_URL and AWS_ALLOW_HTTP.
    pub fn from_env() -> Result<Self> {
        let required = |key: &str| {
            std::env::var(key).map_err(|_| BatchError::InvalidConfig(format!("{} not set", key)))
        };
        Ok(Self {
            region: std::env::var("AWS_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
            access_key_id: required("AWS_ACCESS_KEY_ID")?,
            secret_access_key: required("AWS_SECRET_ACCESS_KEY")?,
            endpoint_url: std::env::var("AWS_ENDPOINT_URL").ok(),
            allow_http: std::env::var("AWS_ALLOW_HTTP")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        })
    }

    pub fn build_store(&self, bucket: &str) -> Result<Arc<AmazonS3>> {
        let mut builder = AmazonS3Builder::new()
            .with_region(&self.region)
            .with_bucket_name(bucket)
            .with_access_key_id(&self.access_key_id)
            .with_secret_access_key(&self.secret_access_key);

        if let Some(ref endpoint) = self.endpoint_url {
            builder = builder.with_endpoint(endpoint);
        }
        if self.allow_http {
            builder = builder.with_allow_http(true);
        }

        builder.build().map(Arc::new).map_err(|e| {
            BatchError::InvalidConfig(format!("failed to build S3 object store for '{}': {}", bucket, e))
        })
    }
}
