//! Object listing for file-backed connectors.

use std::path::PathBuf;
use std::sync::Arc;

use futures::TryStreamExt;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use sluice_core::{BatchError, ReaderMethod, ReaderOptions, Result, SpecTarget};
use sluice_engine::S3Config;
use tracing::debug;

/// A directory tree or bucket prefix whose objects are partition files.
#[derive(Debug, Clone)]
pub enum FileLocation {
    Local {
        base_directory: PathBuf,
    },
    S3 {
        bucket: String,
        prefix: String,
        config: S3Config,
    },
}

impl FileLocation {
    pub fn local(base_directory: impl Into<PathBuf>) -> Self {
        FileLocation::Local {
            base_directory: base_directory.into(),
        }
    }

    pub fn s3(bucket: impl Into<String>, prefix: impl Into<String>, config: S3Config) -> Self {
        FileLocation::S3 {
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            config,
        }
    }

    fn store(&self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            FileLocation::Local { base_directory } => {
                let store = LocalFileSystem::new_with_prefix(base_directory).map_err(|e| {
                    BatchError::InvalidConfig(format!(
                        "base directory '{}' is not usable: {}",
                        base_directory.display(),
                        e
                    ))
                })?;
                Ok(Arc::new(store))
            }
            FileLocation::S3 { bucket, config, .. } => {
                let store: Arc<dyn ObjectStore> = config.build_store(bucket)?;
                Ok(store)
            }
        }
    }

    /// Every object key under the location, relative to it, sorted.
    pub async fn list(&self, connector: &str) -> Result<Vec<String>> {
        let store = self.store()?;
        let prefix = match self {
            FileLocation::S3 { prefix, .. } if !prefix.is_empty() => {
                Some(ObjectPath::from(prefix.as_str()))
            }
            _ => None,
        };
        let objects: Vec<_> = store
            .list(prefix.as_ref())
            .try_collect()
            .await
            .map_err(|e| BatchError::discovery(connector, e))?;

        let strip = prefix.as_ref().map(|p| format!("{}/", p));
        let mut keys: Vec<String> = objects
            .into_iter()
            .map(|meta| {
                let key = meta.location.to_string();
                match &strip {
                    Some(strip) => key.strip_prefix(strip.as_str()).unwrap_or(&key).to_string(),
                    None => key,
                }
            })
            .collect();
        keys.sort();
        debug!(connector = %connector, objects = keys.len(), "Listed partition objects");
        Ok(keys)
    }

    /// Fetch target for an object key returned by `list`.
    pub fn target(
        &self,
        relative: &str,
        reader_method: Option<ReaderMethod>,
        reader_options: ReaderOptions,
    ) -> SpecTarget {
        match self {
            FileLocation::Local { base_directory } => SpecTarget::Path {
                path: base_directory.join(relative).to_string_lossy().into_owned(),
                reader_method,
                reader_options,
            },
            FileLocation::S3 { bucket, prefix, .. } => {
                let key = if prefix.is_empty() {
                    relative.to_string()
                } else {
                    format!("{}/{}", prefix, relative)
                };
                SpecTarget::S3 {
                    uri: format!("s3://{}/{}", bucket, key),
                    reader_method,
                    reader_options,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_listing_is_relative_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("b.csv"), "x\n1\n").unwrap();
        std::fs::write(dir.path().join("a.csv"), "x\n1\n").unwrap();
        std::fs::write(dir.path().join("nested/c.csv"), "x\n1\n").unwrap();

        let location = FileLocation::local(dir.path());
        let keys = location.list("files").await.unwrap();
        assert_eq!(keys, vec!["a.csv", "b.csv", "nested/c.csv"]);
    }

    #[tokio::test]
    async fn test_missing_directory_is_config_error() {
        let location = FileLocation::local("/definitely/not/here");
        let err = location.list("files").await.unwrap_err();
        assert!(matches!(err, BatchError::InvalidConfig(_)));
    }

    #[test]
    fn test_s3_target_joins_prefix() {
        let config = S3Config {
            region: "us-east-1".into(),
            access_key_id: "key".into(),
            secret_access_key: "secret".into(),
            endpoint_url: None,
            allow_http: false,
        };
        let location = FileLocation::s3("lake", "/raw/trips/", config);
        match location.target("2020-01.csv", None, ReaderOptions::default()) {
            SpecTarget::S3 { uri, .. } => assert_eq!(uri, "s3://lake/raw/trips/2020-01.csv"),
            other => panic!("unexpected target {:?}", other),
        }
    }
}
