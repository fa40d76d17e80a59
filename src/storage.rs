use std::path::Path;
use std::sync::{Arc, OnceLock};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use regex::Regex;
use tracing::{debug, info};

use crate::config::StorageConfig;

/// Remote object storage used to stage render inputs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
  fn bucket(&self) -> &str;

  /// Returns the remote reference (`s3://bucket/key`).
  async fn upload(&self, local: &Path, key: &str) -> Result<String>;

  async fn download(&self, remote: &str, local: &Path) -> Result<()>;
}

fn scheme_pattern() -> &'static Regex {
  static PATTERN: OnceLock<Regex> = OnceLock::new();
  PATTERN.get_or_init(|| Regex::new(r"^([A-Za-z][A-Za-z0-9+.\-]*)://").expect("valid scheme pattern"))
}

/// `s3://`, `gs://`, `https://` and friends; `file://` is local.
pub fn is_remote_ref(location: &str) -> bool {
  scheme_pattern()
    .captures(location)
    .and_then(|c| c.get(1))
    .is_some_and(|scheme| !scheme.as_str().eq_ignore_ascii_case("file"))
}

/// Splits `scheme://bucket/key` into bucket and key.
pub fn parse_remote_ref(location: &str) -> Option<(&str, &str)> {
  let end = scheme_pattern().find(location)?.end();
  let (bucket, key) = location[end..].split_once('/')?;
  if bucket.is_empty() || key.is_empty() {
    return None;
  }
  Some((bucket, key))
}

pub struct ObjectStoreStorage {
  store: Arc<dyn ObjectStore>,
  bucket: String,
}

impl ObjectStoreStorage {
  pub fn s3(config: &StorageConfig) -> Result<Self> {
    let mut builder = AmazonS3Builder::new()
      .with_region(&config.region)
      .with_bucket_name(&config.bucket);
    if let Some(key) = &config.access_key_id {
      builder = builder.with_access_key_id(key);
    }
    if let Some(secret) = &config.secret_access_key {
      builder = builder.with_secret_access_key(secret);
    }
    if let Some(endpoint) = &config.endpoint_url {
      let endpoint = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.clone()
      } else {
        format!("https://{endpoint}")
      };
      builder = builder
        .with_allow_http(endpoint.starts_with("http://"))
        .with_endpoint(endpoint);
    }
    let store = builder.build().context("failed to build S3 client")?;
    info!(bucket = %config.bucket, region = %config.region, "object storage: s3");
    Ok(Self {
      store: Arc::new(store),
      bucket: config.bucket.clone(),
    })
  }

  /// Bucket emulated by a directory.
  pub fn local(root: &Path, bucket: impl Into<String>) -> Result<Self> {
    std::fs::create_dir_all(root).with_context(|| format!("failed to create {}", root.display()))?;
    let store = LocalFileSystem::new_with_prefix(root).context("failed to open local object store")?;
    let bucket = bucket.into();
    info!(bucket = %bucket, root = %root.display(), "object storage: local filesystem");
    Ok(Self {
      store: Arc::new(store),
      bucket,
    })
  }
}

#[async_trait]
impl ObjectStorage for ObjectStoreStorage {
  fn bucket(&self) -> &str {
    &self.bucket
  }

  async fn upload(&self, local: &Path, key: &str) -> Result<String> {
    let data = tokio::fs::read(local)
      .await
      .with_context(|| format!("failed to read {}", local.display()))?;
    let size = data.len();
    let path = ObjectPath::parse(key).with_context(|| format!("invalid object key '{key}'"))?;
    self.store.put(&path, PutPayload::from(data)).await?;
    debug!(key, bytes = size, "uploaded");
    Ok(format!("s3://{}/{}", self.bucket, key))
  }

  async fn download(&self, remote: &str, local: &Path) -> Result<()> {
    let (bucket, key) = parse_remote_ref(remote).ok_or_else(|| anyhow!("not a remote reference: {remote}"))?;
    if bucket != self.bucket {
      return Err(anyhow!("reference {remote} is outside bucket {}", self.bucket));
    }
    let path = ObjectPath::parse(key).with_context(|| format!("invalid object key '{key}'"))?;
    let bytes = self.store.get(&path).await?.bytes().await?;
    if let Some(parent) = local.parent() {
      tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(local, &bytes)
      .await
      .with_context(|| format!("failed to write {}", local.display()))?;
    debug!(remote, bytes = bytes.len(), "downloaded");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn recognises_remote_references() {
    assert!(is_remote_ref("s3://bucket/renders/a.blend"));
    assert!(is_remote_ref("https://cdn.example.com/a.png"));
    assert!(!is_remote_ref("file:///tmp/a.blend"));
    assert!(!is_remote_ref("/tmp/a.blend"));
    assert!(!is_remote_ref("C:\\scenes\\a.blend"));
  }

  #[test]
  fn splits_bucket_and_key() {
    assert_eq!(parse_remote_ref("s3://frames/renders/t1/a.blend"), Some(("frames", "renders/t1/a.blend")));
    assert_eq!(parse_remote_ref("s3://frames"), None);
    assert_eq!(parse_remote_ref("/local/path"), None);
  }

  #[tokio::test]
  async fn upload_then_download_through_local_store() {
    let root = tempfile::tempdir().unwrap();
    let scratch = tempfile::tempdir().unwrap();
    let source = scratch.path().join("scene.blend");
    std::fs::write(&source, b"BLENDER-v300").unwrap();

    let storage = ObjectStoreStorage::local(root.path(), "frames").unwrap();
    let remote = storage.upload(&source, "renders/t1/scene.blend").await.unwrap();
    assert_eq!(remote, "s3://frames/renders/t1/scene.blend");

    let target = scratch.path().join("copy/scene.blend");
    storage.download(&remote, &target).await.unwrap();
    assert_eq!(std::fs::read(&target).unwrap(), b"BLENDER-v300");

    assert!(storage.download("s3://other/renders/t1/scene.blend", &target).await.is_err());
  }
}
