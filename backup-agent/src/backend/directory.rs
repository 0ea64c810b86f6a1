//! Local directory backend.
//!
//! Stores backups as flat files in a local (or mounted) directory. Uses
//! atomic write (temp file → fsync → rename) to prevent partial archives
//! from ever being listed.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use backup_common::backend::{DeleteSummary, ObjectPage, RemoteObject, SignMethod, StorageBackend};

const TMP_SUFFIX: &str = ".part";

pub struct DirectoryBackend {
    name: String,
    base_path: PathBuf,
}

impl DirectoryBackend {
    pub fn new(name: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        // Prevent path traversal
        let key = key.trim_start_matches('/').replace("..", "");
        self.base_path.join(key)
    }

    /// All finished object keys, sorted so continuation tokens are stable.
    async fn sorted_keys(&self) -> anyhow::Result<Vec<RemoteObject>> {
        let mut objects = Vec::new();
        if !self.base_path.exists() {
            return Ok(objects);
        }

        let mut entries = tokio::fs::read_dir(&self.base_path)
            .await
            .with_context(|| format!("Failed to read {}", self.base_path.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            let key = entry.file_name().to_string_lossy().to_string();
            if key.ends_with(TMP_SUFFIX) {
                continue;
            }
            objects.push(RemoteObject {
                key,
                size: Some(meta.len()),
                last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }
}

#[async_trait]
impl StorageBackend for DirectoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> anyhow::Result<()> {
        let dest = self.full_path(key);

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create parent directory")?;
        }

        // Unique per write so concurrent uploads of one key do not share a temp file.
        let mut tmp_path = dest.clone().into_os_string();
        tmp_path.push(format!(".{}{}", uuid::Uuid::new_v4().simple(), TMP_SUFFIX));
        let tmp_path = PathBuf::from(tmp_path);

        tokio::fs::copy(local_path, &tmp_path)
            .await
            .with_context(|| format!("Failed to copy {}", local_path.display()))?;

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&tmp_path)
            .await
            .context("Failed to open temp file for fsync")?;
        file.sync_all().await.context("fsync failed")?;
        drop(file);

        tokio::fs::rename(&tmp_path, &dest)
            .await
            .context("Atomic rename failed")?;

        debug!(backend = %self.name, key = %key, "Directory upload complete");
        Ok(())
    }

    async fn list_page(
        &self,
        max_keys: usize,
        continuation: Option<&str>,
    ) -> anyhow::Result<ObjectPage> {
        let all = self.sorted_keys().await?;
        let start = match continuation {
            Some(token) => all.partition_point(|o| o.key.as_str() <= token),
            None => 0,
        };
        let end = (start + max_keys.max(1)).min(all.len());
        let objects: Vec<RemoteObject> = all[start..end].to_vec();
        let is_truncated = end < all.len();
        let next_token = if is_truncated {
            objects.last().map(|o| o.key.clone())
        } else {
            None
        };
        Ok(ObjectPage {
            objects,
            next_token,
            is_truncated,
        })
    }

    async fn delete_objects(&self, keys: &[String]) -> anyhow::Result<DeleteSummary> {
        let mut summary = DeleteSummary::default();
        for key in keys {
            let path = self.full_path(key);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => summary.deleted.push(key.clone()),
                // Already gone counts as deleted, as with S3.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => summary.deleted.push(key.clone()),
                Err(e) => summary.failed.push((key.clone(), e.to_string())),
            }
        }
        debug!(backend = %self.name, deleted = summary.deleted.len(), "Directory delete complete");
        Ok(summary)
    }

    async fn sign_url(&self, key: &str, method: SignMethod, _ttl: Duration) -> anyhow::Result<String> {
        if method != SignMethod::Get {
            bail!("directory backend only supports read links");
        }
        let path = self.full_path(key);
        if !path.exists() {
            bail!("File not found at path: {}", path.display());
        }
        Ok(format!("file://{}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write_source(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        tokio::fs::write(&path, contents).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_put_list_delete() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("primary", dest.path());

        let file = write_source(src.path(), "a.zip", "hello world").await;
        backend.put_file("nightly_2024_01_01.zip", &file).await.unwrap();

        let page = backend.list_page(100, None).await.unwrap();
        assert_eq!(page.objects.len(), 1);
        assert_eq!(page.objects[0].key, "nightly_2024_01_01.zip");
        assert_eq!(page.objects[0].size, Some(11));
        assert!(!page.is_truncated);

        let summary = backend
            .delete_objects(&["nightly_2024_01_01.zip".to_string(), "missing.zip".to_string()])
            .await
            .unwrap();
        assert_eq!(summary.deleted.len(), 2);
        assert!(summary.failed.is_empty());
        assert!(backend.list_page(100, None).await.unwrap().objects.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_puts_of_one_key() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("primary", dest.path());
        let first = write_source(src.path(), "a.zip", "first").await;
        let second = write_source(src.path(), "b.zip", "second").await;

        let (a, b) = tokio::join!(
            backend.put_file("nightly_2024_01_01.zip", &first),
            backend.put_file("nightly_2024_01_01.zip", &second)
        );
        a.unwrap();
        b.unwrap();

        let page = backend.list_page(100, None).await.unwrap();
        assert_eq!(page.objects.len(), 1);
        let stored = tokio::fs::read_to_string(dest.path().join("nightly_2024_01_01.zip")).await.unwrap();
        assert!(stored == "first" || stored == "second");
        assert_eq!(std::fs::read_dir(dest.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_list_pages_with_continuation() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("primary", dest.path());
        let file = write_source(src.path(), "a.zip", "x").await;
        for key in ["a_2024_01_01.zip", "a_2024_01_02.zip", "a_2024_01_03.zip"] {
            backend.put_file(key, &file).await.unwrap();
        }

        let first = backend.list_page(2, None).await.unwrap();
        assert_eq!(first.objects.len(), 2);
        assert!(first.is_truncated);

        let second = backend
            .list_page(2, first.next_token.as_deref())
            .await
            .unwrap();
        assert_eq!(second.objects.len(), 1);
        assert_eq!(second.objects[0].key, "a_2024_01_03.zip");
        assert!(!second.is_truncated);
        assert!(second.next_token.is_none());
    }

    #[tokio::test]
    async fn test_missing_base_lists_empty() {
        let dest = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("primary", dest.path().join("not-yet"));
        let page = backend.list_page(100, None).await.unwrap();
        assert!(page.objects.is_empty());
    }

    #[tokio::test]
    async fn test_path_traversal_stays_inside_base() {
        let dest = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("primary", dest.path());
        let path = backend.full_path("../../../etc/passwd");
        assert!(path.starts_with(dest.path()));
    }

    #[tokio::test]
    async fn test_sign_url_points_at_file() {
        let src = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new("primary", dest.path());
        let file = write_source(src.path(), "a.zip", "x").await;
        backend.put_file("a_2024_01_01.zip", &file).await.unwrap();

        let url = backend
            .sign_url("a_2024_01_01.zip", SignMethod::Get, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with("file://"));
        assert!(url.ends_with("a_2024_01_01.zip"));
        assert!(backend
            .sign_url("a_2024_01_01.zip", SignMethod::Put, Duration::from_secs(60))
            .await
            .is_err());
    }
}
