//! Two-tier upload client.
//!
//! The primary ("slow") backend is always tried first. The optional secondary
//! ("fast") backend is only used when the primary fails, and at most once per
//! cooldown period after the last successful upload, because the fast path is
//! billed per transfer.
//!
//! Listing, pruning and signed links always go through the primary.

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use backup_common::backend::{DeleteSummary, RemoteObject, SignMethod, StorageBackend};
use backup_common::naming::NameCodec;
use backup_common::retention::is_expired;

/// Minimum time between successful uploads before the fast path may be used.
pub const FAST_PATH_COOLDOWN_DAYS: i64 = 3;
/// Keys requested per listing call.
pub const LIST_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Primary,
    Secondary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub tier: Tier,
    pub backend: String,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// Primary failed and there is no secondary to fall back to.
    #[error("{backend} backend upload failed: {error:#}")]
    Primary { backend: String, error: anyhow::Error },
    /// Primary failed and the secondary is still cooling down.
    #[error("primary upload failed ({primary}); fast backend cooling down until {retry_after}")]
    Cooldown {
        primary: String,
        last_success: DateTime<Utc>,
        retry_after: DateTime<Utc>,
    },
    /// Both tiers were tried and both failed.
    #[error("{backend} backend upload failed after primary failure ({primary}): {error:#}")]
    Secondary {
        backend: String,
        primary: String,
        error: anyhow::Error,
    },
}

impl UploadError {
    /// Every failure except the cooldown gate is a hard failure.
    pub fn is_hard(&self) -> bool {
        !self.is_cooldown()
    }

    pub fn is_cooldown(&self) -> bool {
        matches!(self, UploadError::Cooldown { .. })
    }
}

pub fn has_hard_error(result: &Result<UploadOutcome, UploadError>) -> bool {
    matches!(result, Err(e) if e.is_hard())
}

pub fn has_cooldown_error(result: &Result<UploadOutcome, UploadError>) -> bool {
    matches!(result, Err(e) if e.is_cooldown())
}

pub struct TieredStorage {
    primary: Box<dyn StorageBackend>,
    secondary: Option<Box<dyn StorageBackend>>,
    codec: NameCodec,
    cooldown: Duration,
    /// Time of the last successful upload through either tier.
    last_success: Mutex<Option<DateTime<Utc>>>,
}

impl TieredStorage {
    pub fn new(primary: Box<dyn StorageBackend>, secondary: Option<Box<dyn StorageBackend>>) -> Self {
        info!(
            primary = %primary.name(),
            secondary = secondary.as_ref().map(|s| s.name()).unwrap_or("none"),
            "Storage client ready"
        );
        Self {
            primary,
            secondary,
            codec: NameCodec::new(),
            cooldown: Duration::days(FAST_PATH_COOLDOWN_DAYS),
            last_success: Mutex::new(None),
        }
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn record_success(&self, at: DateTime<Utc>) {
        *self.last_success.lock().unwrap_or_else(|e| e.into_inner()) = Some(at);
    }

    /// `Some(last_success)` while the fast path is still cooling down.
    fn cooling_down(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.last_success() {
            Some(last) if now - last <= self.cooldown => Some(last),
            _ => None,
        }
    }

    pub async fn upload(
        &self,
        key: &str,
        local_path: &Path,
        sink: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<UploadOutcome, UploadError> {
        self.upload_at(key, local_path, Utc::now(), sink).await
    }

    /// Upload `local_path` as `key`, falling back to the secondary when
    /// allowed. `now` is the instant used for the cooldown decision and
    /// recorded on success.
    pub async fn upload_at(
        &self,
        key: &str,
        local_path: &Path,
        now: DateTime<Utc>,
        sink: &(dyn Fn(&str) + Send + Sync),
    ) -> Result<UploadOutcome, UploadError> {
        sink(&format!("uploading {} via {} backend", key, self.primary.name()));
        let primary_error = match self.primary.put_file(key, local_path).await {
            Ok(()) => {
                self.record_success(now);
                sink(&format!("{} backend upload succeeded", self.primary.name()));
                return Ok(UploadOutcome {
                    tier: Tier::Primary,
                    backend: self.primary.name().to_string(),
                });
            }
            Err(e) => e,
        };
        sink(&format!("{} backend upload failed: {:#}", self.primary.name(), primary_error));

        let Some(secondary) = &self.secondary else {
            sink("fast backend not configured");
            return Err(UploadError::Primary {
                backend: self.primary.name().to_string(),
                error: primary_error,
            });
        };

        if let Some(last) = self.cooling_down(now) {
            let retry_after = last + self.cooldown;
            sink(&format!(
                "{} backend in {}-day cooldown until {}",
                secondary.name(),
                self.cooldown.num_days(),
                retry_after.format("%Y-%m-%d %H:%M:%S")
            ));
            return Err(UploadError::Cooldown {
                primary: format!("{:#}", primary_error),
                last_success: last,
                retry_after,
            });
        }

        sink(&format!("uploading {} via {} backend", key, secondary.name()));
        match secondary.put_file(key, local_path).await {
            Ok(()) => {
                self.record_success(now);
                sink(&format!("{} backend upload succeeded", secondary.name()));
                Ok(UploadOutcome {
                    tier: Tier::Secondary,
                    backend: secondary.name().to_string(),
                })
            }
            Err(e) => {
                sink(&format!("{} backend upload failed: {:#}", secondary.name(), e));
                Err(UploadError::Secondary {
                    backend: secondary.name().to_string(),
                    primary: format!("{:#}", primary_error),
                    error: e,
                })
            }
        }
    }

    /// Collect the objects owned by `owner_id` that are past the retention
    /// window. A listing error ends the scan early; whatever was gathered so
    /// far is returned.
    pub async fn list_aged_objects(
        &self,
        owner_id: &str,
        now: DateTime<Utc>,
        window: Duration,
    ) -> Vec<RemoteObject> {
        let mut aged = Vec::new();
        let mut token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = match self.primary.list_page(LIST_PAGE_SIZE, token.as_deref()).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        backend = %self.primary.name(),
                        owner = %owner_id,
                        pages,
                        error = %format!("{:#}", e),
                        "Listing failed, using partial results"
                    );
                    break;
                }
            };
            pages += 1;

            aged.extend(
                page.objects
                    .into_iter()
                    .filter(|o| is_expired(&self.codec, owner_id, &o.key, now, window)),
            );

            match page.next_token {
                Some(next) if page.is_truncated => token = Some(next),
                _ => break,
            }
        }

        debug!(owner = %owner_id, pages, aged = aged.len(), "Retention scan complete");
        aged
    }

    pub async fn delete_objects(&self, keys: &[String]) -> anyhow::Result<DeleteSummary> {
        if keys.is_empty() {
            return Ok(DeleteSummary::default());
        }
        self.primary.delete_objects(keys).await
    }

    /// Read-only link to `key` on the primary, valid for `ttl`.
    pub async fn signed_temporary_link(&self, key: &str, ttl: StdDuration) -> anyhow::Result<String> {
        self.primary.sign_url(key, SignMethod::Get, ttl).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::bail;
    use async_trait::async_trait;
    use backup_common::backend::ObjectPage;
    use backup_common::retention::retention_window;
    use chrono::TimeZone;

    /// In-memory backend with switchable failures.
    pub(crate) struct MockBackend {
        name: String,
        pub fail_put: AtomicBool,
        pub put_calls: AtomicUsize,
        /// Listing calls beyond this many fail.
        pub fail_list_after: Option<usize>,
        list_calls: AtomicUsize,
        pub keys: Mutex<Vec<String>>,
        /// When set, `put_file` keeps a copy of each uploaded file.
        pub capture_uploads: AtomicBool,
        pub uploads: Mutex<Vec<Vec<u8>>>,
    }

    impl MockBackend {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                fail_put: AtomicBool::new(false),
                put_calls: AtomicUsize::new(0),
                fail_list_after: None,
                list_calls: AtomicUsize::new(0),
                keys: Mutex::new(Vec::new()),
                capture_uploads: AtomicBool::new(false),
                uploads: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_keys(name: &str, keys: &[&str]) -> Self {
            let backend = Self::new(name);
            *backend.keys.lock().unwrap() = keys.iter().map(|k| k.to_string()).collect();
            backend
        }
    }

    #[async_trait]
    impl StorageBackend for MockBackend {
        fn name(&self) -> &str {
            &self.name
        }

        async fn put_file(&self, key: &str, local_path: &Path) -> anyhow::Result<()> {
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_put.load(Ordering::SeqCst) {
                bail!("{} unreachable", self.name);
            }
            if self.capture_uploads.load(Ordering::SeqCst) {
                let bytes = tokio::fs::read(local_path).await?;
                self.uploads.lock().unwrap().push(bytes);
            }
            self.keys.lock().unwrap().push(key.to_string());
            Ok(())
        }

        async fn list_page(
            &self,
            max_keys: usize,
            continuation: Option<&str>,
        ) -> anyhow::Result<ObjectPage> {
            let call = self.list_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(limit) = self.fail_list_after {
                if call >= limit {
                    bail!("listing unavailable");
                }
            }
            let keys = self.keys.lock().unwrap().clone();
            let start: usize = continuation.map(|t| t.parse().unwrap()).unwrap_or(0);
            let end = (start + max_keys).min(keys.len());
            let is_truncated = end < keys.len();
            Ok(ObjectPage {
                objects: keys[start..end].iter().map(RemoteObject::new).collect(),
                next_token: is_truncated.then(|| end.to_string()),
                is_truncated,
            })
        }

        async fn delete_objects(&self, keys: &[String]) -> anyhow::Result<DeleteSummary> {
            let mut stored = self.keys.lock().unwrap();
            stored.retain(|k| !keys.contains(k));
            Ok(DeleteSummary {
                deleted: keys.to_vec(),
                failed: Vec::new(),
            })
        }

        async fn sign_url(&self, key: &str, _method: SignMethod, ttl: StdDuration) -> anyhow::Result<String> {
            Ok(format!("mock://{}/{}?ttl={}", self.name, key, ttl.as_secs()))
        }
    }

    /// Forwards to a shared mock so tests can inspect it after handing
    /// ownership to the client.
    pub(crate) struct SharedBackend(pub Arc<MockBackend>);

    #[async_trait]
    impl StorageBackend for SharedBackend {
        fn name(&self) -> &str {
            self.0.name()
        }
        async fn put_file(&self, key: &str, local_path: &Path) -> anyhow::Result<()> {
            self.0.put_file(key, local_path).await
        }
        async fn list_page(&self, max_keys: usize, continuation: Option<&str>) -> anyhow::Result<ObjectPage> {
            self.0.list_page(max_keys, continuation).await
        }
        async fn delete_objects(&self, keys: &[String]) -> anyhow::Result<DeleteSummary> {
            self.0.delete_objects(keys).await
        }
        async fn sign_url(&self, key: &str, method: SignMethod, ttl: StdDuration) -> anyhow::Result<String> {
            self.0.sign_url(key, method, ttl).await
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 25, 0).unwrap()
    }

    fn tiers(with_secondary: bool) -> (Arc<MockBackend>, Option<Arc<MockBackend>>, TieredStorage) {
        let primary = Arc::new(MockBackend::new("slow"));
        let secondary = with_secondary.then(|| Arc::new(MockBackend::new("fast")));
        let client = TieredStorage::new(
            Box::new(SharedBackend(primary.clone())),
            secondary
                .clone()
                .map(|s| Box::new(SharedBackend(s)) as Box<dyn StorageBackend>),
        );
        (primary, secondary, client)
    }

    fn quiet(_: &str) {}

    #[tokio::test]
    async fn test_primary_success() {
        let (primary, secondary, client) = tiers(true);
        let result = client.upload_at("a_2024_03_01.zip", Path::new("/tmp/a"), t0(), &quiet).await;
        assert_eq!(result.as_ref().unwrap().tier, Tier::Primary);
        assert!(!has_hard_error(&result));
        assert!(!has_cooldown_error(&result));
        assert_eq!(client.last_success(), Some(t0()));
        assert_eq!(primary.put_calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary.unwrap().put_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_primary_failure_without_secondary_is_hard() {
        let (primary, _, client) = tiers(false);
        primary.fail_put.store(true, Ordering::SeqCst);
        let result = client.upload_at("a.zip", Path::new("/tmp/a"), t0(), &quiet).await;
        assert!(has_hard_error(&result));
        assert!(!has_cooldown_error(&result));
        assert!(matches!(result, Err(UploadError::Primary { .. })));
        assert!(client.last_success().is_none());
    }

    #[tokio::test]
    async fn test_cooldown_blocks_secondary() {
        let (primary, secondary, client) = tiers(true);
        let secondary = secondary.unwrap();
        client.upload_at("a.zip", Path::new("/tmp/a"), t0(), &quiet).await.unwrap();

        primary.fail_put.store(true, Ordering::SeqCst);
        let result = client
            .upload_at("b.zip", Path::new("/tmp/b"), t0() + Duration::days(1), &quiet)
            .await;
        assert!(has_cooldown_error(&result));
        assert!(!has_hard_error(&result));
        assert_eq!(secondary.put_calls.load(Ordering::SeqCst), 0);
        match result {
            Err(UploadError::Cooldown { last_success, retry_after, .. }) => {
                assert_eq!(last_success, t0());
                assert_eq!(retry_after, t0() + Duration::days(3));
            }
            other => panic!("expected cooldown, got {:?}", other),
        }
        assert_eq!(client.last_success(), Some(t0()));
    }

    #[tokio::test]
    async fn test_cooldown_boundary_is_exclusive() {
        let (primary, secondary, client) = tiers(true);
        client.upload_at("a.zip", Path::new("/tmp/a"), t0(), &quiet).await.unwrap();
        primary.fail_put.store(true, Ordering::SeqCst);

        let at_boundary = t0() + Duration::days(FAST_PATH_COOLDOWN_DAYS);
        let result = client.upload_at("b.zip", Path::new("/tmp/b"), at_boundary, &quiet).await;
        assert!(has_cooldown_error(&result));
        assert_eq!(secondary.unwrap().put_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_cooldown_uses_secondary() {
        let (primary, secondary, client) = tiers(true);
        let secondary = secondary.unwrap();
        client.upload_at("a.zip", Path::new("/tmp/a"), t0(), &quiet).await.unwrap();

        primary.fail_put.store(true, Ordering::SeqCst);
        let later = t0() + Duration::days(4);
        let result = client.upload_at("b.zip", Path::new("/tmp/b"), later, &quiet).await;
        let outcome = result.unwrap();
        assert_eq!(outcome.tier, Tier::Secondary);
        assert_eq!(outcome.backend, "fast");
        assert_eq!(client.last_success(), Some(later));
        assert_eq!(secondary.put_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_never_succeeded_allows_secondary() {
        let (primary, _, client) = tiers(true);
        primary.fail_put.store(true, Ordering::SeqCst);
        let result = client.upload_at("a.zip", Path::new("/tmp/a"), t0(), &quiet).await;
        assert_eq!(result.unwrap().tier, Tier::Secondary);
    }

    #[tokio::test]
    async fn test_secondary_failure_is_hard() {
        let (primary, secondary, client) = tiers(true);
        primary.fail_put.store(true, Ordering::SeqCst);
        secondary.unwrap().fail_put.store(true, Ordering::SeqCst);
        let result = client.upload_at("a.zip", Path::new("/tmp/a"), t0(), &quiet).await;
        assert!(has_hard_error(&result));
        assert!(matches!(result, Err(UploadError::Secondary { .. })));
        assert!(client.last_success().is_none());
    }

    #[tokio::test]
    async fn test_upload_reports_each_stage() {
        let (primary, _, client) = tiers(true);
        primary.fail_put.store(true, Ordering::SeqCst);
        let messages = Mutex::new(Vec::new());
        let sink = |m: &str| messages.lock().unwrap().push(m.to_string());
        client.upload_at("a.zip", Path::new("/tmp/a"), t0(), &sink).await.unwrap();

        let messages = messages.into_inner().unwrap();
        assert_eq!(messages.len(), 4);
        assert!(messages[0].contains("via slow"));
        assert!(messages[1].contains("slow backend upload failed"));
        assert!(messages[2].contains("via fast"));
        assert!(messages[3].contains("fast backend upload succeeded"));
    }

    #[tokio::test]
    async fn test_pruning_is_scoped_to_owner() {
        let primary = MockBackend::with_keys("slow", &["A_2024_01_01", "B_2024_01_01", "A_2030_01_01"]);
        let client = TieredStorage::new(Box::new(primary), None);
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
        let aged = client.list_aged_objects("A", now, retention_window()).await;
        let keys: Vec<_> = aged.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["A_2024_01_01"]);
    }

    #[tokio::test]
    async fn test_listing_walks_all_pages() {
        let keys: Vec<String> = (0..250)
            .map(|i| format!("A_2020_{:02}_{:02}.zip", i % 12 + 1, i % 28 + 1))
            .collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let primary = Arc::new(MockBackend::with_keys("slow", &refs));
        let client = TieredStorage::new(Box::new(SharedBackend(primary.clone())), None);
        let aged = client.list_aged_objects("A", t0(), retention_window()).await;
        assert_eq!(aged.len(), 250);
        assert_eq!(primary.list_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_listing_error_keeps_partial_results() {
        let keys: Vec<String> = (0..150).map(|i| format!("A_2020_01_{:02}_{}.zip", i % 28 + 1, i)).collect();
        let refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let mut primary = MockBackend::with_keys("slow", &refs);
        primary.fail_list_after = Some(1);
        let client = TieredStorage::new(Box::new(primary), None);
        let aged = client.list_aged_objects("A", t0(), retention_window()).await;
        assert_eq!(aged.len(), LIST_PAGE_SIZE);
    }

    #[tokio::test]
    async fn test_delete_and_link_go_to_primary() {
        let primary = Arc::new(MockBackend::with_keys("slow", &["A_2020_01_01.zip"]));
        let client = TieredStorage::new(Box::new(SharedBackend(primary.clone())), None);

        let summary = client.delete_objects(&["A_2020_01_01.zip".to_string()]).await.unwrap();
        assert_eq!(summary.deleted.len(), 1);
        assert!(primary.keys.lock().unwrap().is_empty());
        assert_eq!(client.delete_objects(&[]).await.unwrap(), DeleteSummary::default());

        let link = client
            .signed_temporary_link("A_2020_01_01.zip", StdDuration::from_secs(86400))
            .await
            .unwrap();
        assert_eq!(link, "mock://slow/A_2020_01_01.zip?ttl=86400");
    }
}
