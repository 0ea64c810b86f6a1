use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// An object as reported by a backend listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub key: String,
    pub size: Option<u64>,
    pub last_modified: Option<DateTime<Utc>>,
}

impl RemoteObject {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: None,
            last_modified: None,
        }
    }
}

/// One page of a paginated listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub objects: Vec<RemoteObject>,
    /// Token to pass to the next `list_page` call when `is_truncated` is set.
    pub next_token: Option<String>,
    pub is_truncated: bool,
}

/// Outcome of a bulk delete. Keys that the backend refused are listed with
/// the reason instead of failing the whole call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteSummary {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// HTTP method a signed URL grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMethod {
    Get,
    Put,
}

impl SignMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignMethod::Get => "GET",
            SignMethod::Put => "PUT",
        }
    }
}

/// Trait implemented by all storage backends.
///
/// A backend only moves bytes: tier selection, cooldown and retention are
/// decided by the tiered client that owns it.
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    /// Short label used in logs and report messages.
    fn name(&self) -> &str;

    /// Upload the file at `local_path` under `key`.
    async fn put_file(&self, key: &str, local_path: &Path) -> anyhow::Result<()>;

    /// List at most `max_keys` objects, continuing after `continuation`.
    async fn list_page(
        &self,
        max_keys: usize,
        continuation: Option<&str>,
    ) -> anyhow::Result<ObjectPage>;

    /// Delete all `keys` in as few requests as the backend allows.
    async fn delete_objects(&self, keys: &[String]) -> anyhow::Result<DeleteSummary>;

    /// Produce a URL granting `method` on `key` for `ttl`.
    async fn sign_url(&self, key: &str, method: SignMethod, ttl: Duration) -> anyhow::Result<String>;
}
