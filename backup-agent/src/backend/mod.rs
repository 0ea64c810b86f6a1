pub mod directory;
pub mod s3;

use anyhow::bail;
use backup_common::backend::StorageBackend;

use crate::config::StorageConfig;

use self::directory::DirectoryBackend;
use self::s3::{S3Backend, S3Config};

/// Primary backend plus the optional fast-path secondary.
pub type BackendPair = (Box<dyn StorageBackend>, Option<Box<dyn StorageBackend>>);

/// Construct the storage backends described by the `[storage]` section.
///
/// The primary is required; the secondary is only built when a fast endpoint
/// (or fast path) is configured.
pub fn from_config(storage: &StorageConfig) -> anyhow::Result<BackendPair> {
    match storage {
        StorageConfig::S3 {
            bucket,
            region,
            endpoint,
            fast_endpoint,
            access_key_id,
            secret_access_key,
        } => {
            // Fall back to environment variables
            let access_key_id = access_key_id
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| std::env::var("AWS_ACCESS_KEY_ID").unwrap_or_default());
            let secret_access_key = secret_access_key
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").unwrap_or_default());

            if access_key_id.is_empty() || secret_access_key.is_empty() {
                bail!("S3 credentials not found for bucket '{}'", bucket);
            }

            let base = S3Config {
                bucket: bucket.clone(),
                region: region.clone(),
                endpoint: endpoint.clone(),
                access_key_id,
                secret_access_key,
            };

            let primary = S3Backend::new("slow", base.clone())?;
            let secondary = match fast_endpoint.as_deref().filter(|ep| !ep.is_empty()) {
                Some(ep) => {
                    let config = S3Config {
                        endpoint: Some(ep.to_string()),
                        ..base
                    };
                    Some(Box::new(S3Backend::new("fast", config)?) as Box<dyn StorageBackend>)
                }
                None => None,
            };
            Ok((Box::new(primary), secondary))
        }
        StorageConfig::Directory { path, fast_path } => {
            let primary = DirectoryBackend::new("slow", path.clone());
            let secondary = fast_path
                .as_ref()
                .map(|p| Box::new(DirectoryBackend::new("fast", p.clone())) as Box<dyn StorageBackend>);
            Ok((Box::new(primary), secondary))
        }
    }
}
