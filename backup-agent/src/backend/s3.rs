//! S3-compatible backend.
//!
//! Works against AWS S3 and S3-compatible object stores (Aliyun OSS, B2,
//! MinIO). Uses reqwest with manual AWS Signature V4 signing so no SDK
//! dependency is needed.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::{Digest, Sha256};
use tokio_util::io::ReaderStream;
use tracing::debug;

use backup_common::backend::{DeleteSummary, ObjectPage, RemoteObject, SignMethod, StorageBackend};

type HmacSha256 = Hmac<Sha256>;

const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// S3 refuses multi-object deletes above this many keys.
const MAX_DELETE_BATCH: usize = 1000;
/// Longest validity SigV4 allows for a presigned URL.
const MAX_PRESIGN_SECS: u64 = 7 * 24 * 3600;

#[derive(Clone, Debug)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>, // Bucket base URL for S3-compatible APIs
    pub access_key_id: String,
    pub secret_access_key: String,
}

pub struct S3Backend {
    name: String,
    config: S3Config,
    client: Client,
}

impl S3Backend {
    pub fn new(name: impl Into<String>, config: S3Config) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(3 * 3600))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            name: name.into(),
            config,
            client,
        })
    }

    fn endpoint(&self) -> String {
        if let Some(ep) = &self.config.endpoint {
            ep.trim_end_matches('/').to_string()
        } else {
            format!(
                "https://s3.{}.amazonaws.com/{}",
                self.config.region, self.config.bucket
            )
        }
    }

    fn object_path(&self, key: &str) -> String {
        format!("{}/{}", url_path(&self.endpoint()), encode_path(key))
    }

    fn object_url(&self, key: &str) -> String {
        format!("{}/{}", self.endpoint(), encode_path(key))
    }

    fn bucket_path(&self) -> String {
        format!("{}/", url_path(&self.endpoint()))
    }

    /// Compute the AWS Signature V4 signature for a canonical request.
    fn signature(
        &self,
        method: &str,
        path: &str,
        query: &str,
        headers: &BTreeMap<String, String>,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> (String, String) {
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();
        let signed_headers = signed_header_names(headers);

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, query, canonical_headers, signed_headers, payload_hash
        );

        let cr_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
        let credential_scope = self.credential_scope(&date);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            date_time, credential_scope, cr_hash
        );

        let signing_key =
            derive_signing_key(&self.config.secret_access_key, &date, &self.config.region);
        let signature = hex::encode(hmac_sha256(&signing_key, string_to_sign.as_bytes()));
        (signature, credential_scope)
    }

    fn credential_scope(&self, date: &str) -> String {
        format!("{}/{}/s3/aws4_request", date, self.config.region)
    }

    /// Build headers, sign them and return the request ready to send.
    fn signed_request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &str,
        extra_headers: &[(&str, String)],
        payload_hash: &str,
    ) -> reqwest::RequestBuilder {
        let now = Utc::now();
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), url_host(&self.endpoint()));
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());
        headers.insert("x-amz-date".to_string(), date_time.clone());
        for (k, v) in extra_headers {
            headers.insert(k.to_string(), v.clone());
        }

        let (signature, scope) =
            self.signature(method.as_str(), path, query, &headers, payload_hash, now);
        let auth = format!(
            "AWS4-HMAC-SHA256 Credential={}/{},SignedHeaders={},Signature={}",
            self.config.access_key_id,
            scope,
            signed_header_names(&headers),
            signature
        );

        let url = if query.is_empty() {
            format!("{}{}", url_origin(&self.endpoint()), path)
        } else {
            format!("{}{}?{}", url_origin(&self.endpoint()), path, query)
        };

        let mut req = self
            .client
            .request(method, url)
            .header("x-amz-date", date_time)
            .header("x-amz-content-sha256", payload_hash)
            .header("Authorization", auth);
        for (k, v) in extra_headers {
            req = req.header(*k, v);
        }
        req
    }

    /// Presign `key` for `method` as of `now`.
    pub fn presign_url_at(
        &self,
        key: &str,
        method: SignMethod,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> String {
        let date_time = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let expires = ttl.as_secs().clamp(1, MAX_PRESIGN_SECS);

        let mut params = BTreeMap::new();
        params.insert("X-Amz-Algorithm".to_string(), "AWS4-HMAC-SHA256".to_string());
        params.insert(
            "X-Amz-Credential".to_string(),
            format!("{}/{}", self.config.access_key_id, self.credential_scope(&date)),
        );
        params.insert("X-Amz-Date".to_string(), date_time);
        params.insert("X-Amz-Expires".to_string(), expires.to_string());
        params.insert("X-Amz-SignedHeaders".to_string(), "host".to_string());
        let query = canonical_query(&params);

        let mut headers = BTreeMap::new();
        headers.insert("host".to_string(), url_host(&self.endpoint()));

        let (signature, _) = self.signature(
            method.as_str(),
            &self.object_path(key),
            &query,
            &headers,
            UNSIGNED_PAYLOAD,
            now,
        );
        format!("{}?{}&X-Amz-Signature={}", self.object_url(key), query, signature)
    }

    async fn delete_batch(&self, keys: &[String]) -> anyhow::Result<DeleteSummary> {
        let body = delete_request_body(keys);
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));
        let checksum =
            base64::engine::general_purpose::STANDARD.encode(Sha256::digest(body.as_bytes()));

        let resp = self
            .signed_request(
                reqwest::Method::POST,
                &self.bucket_path(),
                "delete=",
                &[
                    ("content-type", "application/xml".to_string()),
                    ("x-amz-checksum-sha256", checksum),
                    ("x-amz-sdk-checksum-algorithm", "SHA256".to_string()),
                ],
                &payload_hash,
            )
            .body(body)
            .send()
            .await
            .context("S3 DeleteObjects request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("S3 DeleteObjects failed: HTTP {} - {}", status, body);
        }

        let xml = resp.text().await.context("Failed to read S3 delete response")?;
        Ok(parse_delete_result(&xml))
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn put_file(&self, key: &str, local_path: &Path) -> anyhow::Result<()> {
        let file = tokio::fs::File::open(local_path)
            .await
            .with_context(|| format!("Failed to open {}", local_path.display()))?;
        let len = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat {}", local_path.display()))?
            .len();

        let resp = self
            .signed_request(
                reqwest::Method::PUT,
                &self.object_path(key),
                "",
                &[
                    ("content-length", len.to_string()),
                    ("content-type", "application/zip".to_string()),
                ],
                UNSIGNED_PAYLOAD,
            )
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .send()
            .await
            .context("S3 PUT request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("S3 PUT failed: HTTP {} - {}", status, body);
        }

        debug!(backend = %self.name, key = %key, bytes = len, "S3 upload complete");
        Ok(())
    }

    async fn list_page(
        &self,
        max_keys: usize,
        continuation: Option<&str>,
    ) -> anyhow::Result<ObjectPage> {
        let mut params = BTreeMap::new();
        params.insert("list-type".to_string(), "2".to_string());
        params.insert("max-keys".to_string(), max_keys.to_string());
        if let Some(token) = continuation {
            params.insert("continuation-token".to_string(), token.to_string());
        }
        let query = canonical_query(&params);
        let empty_hash = hex::encode(Sha256::digest(b""));

        let resp = self
            .signed_request(reqwest::Method::GET, &self.bucket_path(), &query, &[], &empty_hash)
            .send()
            .await
            .context("S3 LIST request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("S3 LIST failed: HTTP {} - {}", status, body);
        }

        let body = resp.text().await.context("Failed to read S3 list response")?;
        Ok(parse_list_page(&body))
    }

    async fn delete_objects(&self, keys: &[String]) -> anyhow::Result<DeleteSummary> {
        let mut summary = DeleteSummary::default();
        for batch in keys.chunks(MAX_DELETE_BATCH) {
            let result = self.delete_batch(batch).await?;
            summary.deleted.extend(result.deleted);
            summary.failed.extend(result.failed);
        }
        debug!(
            backend = %self.name,
            deleted = summary.deleted.len(),
            failed = summary.failed.len(),
            "S3 bulk delete complete"
        );
        Ok(summary)
    }

    async fn sign_url(&self, key: &str, method: SignMethod, ttl: Duration) -> anyhow::Result<String> {
        Ok(self.presign_url_at(key, method, ttl, Utc::now()))
    }
}

fn derive_signing_key(secret: &str, date: &str, region: &str) -> Vec<u8> {
    let key = format!("AWS4{}", secret);
    let k_date = hmac_sha256(key.as_bytes(), date.as_bytes());
    let k_region = hmac_sha256(&k_date, region.as_bytes());
    let k_service = hmac_sha256(&k_region, b"s3");
    hmac_sha256(&k_service, b"aws4_request")
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC key length ok");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

fn signed_header_names(headers: &BTreeMap<String, String>) -> String {
    headers.keys().cloned().collect::<Vec<_>>().join(";")
}

/// Sorted, RFC 3986 encoded query string as SigV4 expects it.
fn canonical_query(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Encode an object key for use in a URL path, keeping `/` separators.
fn encode_path(key: &str) -> String {
    key.split('/')
        .map(|seg| urlencoding::encode(seg).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

/// Extract the host part from a URL for use in signing.
fn url_host(url: &str) -> String {
    let without_scheme = strip_scheme(url);
    without_scheme.split('/').next().unwrap_or(without_scheme).to_string()
}

/// Path part of a URL without a trailing slash (empty for a bare host).
fn url_path(url: &str) -> String {
    let without_scheme = strip_scheme(url);
    match without_scheme.find('/') {
        Some(idx) => without_scheme[idx..].trim_end_matches('/').to_string(),
        None => String::new(),
    }
}

/// Scheme and host of a URL.
fn url_origin(url: &str) -> String {
    let scheme = if url.starts_with("http://") { "http" } else { "https" };
    format!("{}://{}", scheme, url_host(url))
}

fn delete_request_body(keys: &[String]) -> String {
    let mut body = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Delete><Quiet>false</Quiet>");
    for key in keys {
        body.push_str("<Object><Key>");
        body.push_str(&xml_escape(key));
        body.push_str("</Key></Object>");
    }
    body.push_str("</Delete>");
    body
}

/// Return the text of each `<tag>…</tag>` element in `xml`, in order.
fn elements<'a>(xml: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let mut found = Vec::new();
    let mut remaining = xml;
    while let Some(start) = remaining.find(&open) {
        remaining = &remaining[start + open.len()..];
        match remaining.find(&close) {
            Some(end) => {
                found.push(&remaining[..end]);
                remaining = &remaining[end + close.len()..];
            }
            None => break,
        }
    }
    found
}

fn first_element<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    elements(xml, tag).into_iter().next()
}

/// Parse a ListObjectsV2 response (minimal - no XML dependency).
fn parse_list_page(xml: &str) -> ObjectPage {
    let objects = elements(xml, "Contents")
        .into_iter()
        .filter_map(|contents| {
            let key = first_element(contents, "Key")?;
            Some(RemoteObject {
                key: xml_unescape(key),
                size: first_element(contents, "Size").and_then(|s| s.parse().ok()),
                last_modified: first_element(contents, "LastModified")
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc)),
            })
        })
        .collect();

    let is_truncated = first_element(xml, "IsTruncated") == Some("true");
    let next_token = first_element(xml, "NextContinuationToken").map(xml_unescape);

    ObjectPage {
        objects,
        next_token,
        is_truncated,
    }
}

/// Parse a DeleteObjects response into deleted keys and per-key errors.
fn parse_delete_result(xml: &str) -> DeleteSummary {
    let deleted = elements(xml, "Deleted")
        .into_iter()
        .filter_map(|d| first_element(d, "Key").map(xml_unescape))
        .collect();
    let failed = elements(xml, "Error")
        .into_iter()
        .filter_map(|e| {
            let key = first_element(e, "Key")?;
            let reason = first_element(e, "Message")
                .or_else(|| first_element(e, "Code"))
                .unwrap_or("unknown error");
            Some((xml_unescape(key), xml_unescape(reason)))
        })
        .collect();
    DeleteSummary { deleted, failed }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

fn xml_unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
