use crate::directory::auth::CachedToken;
use crate::directory::config::DirectoryConfig;
use crate::directory::resources::error_for_status;
use crate::error::PublishError;
use crate::models::ListingKind;
use crate::resilience::CircuitBreaker;
use futures::future::join_all;
use reqwest::{Client, Url, header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("source fetch failed: {0}")]
    Fetch(String),
    #[error("source answered HTTP {0}")]
    SourceStatus(u16),
    #[error("unsupported content type `{0}`")]
    UnsupportedContent(String),
    #[error("asset upload failed: {0}")]
    Upload(PublishError),
}

impl AssetError {
    fn stage(&self) -> &'static str {
        match self {
            AssetError::Fetch(_) | AssetError::SourceStatus(_) => "fetch",
            AssetError::UnsupportedContent(_) => "content_type",
            AssetError::Upload(_) => "upload",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedAsset {
    pub source_url: String,
    pub asset_id: String,
    pub filename: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedAsset {
    pub source_url: String,
    pub stage: &'static str,
    pub reason: String,
}

/// Settled result of one upload task.
#[derive(Debug, Clone)]
pub enum AssetOutcome {
    Uploaded(UploadedAsset),
    Failed(FailedAsset),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkUploadReport {
    pub uploaded: Vec<UploadedAsset>,
    pub failed: Vec<FailedAsset>,
}

impl BulkUploadReport {
    pub fn total(&self) -> usize {
        self.uploaded.len() + self.failed.len()
    }

    /// Share of submitted URLs that became assets; 0.0 for an empty batch.
    pub fn success_ratio(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            total => self.uploaded.len() as f64 / total as f64,
        }
    }

    pub fn asset_ids(&self) -> Vec<String> {
        self.uploaded.iter().map(|a| a.asset_id.clone()).collect()
    }
}

#[derive(Deserialize)]
struct AssetCreated {
    data: AssetData,
}

#[derive(Deserialize)]
struct AssetData {
    id: String,
}

/// Fetches remote images and re-uploads them as directory file assets.
///
/// Every URL runs concurrently with no cap. A failing item is logged and
/// reported; it never cancels or fails its siblings.
pub struct BulkAssetUploader {
    config: Arc<DirectoryConfig>,
    http: Client,
    breaker: Arc<CircuitBreaker>,
}

impl BulkAssetUploader {
    pub fn new(config: Arc<DirectoryConfig>, http: Client, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            config,
            http,
            breaker,
        }
    }

    /// Uploads every URL with the caller's token. Per-item failures land in
    /// the report; this never fails as a whole.
    pub async fn upload_all(
        &self,
        kind: ListingKind,
        urls: &[String],
        token: &CachedToken,
    ) -> BulkUploadReport {
        let mut report = BulkUploadReport::default();
        if urls.is_empty() {
            return report;
        }
        let asset_url = self.config.asset_url(kind);
        let tasks = urls
            .iter()
            .enumerate()
            .map(|(index, url)| self.upload_one(index, url, &asset_url, token));

        for outcome in join_all(tasks).await {
            match outcome {
                AssetOutcome::Uploaded(asset) => report.uploaded.push(asset),
                AssetOutcome::Failed(failure) => report.failed.push(failure),
            }
        }

        crate::metrics::asset_batch(report.uploaded.len(), report.total());
        info!(
            target = "realty.assets",
            uploaded = report.uploaded.len(),
            total = report.total(),
            "asset_batch_settled"
        );
        report
    }

    async fn upload_one(
        &self,
        index: usize,
        source_url: &str,
        asset_url: &str,
        token: &CachedToken,
    ) -> AssetOutcome {
        match self.transfer(index, source_url, asset_url, token).await {
            Ok(asset) => {
                info!(
                    target = "realty.assets",
                    source_url = %asset.source_url,
                    asset_id = %asset.asset_id,
                    "asset_uploaded"
                );
                AssetOutcome::Uploaded(asset)
            }
            Err(err) => {
                warn!(
                    target = "realty.assets",
                    source_url = %source_url,
                    stage = err.stage(),
                    error = %err,
                    "asset_upload_failed"
                );
                AssetOutcome::Failed(FailedAsset {
                    source_url: source_url.to_string(),
                    stage: err.stage(),
                    reason: err.to_string(),
                })
            }
        }
    }

    async fn transfer(
        &self,
        index: usize,
        source_url: &str,
        asset_url: &str,
        token: &CachedToken,
    ) -> Result<UploadedAsset, AssetError> {
        let (bytes, content_type) = self.fetch_source(source_url).await?;
        let filename = derive_filename(source_url, &content_type, index);
        let disposition = format!("file; filename=\"{filename}\"");

        let asset_id = self
            .breaker
            .fire_filtered(
                || async {
                    let response = self
                        .http
                        .post(asset_url)
                        .bearer_auth(&token.access_token)
                        .header(header::CONTENT_TYPE, "application/octet-stream")
                        .header(header::ACCEPT, "application/vnd.api+json")
                        .header(header::CONTENT_DISPOSITION, &disposition)
                        .body(bytes)
                        .send()
                        .await
                        .map_err(|err| PublishError::from_transport("asset upload", &err))?;

                    let status = response.status();
                    if !status.is_success() {
                        let raw = response.json::<Value>().await.unwrap_or(Value::Null);
                        return Err(error_for_status(status.as_u16(), raw));
                    }
                    let created: AssetCreated = response.json().await.map_err(|err| {
                        PublishError::network(format!("invalid asset response: {err}"))
                    })?;
                    Ok(created.data.id)
                },
                PublishError::counts_against_breaker,
            )
            .await
            .map_err(|err| AssetError::Upload(PublishError::from_breaker(err)))?;

        Ok(UploadedAsset {
            source_url: source_url.to_string(),
            asset_id,
            filename,
        })
    }

    async fn fetch_source(&self, source_url: &str) -> Result<(Vec<u8>, String), AssetError> {
        let response = self
            .http
            .get(source_url)
            .send()
            .await
            .map_err(|err| AssetError::Fetch(err.to_string()))?;
        if !response.status().is_success() {
            return Err(AssetError::SourceStatus(response.status().as_u16()));
        }
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or("").trim().to_lowercase())
            .unwrap_or_default();
        if !is_binary_image(&content_type) {
            let shown = if content_type.is_empty() {
                "missing".to_string()
            } else {
                content_type
            };
            return Err(AssetError::UnsupportedContent(shown));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|err| AssetError::Fetch(err.to_string()))?;
        Ok((bytes.to_vec(), content_type))
    }
}

fn is_binary_image(content_type: &str) -> bool {
    content_type.starts_with("image/") || content_type == "application/octet-stream"
}

/// Filename for the upload: the URL's last path segment, sanitised, with an
/// extension taken from the content type when the segment has none.
pub fn derive_filename(source_url: &str, content_type: &str, index: usize) -> String {
    let segment = Url::parse(source_url)
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.rfind(|s| !s.is_empty()).map(str::to_string))
        })
        .unwrap_or_default();
    let decoded = urlencoding::decode(&segment)
        .map(|s| s.into_owned())
        .unwrap_or(segment);
    let mut name: String = decoded
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
                ch
            } else {
                '_'
            }
        })
        .collect();
    name = name.trim_matches(|c| c == '.' || c == '_').to_string();
    name.truncate(96);
    if name.is_empty() {
        name = format!("image-{}", index + 1);
    }
    if !has_extension(&name) {
        name.push('.');
        name.push_str(extension_for(content_type));
    }
    name
}

fn has_extension(name: &str) -> bool {
    match name.rsplit_once('.') {
        Some((stem, ext)) => {
            !stem.is_empty()
                && (1..=5).contains(&ext.len())
                && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }
        None => false,
    }
}

fn extension_for(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/webp" => "webp",
        "image/gif" => "gif",
        "image/avif" => "avif",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{directory_config, fast_breaker};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;
    use tokio::time::Instant;
    use wiremock::matchers::{header as header_eq, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const ASSET_PATH: &str = "/jsonapi/node/property/field_images";

    fn uploader(server: &MockServer) -> BulkAssetUploader {
        BulkAssetUploader::new(
            Arc::new(directory_config(&server.uri())),
            Client::new(),
            fast_breaker("asset"),
        )
    }

    fn token() -> CachedToken {
        CachedToken {
            access_token: "t".into(),
            token_type: "Bearer".into(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
            refresh_token: None,
        }
    }

    async fn mount_image(server: &MockServer, name: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/media/{name}")))
            .respond_with(ResponseTemplate::new(200).set_body_raw(vec![0xFF, 0xD8, 0xFF], "image/jpeg"))
            .mount(server)
            .await;
    }

    async fn mount_asset(server: &MockServer, filename: &str, asset_id: &str) {
        Mock::given(method("POST"))
            .and(path(ASSET_PATH))
            .and(header_eq(
                "content-disposition",
                format!("file; filename=\"{filename}\"").as_str(),
            ))
            .and(header_eq("content-type", "application/octet-stream"))
            .and(header_eq("authorization", "Bearer t"))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
                "data": {"type": "file--file", "id": asset_id}
            })))
            .mount(server)
            .await;
    }

    fn url(server: &MockServer, name: &str) -> String {
        format!("{}/media/{name}", server.uri())
    }

    #[test]
    fn filenames_are_derived_from_urls() {
        assert_eq!(
            derive_filename("https://cdn.example.com/a/b/villa%20front.JPG?w=800", "image/jpeg", 0),
            "villa_front.JPG"
        );
        assert_eq!(
            derive_filename("https://cdn.example.com/photos/12345", "image/png", 0),
            "12345.png"
        );
        assert_eq!(derive_filename("https://cdn.example.com/", "image/webp", 2), "image-3.webp");
        assert_eq!(derive_filename("not a url", "application/octet-stream", 0), "image-1.jpg");
    }

    #[tokio::test]
    async fn empty_batch_makes_no_calls() {
        let server = MockServer::start().await;
        let report = uploader(&server)
            .upload_all(ListingKind::Property, &[], &token())
            .await;
        assert_eq!(report.total(), 0);
        assert!(report.asset_ids().is_empty());
        let requests = server.received_requests().await.unwrap_or_default();
        assert!(requests.is_empty());
    }

    #[tokio::test]
    async fn single_url_uploads() {
        let server = MockServer::start().await;
        mount_image(&server, "one.jpg").await;
        mount_asset(&server, "one.jpg", "asset-1").await;

        let report = uploader(&server)
            .upload_all(ListingKind::Property, &[url(&server, "one.jpg")], &token())
            .await;
        assert_eq!(report.asset_ids(), vec!["asset-1"]);
        assert_eq!(report.success_ratio(), 1.0);
    }

    #[tokio::test]
    async fn partial_failures_are_isolated() {
        let server = MockServer::start().await;
        mount_image(&server, "a.jpg").await;
        mount_image(&server, "c.jpg").await;
        Mock::given(method("GET"))
            .and(path("/media/missing.jpg"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        mount_asset(&server, "a.jpg", "asset-a").await;
        mount_asset(&server, "c.jpg", "asset-c").await;

        let urls = vec![
            url(&server, "a.jpg"),
            url(&server, "missing.jpg"),
            url(&server, "c.jpg"),
        ];
        let report = uploader(&server)
            .upload_all(ListingKind::Property, &urls, &token())
            .await;

        let mut ids = report.asset_ids();
        ids.sort();
        assert_eq!(ids, vec!["asset-a", "asset-c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].source_url, urls[1]);
        assert_eq!(report.failed[0].stage, "fetch");
        assert!(report.uploaded.iter().all(|a| urls.contains(&a.source_url)));
        assert!((report.success_ratio() - 2.0 / 3.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn non_image_content_is_rejected_distinctly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/media/page.html"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path(ASSET_PATH))
            .respond_with(ResponseTemplate::new(201))
            .expect(0)
            .mount(&server)
            .await;

        let report = uploader(&server)
            .upload_all(ListingKind::Property, &[url(&server, "page.html")], &token())
            .await;
        assert!(report.uploaded.is_empty());
        assert_eq!(report.failed[0].stage, "content_type");
        assert!(report.failed[0].reason.contains("text/html"));
    }

    #[tokio::test]
    async fn all_failing_batch_returns_empty() {
        let server = MockServer::start().await;
        mount_image(&server, "a.jpg").await;
        mount_image(&server, "b.jpg").await;
        Mock::given(method("POST"))
            .and(path(ASSET_PATH))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let urls = vec![url(&server, "a.jpg"), url(&server, "b.jpg")];
        let report = uploader(&server)
            .upload_all(ListingKind::Property, &urls, &token())
            .await;
        assert!(report.asset_ids().is_empty());
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|f| f.stage == "upload"));
    }

    #[tokio::test]
    async fn many_urls_upload_concurrently() {
        const COUNT: u32 = 8;
        const DELAY: Duration = Duration::from_millis(300);

        let server = MockServer::start().await;
        let mut urls = Vec::new();
        for i in 0..COUNT {
            let name = format!("photo-{i}.jpg");
            Mock::given(method("GET"))
                .and(path(format!("/media/{name}")))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_raw(vec![0xFF, 0xD8, 0xFF], "image/jpeg")
                        .set_delay(DELAY),
                )
                .mount(&server)
                .await;
            mount_asset(&server, &name, &format!("asset-{i}")).await;
            urls.push(url(&server, &name));
        }

        let started = Instant::now();
        let report = uploader(&server)
            .upload_all(ListingKind::Property, &urls, &token())
            .await;
        let elapsed = started.elapsed();

        assert_eq!(report.uploaded.len(), COUNT as usize);
        assert!(report.failed.is_empty());
        // Sequential fetches would need COUNT * DELAY.
        assert!(
            elapsed < DELAY * (COUNT / 2),
            "batch took {elapsed:?}, fetches did not overlap"
        );
    }
}
