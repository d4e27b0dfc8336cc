pub mod payload;
pub mod reference;
pub mod reviewers;

use crate::directory::config::DirectoryConfig;
use crate::directory::resources::create_resource;
use crate::directory::{BulkAssetUploader, BulkUploadReport, TokenProvider};
use crate::error::PublishError;
use crate::models::{Listing, ListingKind, StageReport};
use crate::resilience::{BreakerConfig, BreakerSnapshot, CircuitBreaker};
use payload::build_create_request;
use reference::{RANDOM_PREFIX, resolve_reference_id};
use reqwest::Client;
use reviewers::ReviewerRules;
use serde::Serialize;
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::{info, warn};

/// One breaker per protected dependency, so an outage of one never
/// fails fast on another.
#[derive(Clone)]
pub struct PublisherBreakers {
    pub token: Arc<CircuitBreaker>,
    pub assets: Arc<CircuitBreaker>,
    pub property_create: Arc<CircuitBreaker>,
    pub land_create: Arc<CircuitBreaker>,
}

impl PublisherBreakers {
    pub fn from_env() -> Self {
        let create_timeout = Duration::from_secs(12);
        let build = |config: BreakerConfig, prefix: &str| {
            Arc::new(CircuitBreaker::new(BreakerConfig::from_env(config, prefix)))
        };
        Self {
            token: build(BreakerConfig::new("token"), "TOKEN"),
            assets: build(BreakerConfig::new("asset_upload"), "ASSET"),
            property_create: build(
                BreakerConfig::new("property_create").with_timeout(create_timeout),
                "PROPERTY_CREATE",
            ),
            land_create: build(
                BreakerConfig::new("land_create").with_timeout(create_timeout),
                "LAND_CREATE",
            ),
        }
    }

    pub fn all(&self) -> [&Arc<CircuitBreaker>; 4] {
        [
            &self.token,
            &self.assets,
            &self.property_create,
            &self.land_create,
        ]
    }

    pub fn find(&self, name: &str) -> Option<&Arc<CircuitBreaker>> {
        self.all().into_iter().find(|b| b.name() == name)
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.all().iter().map(|b| b.snapshot()).collect()
    }

    fn create_for(&self, kind: ListingKind) -> &Arc<CircuitBreaker> {
        match kind {
            ListingKind::Property => &self.property_create,
            ListingKind::Land => &self.land_create,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PublishOutcome {
    pub external_id: String,
    pub external_url: String,
    pub reference_id: String,
    pub assets: BulkUploadReport,
    pub stages: Vec<StageReport>,
    #[serde(skip)]
    pub raw_response: Value,
}

struct StageOutcome<T> {
    value: T,
    output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

/// Publishes one listing to the directory: reference id, images, payload, create.
pub struct ListingPublisher {
    config: Arc<DirectoryConfig>,
    http: Client,
    tokens: Arc<TokenProvider>,
    uploader: BulkAssetUploader,
    breakers: PublisherBreakers,
    reviewers: ReviewerRules,
}

impl ListingPublisher {
    pub fn new(
        config: Arc<DirectoryConfig>,
        http: Client,
        breakers: PublisherBreakers,
        reviewers: ReviewerRules,
    ) -> Self {
        let tokens = Arc::new(TokenProvider::new(
            config.clone(),
            http.clone(),
            breakers.token.clone(),
        ));
        let uploader = BulkAssetUploader::new(config.clone(), http.clone(), breakers.assets.clone());
        Self {
            config,
            http,
            tokens,
            uploader,
            breakers,
            reviewers,
        }
    }

    #[cfg(test)]
    pub fn tokens(&self) -> &TokenProvider {
        &self.tokens
    }

    pub fn breakers(&self) -> &PublisherBreakers {
        &self.breakers
    }

    /// Runs the whole publish. Image failures are tolerated; everything
    /// else surfaces as a typed [`PublishError`].
    pub async fn publish(&self, listing: &Listing) -> Result<PublishOutcome, PublishError> {
        let started = Instant::now();
        let mut stages = Vec::new();
        info!(
            target = "realty.publisher",
            listing_id = %listing.id,
            kind = listing.kind.bundle(),
            images = listing.image_urls.len(),
            "publish_started"
        );

        let reference_id = capture_stage("reference_id", &mut stages, async {
            let id = resolve_reference_id(listing.reference_id.as_deref(), &listing.owner);
            let source = if listing.reference_id.is_some() {
                "caller"
            } else if id.starts_with(RANDOM_PREFIX) {
                "random"
            } else {
                "derived"
            };
            let output = json!({ "reference_id": &id, "source": source });
            Ok::<_, PublishError>(StageOutcome::new(id, output))
        })
        .await?;

        // One token for the whole publish; uploads and create share it.
        let token = capture_stage("authenticate", &mut stages, async {
            let token = self.tokens.get_token().await?;
            let output = json!({ "expires_at": token.expires_at });
            Ok::<_, PublishError>(StageOutcome::new(token, output))
        })
        .await?;

        let assets = capture_stage("upload_assets", &mut stages, async {
            let report = self
                .uploader
                .upload_all(listing.kind, &listing.image_urls, &token)
                .await;
            let output = json!({
                "uploaded": report.uploaded.len(),
                "total": report.total(),
                "success_ratio": report.success_ratio(),
                "failed": &report.failed,
            });
            Ok::<_, PublishError>(StageOutcome::new(report, output))
        })
        .await?;

        let request = capture_stage("build_payload", &mut stages, async {
            let reviewer_id = self.reviewers.assign(
                listing.region.as_deref(),
                listing.deal,
                listing.submitter.as_deref(),
            );
            let request = build_create_request(
                listing,
                &reference_id,
                &assets.asset_ids(),
                reviewer_id,
                &self.config.defaults,
            );
            let relationships: Vec<&str> =
                request.data.relationships.keys().copied().collect();
            let output = json!({
                "reviewer_id": reviewer_id,
                "relationships": relationships,
            });
            Ok::<_, PublishError>(StageOutcome::new(request, output))
        })
        .await?;

        let breaker = self.breakers.create_for(listing.kind);
        let url = self.config.resource_url(listing.kind);
        let created = capture_stage("create_resource", &mut stages, async {
            let created = breaker
                .fire_filtered(
                    || create_resource(&self.http, &url, &request, &token.access_token),
                    PublishError::counts_against_breaker,
                )
                .await
                .map_err(PublishError::from_breaker)?;
            let output = json!({ "external_id": &created.id });
            Ok::<_, PublishError>(StageOutcome::new(created, output))
        })
        .await?;

        let external_url = self.config.public_url(listing.kind, &created.id);
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed("publish_total", elapsed_ms);
        info!(
            target = "realty.publisher",
            listing_id = %listing.id,
            external_id = %created.id,
            gallery = assets.uploaded.len(),
            elapsed_ms = elapsed_ms as u64,
            "publish_succeeded"
        );

        Ok(PublishOutcome {
            external_id: created.id,
            external_url,
            reference_id,
            assets,
            stages,
            raw_response: created.raw,
        })
    }
}

/// Field-level rejections and auth problems mean the directory is up.
async fn capture_stage<T, Fut>(
    name: &'static str,
    stages: &mut Vec<StageReport>,
    fut: Fut,
) -> Result<T, PublishError>
where
    Fut: Future<Output = Result<StageOutcome<T>, PublishError>>,
{
    let started = Instant::now();
    let outcome = fut.await.inspect_err(|err| {
        warn!(
            target = "realty.publisher",
            stage = name,
            code = err.code().as_str(),
            error = %err,
            "publish_stage_failed"
        );
    })?;
    let elapsed_ms = started.elapsed().as_millis();
    crate::metrics::stage_elapsed(name, elapsed_ms);
    stages.push(StageReport::new(name, elapsed_ms, outcome.output));
    Ok(outcome.value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::auth::CachedToken;
    use crate::error::ErrorCode;
    use crate::models::AttemptStatus;
    use crate::resilience::breaker::BreakerState;
    use crate::testing::{fast_breakers, mount_token, publisher_for, sample_listing};
    use chrono::{Duration as ChronoDuration, Utc};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mount_image(server: &MockServer, name: &str, status: u16) {
        let template = if status == 200 {
            ResponseTemplate::new(200).set_body_raw(vec![0x89, 0x50, 0x4E, 0x47], "image/png")
        } else {
            ResponseTemplate::new(status)
        };
        Mock::given(method("GET"))
            .and(path(format!("/media/{name}")))
            .respond_with(template)
            .mount(server)
            .await;
    }

    async fn mount_assets(server: &MockServer, bundle: &str) {
        Mock::given(method("POST"))
            .and(path(format!("/jsonapi/node/{bundle}/field_images")))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": {"type": "file--file", "id": "file-x"}
            })))
            .mount(server)
            .await;
    }

    async fn mount_create(server: &MockServer, bundle: &str, template: ResponseTemplate, expect: u64) {
        Mock::given(method("POST"))
            .and(path(format!("/jsonapi/node/{bundle}")))
            .respond_with(template)
            .expect(expect)
            .mount(server)
            .await;
    }

    fn created(id: &str) -> ResponseTemplate {
        ResponseTemplate::new(201).set_body_json(json!({"data": {"type": "node--property", "id": id}}))
    }

    async fn create_body(server: &MockServer, bundle: &str) -> Value {
        let wanted = format!("/jsonapi/node/{bundle}");
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .find(|r| r.url.path() == wanted)
            .and_then(|r| r.body_json::<Value>().ok())
            .expect("create request")
    }

    #[tokio::test]
    async fn partial_gallery_still_publishes() {
        let server = MockServer::start().await;
        mount_token(&server, "tok", 1).await;
        mount_image(&server, "a.png", 200).await;
        mount_image(&server, "gone.png", 404).await;
        mount_image(&server, "c.png", 200).await;
        mount_assets(&server, "property").await;
        mount_create(&server, "property", created("node-1"), 1).await;

        let mut listing = sample_listing(ListingKind::Property);
        listing.image_urls = ["a.png", "gone.png", "c.png"]
            .iter()
            .map(|n| format!("{}/media/{n}", server.uri()))
            .collect();

        let outcome = publisher_for(&server, fast_breakers())
            .publish(&listing)
            .await
            .expect("published");
        assert_eq!(outcome.external_id, "node-1");
        assert_eq!(outcome.external_url, "https://homes.example.test/property/node-1");
        assert_eq!(outcome.reference_id, "3456-MARI-0/1234");
        assert_eq!(outcome.assets.uploaded.len(), 2);
        assert_eq!(outcome.assets.failed.len(), 1);

        let body = create_body(&server, "property").await;
        let gallery = body["data"]["relationships"]["field_images"]["data"]
            .as_array()
            .map(Vec::len);
        assert_eq!(gallery, Some(2));
        let names: Vec<&str> = outcome.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["reference_id", "authenticate", "upload_assets", "build_payload", "create_resource"]
        );
    }

    #[tokio::test]
    async fn expired_token_refreshes_once_per_publish() {
        let server = MockServer::start().await;
        mount_token(&server, "fresh", 1).await;
        mount_image(&server, "a.png", 200).await;
        mount_image(&server, "b.png", 200).await;
        Mock::given(method("POST"))
            .and(path("/jsonapi/node/property/field_images"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "data": {"type": "file--file", "id": "file-x"}
            })))
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/jsonapi/node/property"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(created("node-2"))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = publisher_for(&server, fast_breakers());
        publisher.tokens().prime(CachedToken {
            access_token: "stale".into(),
            token_type: "Bearer".into(),
            expires_at: Utc::now() - ChronoDuration::minutes(1),
            refresh_token: None,
        });
        let mut listing = sample_listing(ListingKind::Property);
        listing.image_urls = vec![
            format!("{}/media/a.png", server.uri()),
            format!("{}/media/b.png", server.uri()),
        ];

        let outcome = publisher.publish(&listing).await.expect("published");
        assert_eq!(outcome.external_id, "node-2");
    }

    #[tokio::test]
    async fn slow_create_is_a_timeout() {
        let server = MockServer::start().await;
        mount_token(&server, "tok", 1).await;
        mount_create(
            &server,
            "property",
            created("late").set_delay(Duration::from_millis(800)),
            1,
        )
        .await;

        let mut breakers = fast_breakers();
        breakers.property_create = Arc::new(CircuitBreaker::new(
            BreakerConfig::new("property_create").with_timeout(Duration::from_millis(100)),
        ));
        let err = publisher_for(&server, breakers)
            .publish(&sample_listing(ListingKind::Property))
            .await
            .expect_err("timed out");
        assert_eq!(err.code(), ErrorCode::Timeout);
        assert_eq!(err.attempt_status(), AttemptStatus::Timeout);
    }

    #[tokio::test]
    async fn field_rejections_are_aggregated() {
        let server = MockServer::start().await;
        mount_token(&server, "tok", 1).await;
        let body = json!({"errors": [
            {"title": "Unprocessable Entity", "detail": "field_price: must be positive", "source": {"pointer": "/data/attributes/field_price"}},
            {"title": "Unprocessable Entity", "detail": "title: too long", "source": {"pointer": "/data/attributes/title"}}
        ]});
        mount_create(&server, "land", ResponseTemplate::new(422).set_body_json(body.clone()), 1).await;

        let breakers = fast_breakers();
        let land = breakers.land_create.clone();
        let err = publisher_for(&server, breakers)
            .publish(&sample_listing(ListingKind::Land))
            .await
            .expect_err("rejected");
        assert_eq!(err.code(), ErrorCode::ValidationError);
        assert_eq!(err.http_status(), Some(422));
        assert_eq!(err.raw(), Some(&body));
        assert!(err.message().contains("/data/attributes/field_price"));
        assert!(err.message().contains("/data/attributes/title"));
        assert_eq!(land.snapshot().failures, 0);
    }

    #[tokio::test]
    async fn open_create_breaker_fails_fast_without_affecting_other_kind() {
        let server = MockServer::start().await;
        mount_token(&server, "tok", 1).await;
        mount_create(&server, "land", ResponseTemplate::new(503), 1).await;

        let mut breakers = fast_breakers();
        breakers.land_create = Arc::new(CircuitBreaker::new(
            BreakerConfig::new("land_create")
                .with_thresholds(1, 50)
                .with_reset_timeout(Duration::from_secs(60)),
        ));
        let publisher = publisher_for(&server, breakers);
        let land = sample_listing(ListingKind::Land);

        let first = publisher.publish(&land).await.expect_err("upstream down");
        assert_eq!(first.code(), ErrorCode::NetworkError);
        let second = publisher.publish(&land).await.expect_err("fail fast");
        assert_eq!(second.code(), ErrorCode::CircuitOpen);
        assert!(second.is_retryable());

        assert_eq!(publisher.breakers().land_create.state(), BreakerState::Open);
        assert_eq!(
            publisher.breakers().property_create.state(),
            BreakerState::Closed
        );
        assert!(publisher.breakers().find("land_create").is_some());
    }
}
