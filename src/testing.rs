//! Shared fixtures for unit tests.

use crate::directory::config::{DEFAULT_REVIEWER_ID, DirectoryConfig, RelationshipDefaults};
use crate::models::{DealType, Listing, ListingDraft, ListingKind, OwnerContact};
use crate::publisher::reviewers::ReviewerRules;
use crate::publisher::{ListingPublisher, PublisherBreakers};
use crate::resilience::{BreakerConfig, CircuitBreaker};
use reqwest::Client;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const LOCATION_ID: &str = "11111111-1111-4111-8111-111111111111";
pub const FEATURE_A: &str = "22222222-2222-4222-8222-222222222222";
pub const FEATURE_B: &str = "33333333-3333-4333-8333-333333333333";

pub fn directory_config(base_url: &str) -> DirectoryConfig {
    DirectoryConfig {
        base_url: base_url.trim_end_matches('/').to_string(),
        client_id: Some("client-id".into()),
        client_secret: Some("client-secret".into()),
        scope: None,
        token_path: "/oauth/token".into(),
        public_site_url: "https://homes.example.test".into(),
        token_safety_buffer: Duration::from_secs(300),
        defaults: RelationshipDefaults::default(),
    }
}

pub fn fast_breaker(name: &'static str) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(
        BreakerConfig::new(name)
            .with_timeout(Duration::from_secs(2))
            .with_reset_timeout(Duration::from_millis(50))
            .with_thresholds(5, 50),
    ))
}

pub fn fast_breakers() -> PublisherBreakers {
    PublisherBreakers {
        token: fast_breaker("token"),
        assets: fast_breaker("asset_upload"),
        property_create: fast_breaker("property_create"),
        land_create: fast_breaker("land_create"),
    }
}

pub fn publisher_for(server: &MockServer, breakers: PublisherBreakers) -> ListingPublisher {
    ListingPublisher::new(
        Arc::new(directory_config(&server.uri())),
        Client::new(),
        breakers,
        ReviewerRules::builtin(DEFAULT_REVIEWER_ID),
    )
}

pub async fn mount_token(server: &MockServer, token: &str, expect: u64) {
    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": token,
            "token_type": "Bearer",
            "expires_in": 3600
        })))
        .expect(expect)
        .mount(server)
        .await;
}

pub fn sample_listing(kind: ListingKind) -> Listing {
    let draft: ListingDraft = serde_json::from_value(json!({
        "kind": kind,
        "deal": DealType::Sale,
        "title": "Stone house with garden",
        "description": "<p>Quiet village street.</p>",
        "price": 245000,
        "bedrooms": 3,
        "bathrooms": 2,
        "covered_area": 140.5,
        "plot_area": 520,
        "address": "12 Olive Street",
        "region": "Paphos",
        "geo": {"lat": 34.77, "lng": 32.42},
        "relationships": {
            "location_id": LOCATION_ID,
            "feature_ids": [FEATURE_A, FEATURE_B]
        }
    }))
    .expect("sample draft");
    let mut listing = Listing::from_draft(draft, Some("agent-7"));
    listing.owner = OwnerContact {
        phone: Some("+357 99 123456".into()),
        email: Some("maria@example.com".into()),
        title_deed: Some("0/1234".into()),
    };
    listing
}
