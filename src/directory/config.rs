use crate::models::ListingKind;
use std::{env, time::Duration};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_TOKEN_PATH: &str = "/oauth/token";

// Fallback taxonomy terms and reviewer on the directory side.
pub const DEFAULT_LOCATION_ID: &str = "5d0b6a61-3c1e-4f0c-9a51-2c9d7a1f0e01";
pub const DEFAULT_PROPERTY_TYPE_ID: &str = "8a4f2e7c-1b3d-4c5e-8f60-7a9b0c1d2e03";
pub const DEFAULT_LAND_TYPE_ID: &str = "c3e1f5a7-9b2d-4e6f-8a10-b2c4d6e8f004";
pub const DEFAULT_REVIEWER_ID: &str = "0f6e2d4c-8a1b-4c3d-9e5f-a7b8c9d0e105";

#[derive(Debug, Clone)]
pub struct RelationshipDefaults {
    pub location_id: String,
    pub property_type_id: String,
    pub land_type_id: String,
    pub reviewer_id: String,
}

impl RelationshipDefaults {
    pub fn category_for(&self, kind: ListingKind) -> &str {
        match kind {
            ListingKind::Property => &self.property_type_id,
            ListingKind::Land => &self.land_type_id,
        }
    }
}

impl Default for RelationshipDefaults {
    fn default() -> Self {
        Self {
            location_id: DEFAULT_LOCATION_ID.to_string(),
            property_type_id: DEFAULT_PROPERTY_TYPE_ID.to_string(),
            land_type_id: DEFAULT_LAND_TYPE_ID.to_string(),
            reviewer_id: DEFAULT_REVIEWER_ID.to_string(),
        }
    }
}

/// Connection settings for the listing directory backend.
///
/// Credentials are optional here on purpose: a missing client id or secret
/// surfaces as `CONFIG_ERROR` on the first token refresh, not at startup.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub base_url: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scope: Option<String>,
    pub token_path: String,
    pub public_site_url: String,
    pub token_safety_buffer: Duration,
    pub defaults: RelationshipDefaults,
}

impl DirectoryConfig {
    pub fn from_env() -> Self {
        let base_url = env_non_empty("DIRECTORY_BASE_URL")
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let public_site_url = env_non_empty("PUBLIC_SITE_URL").unwrap_or_else(|| base_url.clone());
        let token_safety_buffer = env::var("TOKEN_SAFETY_BUFFER_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(300));
        let fallback = RelationshipDefaults::default();
        Self {
            base_url: trim_slash(&base_url),
            client_id: env_non_empty("DIRECTORY_CLIENT_ID"),
            client_secret: env_non_empty("DIRECTORY_CLIENT_SECRET"),
            scope: env_non_empty("DIRECTORY_SCOPE"),
            token_path: env_non_empty("DIRECTORY_TOKEN_PATH")
                .unwrap_or_else(|| DEFAULT_TOKEN_PATH.to_string()),
            public_site_url: trim_slash(&public_site_url),
            token_safety_buffer,
            defaults: RelationshipDefaults {
                location_id: env_non_empty("DEFAULT_LOCATION_ID").unwrap_or(fallback.location_id),
                property_type_id: env_non_empty("DEFAULT_PROPERTY_TYPE_ID")
                    .unwrap_or(fallback.property_type_id),
                land_type_id: env_non_empty("DEFAULT_LAND_TYPE_ID")
                    .unwrap_or(fallback.land_type_id),
                reviewer_id: env_non_empty("DEFAULT_REVIEWER_ID").unwrap_or(fallback.reviewer_id),
            },
        }
    }

    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) => Some((id, secret)),
            _ => None,
        }
    }

    pub fn token_url(&self) -> String {
        let path = self.token_path.trim_start_matches('/');
        format!("{}/{path}", self.base_url)
    }

    pub fn resource_url(&self, kind: ListingKind) -> String {
        format!("{}/jsonapi/node/{}", self.base_url, kind.bundle())
    }

    pub fn asset_url(&self, kind: ListingKind) -> String {
        format!("{}/jsonapi/node/{}/field_images", self.base_url, kind.bundle())
    }

    pub fn public_url(&self, kind: ListingKind, external_id: &str) -> String {
        format!("{}/{}/{external_id}", self.public_site_url, kind.bundle())
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn trim_slash(value: &str) -> String {
    value.trim().trim_end_matches('/').to_string()
}
