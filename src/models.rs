use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DisplayFromStr, OneOrMany, PickFirst, serde_as};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListingKind {
    Property,
    Land,
}

impl ListingKind {
    pub fn bundle(&self) -> &'static str {
        match self {
            ListingKind::Property => "property",
            ListingKind::Land => "land",
        }
    }

    pub fn resource_type(&self) -> &'static str {
        match self {
            ListingKind::Property => "node--property",
            ListingKind::Land => "node--land",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DealType {
    #[default]
    Sale,
    Rent,
}

impl DealType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DealType::Sale => "sale",
            DealType::Rent => "rent",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Draft,
    Queued,
    Uploading,
    Uploaded,
    Failed,
}

impl ListingStatus {
    /// draft → queued → uploading → {uploaded | failed}; failed may be queued again.
    pub fn can_transition_to(self, next: ListingStatus) -> bool {
        use ListingStatus::*;
        matches!(
            (self, next),
            (Draft, Queued)
                | (Failed, Queued)
                | (Queued, Uploading)
                | (Uploading, Uploaded)
                | (Uploading, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Draft => "draft",
            ListingStatus::Queued => "queued",
            ListingStatus::Uploading => "uploading",
            ListingStatus::Uploaded => "uploaded",
            ListingStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OwnerContact {
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub title_deed: Option<String>,
}

/// Pre-resolved directory identifiers supplied by the caller. Not yet validated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelationshipRefs {
    #[serde(default)]
    pub location_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub feature_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

/// Inbound listing fields. Numeric fields accept JSON numbers or numeric strings.
#[serde_as]
#[derive(Debug, Clone, Deserialize)]
pub struct ListingDraft {
    pub kind: ListingKind,
    #[serde(default)]
    pub deal: DealType,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub price: Option<f64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub bedrooms: Option<u32>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub bathrooms: Option<u32>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub covered_area: Option<f64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub plot_area: Option<f64>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub geo: Option<GeoPoint>,
    #[serde(default)]
    pub owner: OwnerContact,
    #[serde(default)]
    pub relationships: RelationshipRefs,
    #[serde_as(as = "OneOrMany<_>")]
    #[serde(default)]
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub reference_id: Option<String>,
    #[serde(default)]
    pub submitter: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listing {
    pub id: Uuid,
    pub kind: ListingKind,
    pub deal: DealType,
    pub title: String,
    pub description: String,
    pub price: Option<f64>,
    pub currency: String,
    pub bedrooms: Option<u32>,
    pub bathrooms: Option<u32>,
    pub covered_area: Option<f64>,
    pub plot_area: Option<f64>,
    pub address: Option<String>,
    pub region: Option<String>,
    pub geo: Option<GeoPoint>,
    pub owner: OwnerContact,
    pub relationships: RelationshipRefs,
    pub image_urls: Vec<String>,
    pub submitter: Option<String>,
    pub status: ListingStatus,
    pub reference_id: Option<String>,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn from_draft(draft: ListingDraft, submitter_fallback: Option<&str>) -> Self {
        let now = Utc::now();
        let image_urls = draft
            .image_urls
            .into_iter()
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty())
            .collect();
        Self {
            id: Uuid::new_v4(),
            kind: draft.kind,
            deal: draft.deal,
            title: draft.title.trim().to_string(),
            description: draft.description,
            price: draft.price,
            currency: draft
                .currency
                .map(|c| c.trim().to_uppercase())
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "EUR".to_string()),
            bedrooms: draft.bedrooms,
            bathrooms: draft.bathrooms,
            covered_area: draft.covered_area,
            plot_area: draft.plot_area,
            address: draft.address,
            region: draft.region,
            geo: draft.geo,
            owner: draft.owner,
            relationships: draft.relationships,
            image_urls,
            submitter: draft
                .submitter
                .or_else(|| submitter_fallback.map(str::to_string)),
            status: ListingStatus::Draft,
            reference_id: draft.reference_id.filter(|r| !r.trim().is_empty()),
            external_id: None,
            external_url: None,
            published_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failed,
    Timeout,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadAttempt {
    pub listing_id: Uuid,
    pub attempt_number: u32,
    pub status: AttemptStatus,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub raw_response: Option<Value>,
    pub duration_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Timing and summary of one publish stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishAccepted {
    pub listing_id: Uuid,
    pub status: ListingStatus,
    pub job_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}
