use crate::models::{Listing, ListingStatus, UploadAttempt};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("listing {0} not found")]
    NotFound(Uuid),
    #[error("listing {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: &'static str,
        to: &'static str,
    },
    #[error("attempt {attempt} for listing {id} is not above {latest}")]
    StaleAttempt { id: Uuid, attempt: u32, latest: u32 },
    #[error("listing {0} already exists")]
    Duplicate(Uuid),
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub id: Uuid,
    pub status: ListingStatus,
    pub external_id: Option<String>,
    pub external_url: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub reference_id: Option<String>,
}

impl StatusUpdate {
    pub fn to(id: Uuid, status: ListingStatus) -> Self {
        Self {
            id,
            status,
            external_id: None,
            external_url: None,
            published_at: None,
            reference_id: None,
        }
    }
}

/// Where listings and their attempt history live.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn create_listing(&self, listing: Listing) -> Result<Listing, StoreError>;
    async fn listing(&self, id: Uuid) -> Result<Listing, StoreError>;
    async fn update_status(&self, update: StatusUpdate) -> Result<Listing, StoreError>;
    async fn next_attempt_number(&self, id: Uuid) -> Result<u32, StoreError>;
    async fn record_attempt(&self, attempt: UploadAttempt) -> Result<(), StoreError>;
    /// Ordered by attempt number.
    async fn attempts(&self, id: Uuid) -> Result<Vec<UploadAttempt>, StoreError>;
}

#[derive(Default)]
struct Tables {
    listings: HashMap<Uuid, Listing>,
    attempts: HashMap<Uuid, Vec<UploadAttempt>>,
}

/// Process-local store; state is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryStore {
    async fn create_listing(&self, listing: Listing) -> Result<Listing, StoreError> {
        let mut tables = self.tables.lock().await;
        if tables.listings.contains_key(&listing.id) {
            return Err(StoreError::Duplicate(listing.id));
        }
        debug!(target = "realty.store", listing_id = %listing.id, "listing_created");
        tables.listings.insert(listing.id, listing.clone());
        Ok(listing)
    }

    async fn listing(&self, id: Uuid) -> Result<Listing, StoreError> {
        let tables = self.tables.lock().await;
        tables
            .listings
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn update_status(&self, update: StatusUpdate) -> Result<Listing, StoreError> {
        let mut tables = self.tables.lock().await;
        let listing = tables
            .listings
            .get_mut(&update.id)
            .ok_or(StoreError::NotFound(update.id))?;
        if !listing.status.can_transition_to(update.status) {
            return Err(StoreError::InvalidTransition {
                id: update.id,
                from: listing.status.as_str(),
                to: update.status.as_str(),
            });
        }
        info!(
            target = "realty.store",
            listing_id = %update.id,
            from = listing.status.as_str(),
            to = update.status.as_str(),
            "listing_status_changed"
        );
        listing.status = update.status;
        listing.updated_at = Utc::now();
        if let Some(external_id) = update.external_id {
            listing.external_id = Some(external_id);
        }
        if let Some(external_url) = update.external_url {
            listing.external_url = Some(external_url);
        }
        if let Some(published_at) = update.published_at {
            listing.published_at = Some(published_at);
        }
        if let Some(reference_id) = update.reference_id {
            listing.reference_id = Some(reference_id);
        }
        Ok(listing.clone())
    }

    async fn next_attempt_number(&self, id: Uuid) -> Result<u32, StoreError> {
        let tables = self.tables.lock().await;
        if !tables.listings.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let latest = tables
            .attempts
            .get(&id)
            .and_then(|rows| rows.iter().map(|a| a.attempt_number).max())
            .unwrap_or(0);
        Ok(latest + 1)
    }

    async fn record_attempt(&self, attempt: UploadAttempt) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if !tables.listings.contains_key(&attempt.listing_id) {
            return Err(StoreError::NotFound(attempt.listing_id));
        }
        let rows = tables.attempts.entry(attempt.listing_id).or_default();
        let latest = rows.iter().map(|a| a.attempt_number).max().unwrap_or(0);
        if attempt.attempt_number <= latest {
            return Err(StoreError::StaleAttempt {
                id: attempt.listing_id,
                attempt: attempt.attempt_number,
                latest,
            });
        }
        info!(
            target = "realty.store",
            listing_id = %attempt.listing_id,
            attempt = attempt.attempt_number,
            status = ?attempt.status,
            duration_ms = attempt.duration_ms,
            "upload_attempt_recorded"
        );
        rows.push(attempt);
        Ok(())
    }

    async fn attempts(&self, id: Uuid) -> Result<Vec<UploadAttempt>, StoreError> {
        let tables = self.tables.lock().await;
        if !tables.listings.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        let mut rows = tables.attempts.get(&id).cloned().unwrap_or_default();
        rows.sort_by_key(|a| a.attempt_number);
        Ok(rows)
    }
}
