use crate::directory::BulkUploadReport;
use crate::error::ErrorCode;
use crate::models::{AttemptStatus, Listing, ListingStatus, StageReport, UploadAttempt};
use crate::publisher::ListingPublisher;
use crate::store::{PersistenceGateway, StatusUpdate, StoreError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What one publish run did to a listing.
#[derive(Debug, Clone, Serialize)]
pub struct PublicationReport {
    pub listing_id: Uuid,
    pub attempt_number: u32,
    pub status: ListingStatus,
    pub attempt_status: AttemptStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,
    /// HTTP status the directory answered with, when it answered at all.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_status: Option<u16>,
    /// Safe for end users; upstream detail stays in the attempt row.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assets: Option<BulkUploadReport>,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("publish task for listing {id} did not finish: {reason}")]
    Interrupted { id: Uuid, reason: String },
}

/// Moves listings through the publish state machine and keeps the attempt log.
#[derive(Clone)]
pub struct PublicationService {
    store: Arc<dyn PersistenceGateway>,
    publisher: Arc<ListingPublisher>,
}

impl PublicationService {
    pub fn new(store: Arc<dyn PersistenceGateway>, publisher: Arc<ListingPublisher>) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> &Arc<dyn PersistenceGateway> {
        &self.store
    }

    pub fn publisher(&self) -> &Arc<ListingPublisher> {
        &self.publisher
    }

    /// draft or failed → queued.
    pub async fn enqueue(&self, id: Uuid) -> Result<Listing, StoreError> {
        self.store
            .update_status(StatusUpdate::to(id, ListingStatus::Queued))
            .await
    }

    /// queued → uploading → uploaded | failed, recording one attempt.
    ///
    /// Publish failures are part of the report; only store errors are returned.
    pub async fn process(&self, id: Uuid) -> Result<PublicationReport, StoreError> {
        let listing = self
            .store
            .update_status(StatusUpdate::to(id, ListingStatus::Uploading))
            .await?;
        match self.run_attempt(listing).await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.release(id, &err).await;
                Err(err)
            }
        }
    }

    /// Best effort: a listing never stays `uploading` after its run ended.
    async fn release(&self, id: Uuid, cause: &StoreError) {
        match self
            .store
            .update_status(StatusUpdate::to(id, ListingStatus::Failed))
            .await
        {
            Ok(_) => warn!(
                target = "realty.publisher",
                listing_id = %id,
                cause = %cause,
                "listing_released_after_store_error"
            ),
            Err(err) => error!(
                target = "realty.publisher",
                listing_id = %id,
                cause = %cause,
                error = %err,
                "listing_release_failed"
            ),
        }
    }

    async fn run_attempt(&self, listing: Listing) -> Result<PublicationReport, StoreError> {
        let id = listing.id;
        let attempt_number = self.store.next_attempt_number(id).await?;
        let started_at = Utc::now();
        let timer = Instant::now();

        let result = self.publisher.publish(&listing).await;
        let duration_ms = timer.elapsed().as_millis() as u64;
        let finished_at = Utc::now();

        match result {
            Ok(outcome) => {
                self.store
                    .record_attempt(UploadAttempt {
                        listing_id: id,
                        attempt_number,
                        status: AttemptStatus::Success,
                        error_code: None,
                        error_message: None,
                        raw_response: Some(outcome.raw_response.clone()),
                        duration_ms,
                        started_at,
                        finished_at,
                    })
                    .await?;
                let listing = self
                    .store
                    .update_status(StatusUpdate {
                        external_id: Some(outcome.external_id.clone()),
                        external_url: Some(outcome.external_url.clone()),
                        published_at: Some(finished_at),
                        reference_id: Some(outcome.reference_id.clone()),
                        ..StatusUpdate::to(id, ListingStatus::Uploaded)
                    })
                    .await?;
                info!(
                    target = "realty.publisher",
                    listing_id = %id,
                    attempt = attempt_number,
                    external_url = %outcome.external_url,
                    "listing_published"
                );
                Ok(PublicationReport {
                    listing_id: id,
                    attempt_number,
                    status: listing.status,
                    attempt_status: AttemptStatus::Success,
                    external_id: Some(outcome.external_id),
                    external_url: Some(outcome.external_url),
                    reference_id: Some(outcome.reference_id),
                    error_code: None,
                    upstream_status: None,
                    message: None,
                    assets: Some(outcome.assets),
                    stages: outcome.stages,
                })
            }
            Err(err) => {
                let attempt_status = err.attempt_status();
                self.store
                    .record_attempt(UploadAttempt {
                        listing_id: id,
                        attempt_number,
                        status: attempt_status,
                        error_code: Some(err.code().as_str().to_string()),
                        error_message: Some(err.message().to_string()),
                        raw_response: err.raw().cloned(),
                        duration_ms,
                        started_at,
                        finished_at,
                    })
                    .await?;
                let listing = self
                    .store
                    .update_status(StatusUpdate::to(id, ListingStatus::Failed))
                    .await?;
                warn!(
                    target = "realty.publisher",
                    listing_id = %id,
                    attempt = attempt_number,
                    code = err.code().as_str(),
                    retryable = err.is_retryable(),
                    error = %err,
                    "listing_publish_failed"
                );
                Ok(PublicationReport {
                    listing_id: id,
                    attempt_number,
                    status: listing.status,
                    attempt_status,
                    external_id: None,
                    external_url: None,
                    reference_id: None,
                    error_code: Some(err.code()),
                    upstream_status: err.http_status(),
                    message: Some(err.user_message()),
                    assets: None,
                    stages: Vec::new(),
                })
            }
        }
    }

    /// `enqueue` then `process` on a detached task, so the run completes
    /// and is recorded even if the caller stops waiting.
    pub async fn publish_now(&self, id: Uuid) -> Result<PublicationReport, ProcessError> {
        let service = self.clone();
        let run = tokio::spawn(async move {
            service.enqueue(id).await?;
            service.process(id).await
        });
        match run.await {
            Ok(result) => result.map_err(ProcessError::from),
            Err(err) => Err(ProcessError::Interrupted {
                id,
                reason: err.to_string(),
            }),
        }
    }
}
