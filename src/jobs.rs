use crate::{
    publication::{PublicationReport, PublicationService},
    security::AgentContext,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{error, info, warn};
use uuid::Uuid;

type Statuses = Arc<Mutex<HashMap<Uuid, JobInfo>>>;

/// Background publishing. The worker drains the channel and spawns one task
/// per job, so listings never wait on each other.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Statuses,
    service: PublicationService,
}

struct Job {
    id: Uuid,
    listing_id: Uuid,
    context: AgentContext,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed { report: PublicationReport },
    Failed { error: String },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: Uuid,
    pub listing_id: Uuid,
    #[serde(flatten)]
    pub state: JobState,
}

impl JobQueue {
    pub fn spawn(service: PublicationService) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(queue_capacity_from_env());
        let statuses: Statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();
        let service_bg = service.clone();

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                tokio::spawn(run_job(service_bg.clone(), statuses_bg.clone(), job));
            }
        });

        (
            Self {
                tx,
                statuses,
                service,
            },
            handle,
        )
    }

    /// The listing is already `queued` when this is called, so the job must
    /// run: without a worker it is started on its own task.
    pub async fn enqueue_publish(&self, listing_id: Uuid, context: AgentContext) -> Uuid {
        let id = Uuid::new_v4();
        self.statuses.lock().await.insert(
            id,
            JobInfo {
                id,
                listing_id,
                state: JobState::Queued,
            },
        );
        let job = Job {
            id,
            listing_id,
            context,
        };
        if let Err(mpsc::error::SendError(job)) = self.tx.send(job).await {
            warn!(
                target = "realty.jobs",
                job_id = %id,
                listing_id = %listing_id,
                "publish_worker_gone_running_detached"
            );
            tokio::spawn(run_job(self.service.clone(), self.statuses.clone(), job));
        }
        id
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        self.statuses.lock().await.get(&id).cloned()
    }
}

async fn run_job(service: PublicationService, statuses: Statuses, job: Job) {
    set_state(&statuses, job.id, JobState::Running).await;
    info!(
        target = "realty.jobs",
        job_id = %job.id,
        listing_id = %job.listing_id,
        agent_id = %job.context.agent_id,
        "publish_job_started"
    );
    let state = match service.process(job.listing_id).await {
        Ok(report) => JobState::Completed { report },
        Err(err) => {
            error!(
                target = "realty.jobs",
                job_id = %job.id,
                listing_id = %job.listing_id,
                error = %err,
                "publish_job_failed"
            );
            JobState::Failed {
                error: err.to_string(),
            }
        }
    };
    set_state(&statuses, job.id, state).await;
}

async fn set_state(statuses: &Statuses, id: Uuid, state: JobState) {
    if let Some(info) = statuses.lock().await.get_mut(&id) {
        info.state = state;
    }
}

fn queue_capacity_from_env() -> usize {
    std::env::var("QUEUE_CAPACITY")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(64)
}
