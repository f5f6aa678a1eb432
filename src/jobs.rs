use crate::{
    config::JobsConfig,
    models::{PipelineRunRequest, PipelineRunResponse},
    pipeline::Pipeline,
};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;
use tokio::{
    sync::{Mutex, Semaphore, mpsc},
    task::JoinHandle,
};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
    statuses: Arc<Mutex<HashMap<Uuid, JobState>>>,
}

struct Job {
    id: Uuid,
    request: PipelineRunRequest,
}

#[derive(Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Completed {
        result: PipelineRunResponse,
    },
    Failed {
        error: String,
        stage: Option<String>,
        kind: Option<String>,
    },
}

#[derive(Clone, Serialize)]
pub struct JobInfo {
    pub id: String,
    #[serde(flatten)]
    pub state: JobState,
}

#[derive(Debug, Error)]
#[error("job worker is not accepting work")]
pub struct EnqueueError;

impl JobQueue {
    /// Starts the dispatcher. Runs are independent, so up to
    /// `config.concurrency` of them execute at once.
    pub fn spawn(pipeline: Pipeline, config: &JobsConfig) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let statuses = Arc::new(Mutex::new(HashMap::new()));
        let statuses_bg = statuses.clone();
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));

        let handle = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let Ok(permit) = permits.clone().acquire_owned().await else {
                    break;
                };
                let pipeline = pipeline.clone();
                let statuses = statuses_bg.clone();
                tokio::spawn(async move {
                    statuses.lock().await.insert(job.id, JobState::Running);
                    info!(target = "studio.pipeline", job_id = %job.id, "job_started");

                    let state = match pipeline.run(job.request).await {
                        Ok(result) => JobState::Completed { result },
                        Err(err) => {
                            warn!(target = "studio.pipeline", job_id = %job.id, stage = err.stage(), "job_failed");
                            JobState::Failed {
                                error: err.detail().to_string(),
                                stage: Some(err.stage().to_string()),
                                kind: Some(err.kind().as_str().to_string()),
                            }
                        }
                    };
                    statuses.lock().await.insert(job.id, state);
                    drop(permit);
                });
            }
        });

        (Self { tx, statuses }, handle)
    }

    pub async fn enqueue_run(&self, request: PipelineRunRequest) -> Result<Uuid, EnqueueError> {
        let id = Uuid::new_v4();
        self.statuses.lock().await.insert(id, JobState::Queued);
        if self.tx.send(Job { id, request }).await.is_err() {
            self.statuses.lock().await.remove(&id);
            return Err(EnqueueError);
        }
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Option<JobInfo> {
        let guard = self.statuses.lock().await;
        guard.get(&id).cloned().map(|state| JobInfo {
            id: id.to_string(),
            state,
        })
    }
}
