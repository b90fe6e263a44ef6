use thiserror::Error;

use tagger_common::queue::QueueError;
use tagger_common::store::StoreError;

use crate::download::DownloadError;
use crate::provider::ProviderError;

/// A whole-job failure: anything that aborts the task before its result
/// bundle is durably persisted. These count against the retry budget;
/// per-dimension failures do not, they are recorded in the bundle instead.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("video download failed: {0}")]
    Download(#[from] DownloadError),
    #[error("file upload failed: {0}")]
    Upload(ProviderError),
    #[error("failed to persist results: {0}")]
    Persist(#[from] StoreError),
    #[error("queue operation failed: {0}")]
    Queue(#[from] QueueError),
}

/// Errors surfacing from one pass of the worker loop. The loop logs these,
/// sleeps, and keeps going; nothing escapes it.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("an error occurred in the queue substrate")]
    QueueError(#[from] QueueError),
    #[error("an error occurred in the task store")]
    StoreError(#[from] StoreError),
}
