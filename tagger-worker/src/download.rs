//! Fetches a submitted video URL to a local file under the download root.
//! Layout is `{root}/{YYYY}/{MM}/{task_id}/{filename}`; the worker holds at
//! most one downloaded file at a time and removes it when the task leaves
//! processing.

use std::path::{Path, PathBuf};
use std::time;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("download responded with status {0}")]
    BadStatus(u16),
    #[error("video exceeds the {limit_mb} MB limit")]
    TooLarge { limit_mb: u64 },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Downloader {
    client: reqwest::Client,
    root: PathBuf,
    max_size_bytes: u64,
    allowed_formats: Vec<String>,
}

impl Downloader {
    pub fn new(
        root: &str,
        max_size_mb: u64,
        allowed_formats: Vec<String>,
        timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .user_agent("vision-tagger worker")
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            root: PathBuf::from(root),
            max_size_bytes: max_size_mb * 1024 * 1024,
            allowed_formats,
        })
    }

    /// Stream the URL to disk, enforcing the size cap as bytes arrive. A
    /// partial file never survives a failure.
    pub async fn fetch(&self, url: &str, task_id: &str) -> Result<PathBuf, DownloadError> {
        let directory = self.task_directory(task_id);
        tokio::fs::create_dir_all(&directory).await?;
        let path = directory.join(valid_filename(url, task_id, &self.allowed_formats));

        match self.fetch_to(url, &path).await {
            Ok(()) => {
                info!(task_id, path = %path.display(), "video downloaded");
                Ok(path)
            }
            Err(err) => {
                if let Err(remove_err) = tokio::fs::remove_file(&path).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            "failed to remove partial download {}: {}",
                            path.display(),
                            remove_err
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn fetch_to(&self, url: &str, path: &Path) -> Result<(), DownloadError> {
        let response = self.client.get(url).send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(DownloadError::BadStatus(response.status().as_u16()));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            downloaded += chunk.len() as u64;
            if downloaded > self.max_size_bytes {
                return Err(DownloadError::TooLarge {
                    limit_mb: self.max_size_bytes / (1024 * 1024),
                });
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(())
    }

    /// Remove the downloaded file and prune its task directory when empty.
    pub async fn cleanup(&self, path: &Path) {
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!("removed local file {}", path.display()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to remove local file {}: {}", path.display(), err),
        }
        if let Some(parent) = path.parent() {
            // Fails while other files remain, which is fine.
            drop(tokio::fs::remove_dir(parent).await);
        }
    }

    fn task_directory(&self, task_id: &str) -> PathBuf {
        let now = chrono::Utc::now();
        self.root
            .join(now.format("%Y").to_string())
            .join(now.format("%m").to_string())
            .join(task_id)
    }
}

/// Keep the URL's basename when its extension is allowed, otherwise fall
/// back to `{task_id}.mp4`.
fn valid_filename(url: &str, task_id: &str, allowed_formats: &[String]) -> String {
    let basename = url
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .split('?')
        .next()
        .unwrap_or_default();
    let extension = basename.rsplit('.').next().unwrap_or_default().to_lowercase();

    if !basename.is_empty()
        && basename.contains('.')
        && allowed_formats.iter().any(|format| *format == extension)
    {
        basename.to_owned()
    } else {
        format!("{}.mp4", task_id)
    }
}
