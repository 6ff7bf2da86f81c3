//! `Download`: fetch a list of URLs into a directory.

use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, TaskError};
use crate::registry::BuiltinTask;

/// The `Download` parameter value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRequest {
    /// Maximum downloads in flight. Zero or missing means one.
    #[serde(rename = "workersnum", default)]
    pub workers: usize,
    #[serde(rename = "fileurls")]
    pub file_urls: Vec<String>,
    #[serde(rename = "destpath", default)]
    pub dest_path: String,
}

impl DownloadRequest {
    pub fn parse(value: &str) -> Result<Self> {
        let request: Self = serde_json::from_str(value)
            .map_err(|e| invalid(format!("malformed request: {e}")))?;
        if request.file_urls.is_empty() {
            return Err(invalid("no file URLs given".into()));
        }
        for url in &request.file_urls {
            file_name_for(url)?;
        }
        Ok(request)
    }

    pub fn concurrency(&self) -> usize {
        self.workers.max(1)
    }

    fn destination(&self) -> PathBuf {
        if self.dest_path.trim().is_empty() {
            PathBuf::from(".")
        } else {
            PathBuf::from(&self.dest_path)
        }
    }
}

/// Local file name for `url`: the last non-empty path segment, without the
/// query string or fragment.
pub fn file_name_for(url: &str) -> Result<String> {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or_default();
    // The first segment is the host.
    let name = path
        .split('/')
        .skip(1)
        .filter(|s| !s.is_empty())
        .last()
        .filter(|s| *s != "." && *s != "..");
    name.map(str::to_string)
        .ok_or_else(|| invalid(format!("cannot derive a file name from '{url}'")))
}

fn invalid(reason: String) -> TaskError {
    TaskError::InvalidParameter {
        task: "Download",
        reason,
    }
}

pub struct DownloadTask {
    client: reqwest::Client,
}

impl DownloadTask {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

async fn fetch(client: reqwest::Client, url: String, dest: PathBuf) -> Result<PathBuf> {
    let target = dest.join(file_name_for(&url)?);
    debug!(url = %url, target = %target.display(), "downloading");

    let response = client.get(&url).send().await?.error_for_status()?;
    let bytes = response.bytes().await?;
    tokio::fs::write(&target, &bytes).await?;
    Ok(target)
}

#[async_trait]
impl BuiltinTask for DownloadTask {
    async fn run(&self, value: &str) -> Result<()> {
        let request = DownloadRequest::parse(value)?;
        let dest = request.destination();
        tokio::fs::create_dir_all(&dest).await?;

        let fetches: Vec<_> = request
            .file_urls
            .iter()
            .map(|url| Box::pin(fetch(self.client.clone(), url.clone(), dest.clone())))
            .collect();
        let files = stream::iter(fetches)
            .buffer_unordered(request.concurrency())
            .try_collect::<Vec<PathBuf>>()
            .await?;

        info!(count = files.len(), dest = %dest.display(), "download finished");
        Ok(())
    }
}
