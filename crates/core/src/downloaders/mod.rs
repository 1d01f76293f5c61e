pub mod huggingface;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Make `filename` from `repo_id` available locally and return its path
    async fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf>;
}

pub use huggingface::HuggingFaceDownloader;
