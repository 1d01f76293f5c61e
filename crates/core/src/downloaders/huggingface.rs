use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Client;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use super::Downloader;

const HF_CDN_BASE: &str = "https://huggingface.co";

/// Downloads individual repository files into `<store>/<org>--<name>/<file>`
pub struct HuggingFaceDownloader {
    client: Client,
    store: PathBuf,
}

impl HuggingFaceDownloader {
    pub fn new(store: impl Into<PathBuf>, token: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {}", token))?,
            );
        }

        let client = Client::builder()
            .user_agent(concat!("faceforge/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            store: store.into(),
        })
    }

    /// Local directory for a repository, e.g. `stabilityai--stable-diffusion-xl-base-1.0`
    pub fn repo_dir(&self, repo_id: &str) -> PathBuf {
        self.store.join(repo_id.replace('/', "--"))
    }

    /// Path a file would have once fetched
    pub fn local_path(&self, repo_id: &str, filename: &str) -> PathBuf {
        self.repo_dir(repo_id).join(filename)
    }

    async fn download_file(&self, repo_id: &str, filename: &str, dest_path: &Path) -> Result<u64> {
        let url = format!("{}/{}/resolve/main/{}", HF_CDN_BASE, repo_id, filename);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to start download of {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to download {}: {}", filename, response.status());
        }

        let total_size = response.content_length().unwrap_or(0);

        let pb = ProgressBar::new(total_size);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")?
                .progress_chars("#>-"),
        );
        pb.set_message(filename.to_string());

        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Stream into a sibling file so an interrupted download never looks cached
        let partial_path = partial_path(dest_path);
        let mut file = File::create(&partial_path)
            .with_context(|| format!("Failed to create {:?}", partial_path))?;
        let mut downloaded: u64 = 0;
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("Error downloading chunk")?;
            file.write_all(&chunk)?;
            downloaded += chunk.len() as u64;
            pb.set_position(downloaded);
        }
        file.flush()?;
        drop(file);

        fs::rename(&partial_path, dest_path)
            .with_context(|| format!("Failed to move download into {:?}", dest_path))?;

        pb.finish_with_message(format!("Downloaded {}", filename));
        Ok(downloaded)
    }
}

/// `model.fp16.safetensors` downloads into `model.fp16.safetensors.part`
fn partial_path(dest_path: &Path) -> PathBuf {
    let mut name = dest_path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

#[async_trait]
impl Downloader for HuggingFaceDownloader {
    async fn fetch(&self, repo_id: &str, filename: &str) -> Result<PathBuf> {
        let dest_path = self.local_path(repo_id, filename);
        if dest_path.exists() {
            tracing::debug!("Using cached {}/{}", repo_id, filename);
            return Ok(dest_path);
        }

        tracing::info!("Downloading {}/{}", repo_id, filename);
        let size = self.download_file(repo_id, filename, &dest_path).await?;
        tracing::info!(
            "Downloaded {}/{} ({:.2} MB)",
            repo_id,
            filename,
            size as f64 / 1_048_576.0
        );
        Ok(dest_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_dir_flattens_org_separator() {
        let downloader = HuggingFaceDownloader::new("/models", None).unwrap();
        assert_eq!(
            downloader.local_path("openai/clip-vit-large-patch14", "tokenizer.json"),
            PathBuf::from("/models/openai--clip-vit-large-patch14/tokenizer.json")
        );
    }

    #[test]
    fn partial_path_keeps_every_extension() {
        let fp16 = partial_path(Path::new("/models/unet/model.fp16.safetensors"));
        let fp32 = partial_path(Path::new("/models/unet/model.fp16.bin"));
        assert_eq!(fp16, PathBuf::from("/models/unet/model.fp16.safetensors.part"));
        assert_ne!(fp16, fp32);
    }

    #[tokio::test]
    async fn cached_file_is_returned_without_network() {
        let store = std::env::temp_dir().join(format!("faceforge-dl-{}", std::process::id()));
        let downloader = HuggingFaceDownloader::new(&store, Some("hf_test")).unwrap();
        let path = downloader.local_path("org/repo", "unet/config.json");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, b"{}").unwrap();

        let fetched = downloader.fetch("org/repo", "unet/config.json").await.unwrap();
        assert_eq!(fetched, path);

        fs::remove_dir_all(&store).unwrap();
    }
}
