use crate::{FileLoadingProgress, FileSource};
use hf_hub::{Repo, RepoType};
use httpdate::parse_http_date;
use reqwest::header::{HeaderValue, CONTENT_LENGTH, LAST_MODIFIED, RANGE};
use reqwest::{IntoUrl, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// An error fetching a checkpoint file.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The Hugging Face API could not be created.
    #[error("Hugging Face API error: {0}")]
    HuggingFaceApi(#[from] hf_hub::api::sync::ApiError),
    /// The local file does not exist.
    #[error("File {0} does not exist")]
    MissingLocalFile(PathBuf),
    /// The metadata of a cached file could not be read.
    #[error("Unable to get file metadata for {0}: {1}")]
    UnableToGetFileMetadata(PathBuf, #[source] std::io::Error),
    /// Reading or writing the cache failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with something other than the file.
    #[error("Unexpected status code: {0}")]
    UnexpectedStatusCode(StatusCode),
}

/// A directory that Hugging Face files are downloaded into.
#[derive(Debug, Clone)]
pub struct Cache {
    location: PathBuf,
    /// The huggingface token to use (defaults to the token set with `huggingface-cli login`)
    huggingface_token: Option<String>,
}

impl Cache {
    /// Create a new cache with a specific location
    pub fn new(location: PathBuf) -> Self {
        Self {
            location,
            huggingface_token: None,
        }
    }

    /// Set the Hugging Face token to use for downloading (defaults to the token set with `huggingface-cli login`, and then the environment variable `HF_TOKEN`)
    pub fn with_huggingface_token(mut self, token: Option<String>) -> Self {
        self.huggingface_token = token;
        self
    }

    /// The directory files are downloaded into.
    pub fn location(&self) -> &Path {
        &self.location
    }

    fn download_path(&self, model_id: &str, revision: &str, file: &str) -> PathBuf {
        self.location.join(model_id).join(revision).join(file)
    }

    /// Check if the file exists locally (if it is a local file or if it has been downloaded)
    pub fn exists(&self, source: &FileSource) -> bool {
        match source {
            FileSource::HuggingFace {
                model_id,
                revision,
                file,
            } => self.download_path(model_id, revision, file).exists(),
            FileSource::Local(path) => path.exists(),
        }
    }

    /// Get the file from the cache, downloading it if necessary
    pub async fn get(
        &self,
        source: &FileSource,
        progress: impl FnMut(FileLoadingProgress),
    ) -> Result<PathBuf, CacheError> {
        match source {
            FileSource::HuggingFace {
                model_id,
                revision,
                file,
            } => {
                let token = self.huggingface_token.clone().or_else(huggingface_token);
                let complete_download = self.download_path(model_id, revision, file);

                let repo = Repo::with_revision(
                    model_id.to_string(),
                    RepoType::Model,
                    revision.to_string(),
                );
                let api = hf_hub::api::sync::Api::new()?.repo(repo);
                let url = api.url(file);
                let client = reqwest::Client::new();
                tracing::trace!("Fetching metadata for {file} from {url}");
                let response = client
                    .head(&url)
                    .with_authorization_header(token.clone())
                    .send()
                    .await;

                if complete_download.exists() {
                    let metadata = tokio::fs::metadata(&complete_download).await.map_err(|e| {
                        CacheError::UnableToGetFileMetadata(complete_download.clone(), e)
                    })?;
                    let file_last_modified = metadata.modified()?;
                    let last_updated = response
                        .as_ref()
                        .ok()
                        .and_then(|response| response.headers().get(LAST_MODIFIED))
                        .and_then(|last_updated| last_updated.to_str().ok())
                        .and_then(|s| parse_http_date(s).ok());
                    match last_updated {
                        Some(last_updated) if last_updated > file_last_modified => {
                            tracing::info!("{source} changed upstream, downloading it again");
                            tokio::fs::remove_file(&complete_download).await?;
                        }
                        // Unchanged, or we are offline
                        _ => return Ok(complete_download),
                    }
                }

                let mut incomplete_download = complete_download.clone().into_os_string();
                incomplete_download.push(".partial");
                let incomplete_download = PathBuf::from(incomplete_download);

                tracing::debug!("Downloading {source} into {}", incomplete_download.display());

                download_into(
                    url,
                    &incomplete_download,
                    response?,
                    client,
                    token,
                    progress,
                )
                .await?;

                tokio::fs::rename(&incomplete_download, &complete_download).await?;

                Ok(complete_download)
            }
            FileSource::Local(path) => {
                if path.exists() {
                    Ok(path.clone())
                } else {
                    Err(CacheError::MissingLocalFile(path.clone()))
                }
            }
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        let location = dirs::data_dir()
            .map(|dir| dir.join("rtlgen"))
            .unwrap_or_else(|| PathBuf::from(".rtlgen"))
            .join("cache");
        Self::new(location)
    }
}

async fn download_into<U: IntoUrl>(
    url: U,
    file: &Path,
    head: Response,
    client: reqwest::Client,
    token: Option<String>,
    mut progress: impl FnMut(FileLoadingProgress),
) -> Result<(), CacheError> {
    let status = head.status();
    if !status.is_success() {
        return Err(CacheError::UnexpectedStatusCode(status));
    }
    let length = head
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|length| length.to_str().ok())
        .and_then(|length| length.parse::<u64>().ok());

    let (start, mut output_file) = match tokio::fs::metadata(file).await {
        Ok(metadata) => {
            let output_file = OpenOptions::new().append(true).open(file).await?;
            (metadata.len(), output_file)
        }
        Err(_) => {
            if let Some(parent) = file.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            (0, File::create(file).await?)
        }
    };
    let start_time = Instant::now();

    if let Some(length) = length {
        progress(FileLoadingProgress {
            progress: start,
            cached_size: start,
            size: length,
            start_time,
        });
        if start == length {
            tracing::trace!("File {} already downloaded", file.display());
            return Ok(());
        }
    }

    let range = length
        .filter(|length| start < *length)
        .and_then(|length| HeaderValue::from_str(&format!("bytes={}-{}", start, length - 1)).ok());

    tracing::trace!("Fetching range {:?}", range);
    let mut request = client.get(url).with_authorization_header(token);
    if let Some(range) = range {
        request = request.header(RANGE, range);
    }
    let mut response = request.send().await?;

    let status = response.status();
    let mut current_progress = match status {
        StatusCode::PARTIAL_CONTENT => start,
        StatusCode::OK => {
            // The server ignored the range, start over
            output_file = File::create(file).await?;
            0
        }
        _ => return Err(CacheError::UnexpectedStatusCode(status)),
    };

    while let Some(chunk) = response.chunk().await? {
        output_file.write_all(&chunk).await?;
        current_progress += chunk.len() as u64;
        if let Some(length) = length {
            progress(FileLoadingProgress {
                progress: current_progress,
                cached_size: start,
                size: length,
                start_time,
            });
        }
    }
    output_file.flush().await?;

    tracing::trace!("Download of {} complete", file.display());

    Ok(())
}

trait RequestBuilderExt {
    fn with_authorization_header(self, token: Option<String>) -> Self;
}

impl RequestBuilderExt for reqwest::RequestBuilder {
    fn with_authorization_header(self, token: Option<String>) -> Self {
        if let Some(token) = token {
            self.header(reqwest::header::AUTHORIZATION, format!("Bearer {token}"))
        } else {
            self
        }
    }
}

fn huggingface_token() -> Option<String> {
    let cache = hf_hub::Cache::default();
    cache.token().or_else(|| std::env::var("HF_TOKEN").ok())
}
