//! Remote repository listing.
//!
//! The engine only needs one thing from a model hub: the files (with sizes)
//! behind a repository coordinate. Search, pagination, and metadata belong to
//! the caller.

use crate::config::NetworkConfig;
use crate::error::{FetchError, Result};
use crate::model_library::types::RemoteFile;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::{debug, info};

/// Resolves a repository coordinate to its file list.
#[async_trait]
pub trait RemoteRepository: Send + Sync {
    async fn list_files(&self, coordinate: &str) -> Result<Vec<RemoteFile>>;
}

/// Entry from the HuggingFace tree API.
#[derive(Debug, Deserialize)]
struct HfTreeEntry {
    path: String,
    #[serde(default, rename = "type")]
    entry_type: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    lfs: Option<HfLfsInfo>,
}

/// LFS pointer information. `size` is the real object size.
#[derive(Debug, Deserialize)]
struct HfLfsInfo {
    size: u64,
}

/// [`RemoteRepository`] over the HuggingFace Hub tree API.
#[derive(Debug, Clone)]
pub struct HuggingFaceRepository {
    client: Client,
    base_url: String,
    revision: String,
    auth_token: Option<String>,
}

impl HuggingFaceRepository {
    pub fn new(base_url: impl Into<String>, revision: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(NetworkConfig::API_REQUEST_TIMEOUT)
            .user_agent(NetworkConfig::USER_AGENT)
            .build()
            .map_err(|e| FetchError::Network {
                message: format!("Failed to create HTTP client: {}", e),
                cause: None,
            })?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            revision: revision.into(),
            auth_token: None,
        })
    }

    /// Attach a bearer token for gated or private repositories.
    pub fn with_auth_token(mut self, token: Option<String>) -> Self {
        self.auth_token = token.map(|t| t.trim().to_string()).filter(|t| !t.is_empty());
        self
    }

    fn tree_url(&self, coordinate: &str) -> String {
        format!(
            "{}/api/models/{}/tree/{}?recursive=true",
            self.base_url,
            coordinate,
            urlencoding::encode(&self.revision)
        )
    }
}

#[async_trait]
impl RemoteRepository for HuggingFaceRepository {
    async fn list_files(&self, coordinate: &str) -> Result<Vec<RemoteFile>> {
        let url = self.tree_url(coordinate);
        debug!("Listing repository files from {}", url);

        let mut request = self.client.get(&url);
        if let Some(ref token) = self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| FetchError::Network {
            message: format!("Failed to fetch repo tree: {}", e),
            cause: Some(e.to_string()),
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::ModelNotFound {
                model_id: coordinate.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Network {
                message: format!("Model hub returned {} for {}", status, coordinate),
                cause: None,
            });
        }

        let entries: Vec<HfTreeEntry> = response.json().await.map_err(|e| FetchError::Json {
            message: format!("Failed to parse file tree: {}", e),
            source: None,
        })?;

        let files = files_from_tree(entries);
        info!("Repository {} lists {} files", coordinate, files.len());
        Ok(files)
    }
}

fn files_from_tree(entries: Vec<HfTreeEntry>) -> Vec<RemoteFile> {
    entries
        .into_iter()
        .filter(|e| e.entry_type.as_deref().unwrap_or("file") == "file")
        .map(|e| {
            let size = e.lfs.map(|l| l.size).or(e.size).unwrap_or(0);
            RemoteFile::new(e.path, size)
        })
        .collect()
}

/// [`RemoteRepository`] answering from a fixed in-memory table.
#[derive(Debug, Default)]
pub struct StaticRepository {
    repos: RwLock<HashMap<String, Vec<RemoteFile>>>,
}

impl StaticRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(self, coordinate: &str, files: Vec<RemoteFile>) -> Self {
        self.insert(coordinate, files);
        self
    }

    pub fn insert(&self, coordinate: &str, files: Vec<RemoteFile>) {
        self.repos
            .write()
            .expect("repository lock poisoned")
            .insert(coordinate.to_string(), files);
    }
}

#[async_trait]
impl RemoteRepository for StaticRepository {
    async fn list_files(&self, coordinate: &str) -> Result<Vec<RemoteFile>> {
        self.repos
            .read()
            .expect("repository lock poisoned")
            .get(coordinate)
            .cloned()
            .ok_or_else(|| FetchError::ModelNotFound {
                model_id: coordinate.to_string(),
            })
    }
}
