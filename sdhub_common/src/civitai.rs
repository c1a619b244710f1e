//! CivitAI checkpoint search and downloads.

use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::hub::{download_to, HubError};

pub const CIVITAI_ENDPOINT: &str = "https://civitai.com";

/// Checkpoints below this size are treated as failed downloads.
pub const MIN_CHECKPOINT_SIZE: u64 = 1024 * 1024 * 1024;

const SEARCH_LIMIT: usize = 25;

/// Model family a search is narrowed to, matched against each version's `baseModel`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BaseModel {
    #[default]
    Sd15,
    Sdxl,
    Other,
}

impl BaseModel {
    pub fn matches(&self, base_model: &str) -> bool {
        let sd15 = base_model.contains("SD 1.");
        let sdxl = base_model.contains("SDXL");
        match self {
            Self::Sd15 => sd15,
            Self::Sdxl => sdxl,
            Self::Other => !sd15 && !sdxl,
        }
    }
}

impl FromStr for BaseModel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace([' ', '.'], "").as_str() {
            "sd15" => Ok(Self::Sd15),
            "sdxl" => Ok(Self::Sdxl),
            "other" => Ok(Self::Other),
            _ => Err(format!("unknown base model `{s}`, expected sd15, sdxl or other")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CivitModel {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub stats: CivitStats,
    #[serde(default)]
    pub model_versions: Vec<CivitVersion>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CivitStats {
    #[serde(default)]
    pub download_count: u64,
    #[serde(default)]
    pub rating: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CivitVersion {
    pub id: u64,
    #[serde(default)]
    pub model_id: u64,
    pub name: String,
    #[serde(default)]
    pub base_model: String,
    pub created_at: Option<String>,
    #[serde(default)]
    pub images: Vec<CivitImage>,
    #[serde(default)]
    pub files: Vec<CivitFile>,
}

impl CivitVersion {
    /// First non-empty image URL, used as the model preview.
    pub fn preview_url(&self) -> Option<&str> {
        self.images
            .iter()
            .map(|image| image.url.as_str())
            .find(|url| !url.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CivitImage {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CivitFile {
    pub name: String,
    #[serde(rename = "sizeKB", default)]
    pub size_kb: f64,
    #[serde(default)]
    pub metadata: Value,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    items: Vec<CivitModel>,
}

/// Blocking client for the CivitAI REST API.
pub struct CivitClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    min_size: u64,
}

impl CivitClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, HubError> {
        let endpoint = endpoint.into();
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("sdhub/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| HubError::Request {
                url: endpoint.clone(),
                source,
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            min_size: MIN_CHECKPOINT_SIZE,
        })
    }

    /// Override the size below which a downloaded checkpoint is rejected.
    pub fn with_min_size(mut self, min_size: u64) -> Self {
        self.min_size = min_size;
        self
    }

    /// Newest checkpoints matching `name` and `tag` with at least one version of `base`.
    pub fn search(
        &self,
        name: Option<&str>,
        tag: Option<&str>,
        base: BaseModel,
    ) -> Result<Vec<CivitModel>, HubError> {
        let url = format!("{}/api/v1/models", self.endpoint);
        let mut query = vec![
            ("limit", SEARCH_LIMIT.to_string()),
            ("types", "Checkpoint".to_string()),
            ("sort", "Newest".to_string()),
        ];
        if let Some(name) = name.filter(|name| !name.is_empty()) {
            query.push(("query", name.to_string()));
        }
        if let Some(tag) = tag.filter(|tag| !tag.is_empty()) {
            query.push(("tag", tag.to_string()));
        }

        let request_err = |source| HubError::Request {
            url: url.clone(),
            source,
        };
        let response = self
            .client
            .get(&url)
            .query(&query)
            .send()
            .map_err(request_err)?;
        debug!("CivitAI search: name={name:?} tag={tag:?} status={}", response.status());
        if !response.status().is_success() {
            return Err(HubError::Status {
                url: url.clone(),
                status: response.status(),
            });
        }
        let page: SearchPage = response.json().map_err(request_err)?;
        Ok(page
            .items
            .into_iter()
            .filter(|model| {
                model
                    .model_versions
                    .iter()
                    .any(|version| base.matches(&version.base_model))
            })
            .collect())
    }

    /// Download a checkpoint to `dest`, then its preview image next to it as `.jpg`.
    ///
    /// An existing `dest` is left alone. A failed preview is logged and does not fail the
    /// download.
    pub fn download_model(
        &self,
        url: &str,
        dest: &Path,
        preview_url: Option<&str>,
    ) -> Result<PathBuf, HubError> {
        if dest.is_file() {
            warn!("CivitAI download: {} already exists", dest.display());
            return Ok(dest.to_path_buf());
        }
        let path = download_to(&self.client, url, dest, self.min_size)?;
        if let Some(preview_url) = preview_url.filter(|url| !url.is_empty()) {
            let preview = path.with_extension("jpg");
            match download_to(&self.client, preview_url, &preview, 0) {
                Ok(preview) => info!("CivitAI download: preview={}", preview.display()),
                Err(e) => warn!("CivitAI preview {preview_url}: {e}"),
            }
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_model_filter() {
        assert!(BaseModel::Sd15.matches("SD 1.5"));
        assert!(!BaseModel::Sd15.matches("SDXL 1.0"));
        assert!(BaseModel::Sdxl.matches("SDXL Turbo"));
        assert!(BaseModel::Other.matches("Pony"));
        assert!(!BaseModel::Other.matches("SD 1.4"));
        assert_eq!("SD 1.5".parse::<BaseModel>(), Ok(BaseModel::Sd15));
        assert_eq!("sdxl".parse::<BaseModel>(), Ok(BaseModel::Sdxl));
        assert!("flux".parse::<BaseModel>().is_err());
    }

    #[test]
    fn search_page_parses() {
        let page: SearchPage = serde_json::from_str(
            r#"{"items": [{
                "id": 4384, "name": "DreamShaper", "tags": ["anime"],
                "stats": {"downloadCount": 10, "rating": 4.9},
                "modelVersions": [{
                    "id": 128713, "modelId": 4384, "name": "8", "baseModel": "SD 1.5",
                    "createdAt": "2023-07-29T00:00:00.000Z",
                    "images": [{"url": ""}, {"url": "https://image.civitai.com/a.jpeg"}],
                    "files": [{"name": "dreamshaper_8.safetensors", "sizeKB": 2082642.5,
                               "metadata": {"fp": "fp16"},
                               "downloadUrl": "https://civitai.com/api/download/models/128713"}]
                }]
            }], "metadata": {}}"#,
        )
        .unwrap();
        let version = &page.items[0].model_versions[0];
        assert_eq!(version.preview_url(), Some("https://image.civitai.com/a.jpeg"));
        assert_eq!(version.files[0].size_kb.round(), 2082643.);
        assert_eq!(page.items[0].stats.download_count, 10);
    }
}
