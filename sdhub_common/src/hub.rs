//! Hugging Face hub access: model search, model cards and downloads.

use std::{
    collections::{BTreeMap, HashSet},
    fs::{self, File},
    io::{self, BufWriter, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use hf_hub::{
    api::sync::{ApiBuilder, ApiError},
    Repo, RepoType,
};
use serde::{Deserialize, Serialize};
use indicatif::ProgressBar;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::{get_token, progress::download_bar, NiceProgressBar, TokenSource};

pub const DEFAULT_HUB_ENDPOINT: &str = "https://huggingface.co";

const MODEL_INDEX: &str = "model_index.json";

const USER_AGENT: &str = concat!("sdhub/", env!("CARGO_PKG_VERSION"));
const WEIGHT_EXTENSIONS: [&str; 2] = ["safetensors", "bin"];
/// Weight formats diffusers pipelines never load.
const IGNORED_EXTENSIONS: [&str; 9] = [
    "ckpt", "pt", "pth", "onnx", "onnx_data", "pb", "msgpack", "h5", "ot",
];

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("hub returned {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("could not read hub token: {0}")]
    Token(String),
    #[error("removed invalid download {path}: {written} bytes")]
    TooSmall { path: PathBuf, written: u64 },
    #[error("download of {url} incomplete: {written} of {expected} bytes")]
    Incomplete {
        url: String,
        written: u64,
        expected: u64,
    },
}

/// A search hit from the hub.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HubModel {
    pub name: String,
    pub downloads: u64,
    pub mtime: Option<String>,
    pub url: String,
    pub pipeline: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiModel {
    #[serde(alias = "modelId")]
    id: String,
    #[serde(default)]
    downloads: u64,
    #[serde(rename = "lastModified")]
    last_modified: Option<String>,
    pipeline_tag: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ApiModelInfo {
    #[serde(rename = "cardData")]
    card_data: Option<Value>,
}

/// Options for downloading a diffusers repository.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Cache directory; the hf-hub default cache when unset.
    pub cache_dir: Option<PathBuf>,
    /// Weight variant such as `fp16`.
    pub variant: Option<String>,
    pub revision: Option<String>,
}

/// Blocking client for the hub's HTTP API.
pub struct HubClient {
    client: reqwest::blocking::Client,
    endpoint: String,
    token: TokenSource,
}

impl HubClient {
    pub fn new(endpoint: impl Into<String>, token: TokenSource) -> Result<Self, HubError> {
        let endpoint = endpoint.into();
        let client = reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|source| HubError::Request {
                url: endpoint.clone(),
                source,
            })?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn token(&self) -> Result<Option<String>, HubError> {
        get_token(&self.token).map_err(|e| HubError::Token(e.to_string()))
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, HubError> {
        let mut request = self.client.get(url).query(query);
        if let Some(token) = self.token()? {
            request = request.bearer_auth(token);
        }
        let request_err = |source| HubError::Request {
            url: url.to_string(),
            source,
        };
        let response = request.send().map_err(request_err)?;
        if !response.status().is_success() {
            return Err(HubError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }
        response.json().map_err(request_err)
    }

    /// Text-to-image diffusers models matching `keyword`, most downloaded first.
    pub fn search_models(&self, keyword: &str, limit: usize) -> Result<Vec<HubModel>, HubError> {
        let url = format!("{}/api/models", self.endpoint);
        let models: Vec<ApiModel> = self.get_json(
            &url,
            &[
                ("search", keyword.to_string()),
                ("filter", "diffusers".to_string()),
                ("pipeline_tag", "text-to-image".to_string()),
                ("sort", "downloads".to_string()),
                ("direction", "-1".to_string()),
                ("limit", limit.to_string()),
                ("full", "true".to_string()),
            ],
        )?;
        debug!("hub search `{keyword}`: {} results", models.len());
        Ok(models
            .into_iter()
            .map(|m| HubModel {
                url: format!("{}/{}", self.endpoint, m.id),
                name: m.id,
                downloads: m.downloads,
                mtime: m.last_modified,
                pipeline: m.pipeline_tag,
                tags: m.tags,
            })
            .collect())
    }

    /// Card data of a model, if it has any.
    pub fn model_card(&self, hub_id: &str) -> Result<Option<Value>, HubError> {
        let url = format!("{}/api/models/{hub_id}", self.endpoint);
        let info: ApiModelInfo = self.get_json(&url, &[])?;
        Ok(info.card_data.filter(|card| !card.is_null()))
    }

    fn download_snapshot(&self, hub_id: &str, options: &DownloadOptions) -> Result<PathBuf, HubError> {
        let mut builder = ApiBuilder::new()
            .with_progress(true)
            .with_token(self.token()?);
        if let Some(cache_dir) = &options.cache_dir {
            builder = builder.with_cache_dir(cache_dir.clone());
        }
        let api = builder.build()?;
        let revision = options
            .revision
            .clone()
            .filter(|r| !r.is_empty())
            .unwrap_or("main".to_string());
        let repo = api.repo(Repo::with_revision(
            hub_id.to_string(),
            RepoType::Model,
            revision,
        ));

        let files = repo
            .info()?
            .siblings
            .into_iter()
            .map(|s| s.rfilename)
            .collect::<Vec<_>>();
        let components = if files.iter().any(|file| file == MODEL_INDEX) {
            let index = fs::read_to_string(repo.get(MODEL_INDEX)?)?;
            Some(pipeline_components(&serde_json::from_str(&index)?))
        } else {
            warn!("{hub_id} has no {MODEL_INDEX}, fetching every folder");
            None
        };
        let files = select_files(&files, components.as_ref(), options.variant.as_deref());
        info!("downloading {hub_id}: {} files", files.len());

        let mut snapshot = None;
        for file in NiceProgressBar::<_, 'g'>(files.into_iter(), "Downloading files") {
            let path = repo.get(&file)?;
            if snapshot.is_none() {
                let depth = Path::new(&file).components().count();
                snapshot = path.ancestors().nth(depth).map(Path::to_path_buf);
            }
        }
        snapshot.ok_or_else(|| {
            HubError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("repository {hub_id} has no files"),
            ))
        })
    }

    /// Download a diffusers repository into the cache and return its snapshot directory.
    ///
    /// The model card is written next to the files as `model_info.json`. If the card names a
    /// `prior` pipeline it is downloaded as well and marked hidden.
    pub fn download_diffusers_model(
        &self,
        hub_id: &str,
        options: &DownloadOptions,
    ) -> Result<PathBuf, HubError> {
        debug!("diffusers downloading: {hub_id} {options:?}");
        let pipeline_dir = self.download_snapshot(hub_id, options)?;

        let mut card = match self.model_card(hub_id) {
            Ok(card) => card,
            Err(e) => {
                warn!("could not fetch model card for {hub_id}: {e}");
                None
            }
        };
        let prior = card
            .as_ref()
            .and_then(|card| card.get("prior"))
            .and_then(|prior| match prior {
                Value::Array(ids) => ids.first().and_then(Value::as_str),
                Value::String(id) => Some(id.as_str()),
                _ => None,
            })
            .map(str::to_string);
        if let (Some(prior), Some(Value::Object(map))) = (prior, card.as_mut()) {
            let prior_dir = self.download_snapshot(&prior, options)?;
            fs::write(prior_dir.join("hidden"), "True")?;
            map.insert(
                "prior".to_string(),
                Value::String(prior_dir.to_string_lossy().into_owned()),
            );
        }

        let card = card.unwrap_or(Value::Null);
        fs::write(
            pipeline_dir.join("model_info.json"),
            serde_json::to_string_pretty(&card)?,
        )?;
        Ok(pipeline_dir)
    }

    /// Stream `url` into `dest`, leaving an existing file untouched.
    ///
    /// Downloads smaller than `min_size` bytes are deleted and reported as errors.
    pub fn download_file(&self, url: &str, dest: &Path, min_size: u64) -> Result<PathBuf, HubError> {
        download_to(&self.client, url, dest, min_size)
    }
}

/// Shared streaming download: writes to `<dest>.tmp` and renames on success. A failed or
/// short transfer removes the temporary file.
pub(crate) fn download_to(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    min_size: u64,
) -> Result<PathBuf, HubError> {
    if dest.is_file() {
        warn!("download {url}: {} already exists", dest.display());
        return Ok(dest.to_path_buf());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let request_err = |source| HubError::Request {
        url: url.to_string(),
        source,
    };
    let mut response = client.get(url).send().map_err(request_err)?;
    if !response.status().is_success() {
        return Err(HubError::Status {
            url: url.to_string(),
            status: response.status(),
        });
    }
    let expected = response.content_length();

    let tmp = dest.with_extension("tmp");
    let bar = download_bar(expected.unwrap_or(0), "Downloading");
    let written = match copy_to(&mut response, &tmp, &bar) {
        Ok(written) => {
            bar.finish_and_clear();
            written
        }
        Err(e) => {
            bar.abandon();
            discard(&tmp);
            return Err(e.into());
        }
    };

    if let Some(expected) = expected.filter(|expected| *expected != written) {
        discard(&tmp);
        error!("download {url}: {} size={expected} written={written}", dest.display());
        return Err(HubError::Incomplete {
            url: url.to_string(),
            written,
            expected,
        });
    }
    if written < min_size {
        discard(&tmp);
        return Err(HubError::TooSmall {
            path: dest.to_path_buf(),
            written,
        });
    }
    fs::rename(&tmp, dest)?;
    info!("download {url}: {} size={written}", dest.display());
    Ok(dest.to_path_buf())
}

fn copy_to(reader: &mut impl Read, tmp: &Path, bar: &ProgressBar) -> io::Result<u64> {
    let mut writer = bar.wrap_write(BufWriter::new(File::create(tmp)?));
    let written = io::copy(reader, &mut writer)?;
    writer.flush()?;
    Ok(written)
}

fn discard(tmp: &Path) {
    if let Err(e) = fs::remove_file(tmp) {
        debug!("cannot remove {}: {e}", tmp.display());
    }
}

/// Split `dir/name.variant.ext` into (`dir/name`, variant, ext) for weight files.
fn weight_parts(file: &str) -> Option<(String, Option<&str>, &str)> {
    let (stem, ext) = file.rsplit_once('.')?;
    if !WEIGHT_EXTENSIONS.contains(&ext) {
        return None;
    }
    let (dir, name) = stem.rsplit_once('/').unwrap_or(("", stem));
    let prefix = if dir.is_empty() { String::new() } else { format!("{dir}/") };
    match name.rsplit_once('.') {
        Some((base, variant)) => Some((format!("{prefix}{base}"), Some(variant), ext)),
        None => Some((format!("{prefix}{name}"), None, ext)),
    }
}

fn dir_of(file: &str) -> String {
    file.rsplit_once('/')
        .map_or(String::new(), |(dir, _)| dir.to_string())
}

fn extension(file: &str) -> Option<&str> {
    let name = file.rsplit_once('/').map_or(file, |(_, name)| name);
    name.rsplit_once('.').map(|(_, ext)| ext)
}

/// Component folders named by a `model_index.json`: every non-metadata key holding a
/// `[library, class]` pair.
pub(crate) fn pipeline_components(index: &Value) -> HashSet<String> {
    index
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(key, value)| !key.starts_with('_') && value.is_array())
                .map(|(key, _)| key.clone())
                .collect()
        })
        .unwrap_or_default()
}

/// Choose which repository files to fetch.
///
/// With `components`, only root-level `.json` files and files inside those component folders
/// are kept; without it every folder qualifies. Weight formats diffusers cannot load are
/// dropped. Per folder, the requested variant's weights are used when the folder has any,
/// plain weights otherwise, and among those safetensors win over pickled `.bin` weights.
pub(crate) fn select_files(
    files: &[String],
    components: Option<&HashSet<String>>,
    variant: Option<&str>,
) -> Vec<String> {
    let wanted = |file: &str| {
        if extension(file).is_some_and(|ext| IGNORED_EXTENSIONS.contains(&ext)) {
            return false;
        }
        match (file.split_once('/'), components) {
            (None, Some(_)) => extension(file) == Some("json"),
            (Some((top, _)), Some(components)) => components.contains(top),
            (_, None) => true,
        }
    };

    // dir -> variant its weights are taken from
    let mut chosen: BTreeMap<String, Option<&str>> = BTreeMap::new();
    for file in files.iter().filter(|file| wanted(file.as_str())) {
        if let Some((_, file_variant, _)) = weight_parts(file) {
            let pick = chosen.entry(dir_of(file)).or_insert(None);
            if variant.is_some() && file_variant == variant {
                *pick = variant;
            }
        }
    }
    // dirs whose chosen weights include safetensors
    let mut has_safetensors = HashSet::new();
    for file in files {
        if let Some((_, file_variant, "safetensors")) = weight_parts(file) {
            let dir = dir_of(file);
            if wanted(file.as_str()) && chosen.get(&dir) == Some(&file_variant) {
                has_safetensors.insert(dir);
            }
        }
    }

    let mut seen = HashSet::new();
    files
        .iter()
        .filter(|file| wanted(file.as_str()))
        .filter(|file| {
            let Some((_, file_variant, ext)) = weight_parts(file.as_str()) else {
                return true;
            };
            let dir = dir_of(file.as_str());
            chosen.get(&dir) == Some(&file_variant)
                && !(ext == "bin" && has_safetensors.contains(&dir))
        })
        .filter(|file| seen.insert(file.to_string()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn weight_parts_splits_variant() {
        assert_eq!(
            weight_parts("unet/diffusion_pytorch_model.fp16.safetensors"),
            Some(("unet/diffusion_pytorch_model".to_string(), Some("fp16"), "safetensors"))
        );
        assert_eq!(
            weight_parts("model.safetensors"),
            Some(("model".to_string(), None, "safetensors"))
        );
        assert_eq!(weight_parts("unet/config.json"), None);
    }

    #[test]
    fn plain_weights_without_variant() {
        let all = files(&[
            "model_index.json",
            "unet/config.json",
            "unet/diffusion_pytorch_model.safetensors",
            "unet/diffusion_pytorch_model.fp16.safetensors",
            "unet/diffusion_pytorch_model.bin",
        ]);
        assert_eq!(
            select_files(&all, None, None),
            files(&[
                "model_index.json",
                "unet/config.json",
                "unet/diffusion_pytorch_model.safetensors",
            ])
        );
    }

    #[test]
    fn variant_preferred_with_fallback() {
        let all = files(&[
            "unet/diffusion_pytorch_model.safetensors",
            "unet/diffusion_pytorch_model.fp16.safetensors",
            "vae/diffusion_pytorch_model.safetensors",
        ]);
        assert_eq!(
            select_files(&all, None, Some("fp16")),
            files(&[
                "unet/diffusion_pytorch_model.fp16.safetensors",
                "vae/diffusion_pytorch_model.safetensors",
            ])
        );
    }

    #[test]
    fn falls_back_to_bin_when_only_variant_has_safetensors() {
        let all = files(&[
            "unet/config.json",
            "unet/diffusion_pytorch_model.bin",
            "unet/diffusion_pytorch_model.fp16.safetensors",
        ]);
        assert_eq!(
            select_files(&all, None, None),
            files(&["unet/config.json", "unet/diffusion_pytorch_model.bin"])
        );
        assert_eq!(
            select_files(&all, None, Some("fp16")),
            files(&["unet/config.json", "unet/diffusion_pytorch_model.fp16.safetensors"])
        );
    }

    #[test]
    fn only_index_components_and_loadable_formats() {
        let index = serde_json::json!({
            "_class_name": "StableDiffusionPipeline",
            "_diffusers_version": "0.6.0",
            "feature_extractor": ["transformers", "CLIPImageProcessor"],
            "unet": ["diffusers", "UNet2DConditionModel"],
            "requires_safety_checker": true
        });
        let components = pipeline_components(&index);
        assert_eq!(
            components,
            HashSet::from(["feature_extractor".to_string(), "unet".to_string()])
        );

        let all = files(&[
            "README.md",
            "model_index.json",
            "v1-5-pruned.ckpt",
            "v1-5-pruned-emaonly.safetensors",
            "feature_extractor/preprocessor_config.json",
            "safety_checker/model.safetensors",
            "unet/diffusion_pytorch_model.safetensors",
            "unet/diffusion_pytorch_model.msgpack",
            "unet/model.onnx",
        ]);
        assert_eq!(
            select_files(&all, Some(&components), None),
            files(&[
                "model_index.json",
                "feature_extractor/preprocessor_config.json",
                "unet/diffusion_pytorch_model.safetensors",
            ])
        );
        // Without an index every folder qualifies, but pickled checkpoints still do not.
        assert!(!select_files(&all, None, None).contains(&"v1-5-pruned.ckpt".to_string()));
    }

    #[test]
    fn download_skips_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.safetensors");
        fs::write(&dest, b"weights").unwrap();
        let client = HubClient::new("http://127.0.0.1:9", TokenSource::None).unwrap();
        let path = client
            .download_file("http://127.0.0.1:9/model.safetensors", &dest, 0)
            .unwrap();
        assert_eq!(path, dest);
        assert_eq!(fs::read(&dest).unwrap(), b"weights");
    }

    #[test]
    fn truncated_download_leaves_no_partial_file() {
        use std::{
            io::{BufRead, BufReader},
            net::TcpListener,
            thread,
        };

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            while reader.read_line(&mut line).unwrap() > 2 {
                line.clear();
            }
            let mut stream = stream;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\n0123456789")
                .unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("model.safetensors");
        let client = HubClient::new(format!("http://{addr}"), TokenSource::None).unwrap();
        let result = client.download_file(&format!("http://{addr}/model.safetensors"), &dest, 0);
        server.join().unwrap();

        assert!(result.is_err());
        let left = fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(left, 0);
    }
}
