//! Model discovery: single-file models in search folders and diffusers repositories in
//! Hugging Face caches.

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use sdhub_common::{
    scan_cache_dir, unique_directories, CivitClient, DirectoryCache, ExtensionFilter, HubClient,
    RepoRecord, TokenSource,
};

use crate::Settings;

pub use sdhub_common::friendly_name;

/// How many hub matches `find_diffuser` considers.
const HUB_SEARCH_LIMIT: usize = 20;

/// A model found on disk, or the URL it can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ModelLocation {
    Path(PathBuf),
    Url(String),
}

impl Display for ModelLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

/// Where to look for single-file models.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    /// Where models are stored and downloads land.
    pub model_path: PathBuf,
    /// Extra place given on the command line.
    pub command_path: Option<PathBuf>,
    pub filter: ExtensionFilter,
    /// Used when nothing is found locally.
    pub model_url: Option<String>,
    /// Download `model_url` under this file name instead of returning the URL.
    pub download_name: Option<String>,
}

impl ModelRequest {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            command_path: None,
            filter: ExtensionFilter::default(),
            model_url: None,
            download_name: None,
        }
    }
}

/// Repositories found in the diffusers caches during the last scan.
#[derive(Debug, Clone, Default)]
pub struct DiffusersCatalog {
    repos: Vec<RepoRecord>,
}

impl DiffusersCatalog {
    pub fn repos(&self) -> &[RepoRecord] {
        &self.repos
    }

    pub fn get(&self, name: &str) -> Option<&RepoRecord> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn clear(&mut self) {
        self.repos.clear();
    }

    fn extend(&mut self, repos: Vec<RepoRecord>) {
        self.repos.extend(repos);
    }
}

/// Finds models, keeping the directory listings and the diffusers catalog between calls.
pub struct ModelLoader {
    cache: DirectoryCache,
    catalog: DiffusersCatalog,
    /// `None` when downloads are disabled.
    hub: Option<HubClient>,
    civitai: Option<CivitClient>,
}

impl ModelLoader {
    pub fn new(debounce: Duration, hub: Option<HubClient>) -> Self {
        Self {
            cache: DirectoryCache::new(debounce),
            catalog: DiffusersCatalog::default(),
            hub,
            civitai: None,
        }
    }

    pub fn with_civitai(mut self, civitai: Option<CivitClient>) -> Self {
        self.civitai = civitai;
        self
    }

    /// A loader configured from `settings`. No clients are created with `no_download`.
    pub fn from_settings(settings: &Settings, token: TokenSource) -> anyhow::Result<Self> {
        if settings.no_download {
            return Ok(Self::new(settings.scan_debounce(), None));
        }
        let hub = HubClient::new(settings.hub_endpoint.clone(), token)?;
        let civitai = CivitClient::new(settings.civitai_endpoint.clone())?;
        Ok(Self::new(settings.scan_debounce(), Some(hub)).with_civitai(Some(civitai)))
    }

    pub fn cache(&self) -> &DirectoryCache {
        &self.cache
    }

    pub fn catalog(&self) -> &DiffusersCatalog {
        &self.catalog
    }

    pub fn hub(&self) -> Option<&HubClient> {
        self.hub.as_ref()
    }

    pub fn civitai(&self) -> Option<&CivitClient> {
        self.civitai.as_ref()
    }

    /// Files matching the request's filter in its search places.
    ///
    /// When nothing matches and a `model_url` is set, the URL is returned, or downloaded into
    /// the first place when `download_name` is set. Failures are logged and degrade to what
    /// was found.
    pub fn load_models(&mut self, request: &ModelRequest) -> Vec<ModelLocation> {
        let places = unique_directories(
            [Some(&request.model_path), request.command_path.as_ref()]
                .into_iter()
                .flatten(),
            true,
        );
        let mut output = self
            .cache
            .files(&places, true)
            .into_iter()
            .filter(|file| request.filter.matches(file))
            .map(ModelLocation::Path)
            .collect::<Vec<_>>();

        let Some(url) = request.model_url.as_ref().filter(|_| output.is_empty()) else {
            return output;
        };
        match (&request.download_name, &self.hub, places.first()) {
            (Some(name), Some(hub), Some(place)) => {
                match hub.download_file(url, &place.join(name), 0) {
                    Ok(path) => output.push(ModelLocation::Path(path)),
                    Err(e) => error!("error listing models: {places:?} {e}"),
                }
            }
            (Some(_), None, _) => {
                warn!("downloads disabled, not fetching {url}");
                output.push(ModelLocation::Url(url.clone()));
            }
            _ => output.push(ModelLocation::Url(url.clone())),
        }
        output
    }

    /// Rescan the diffusers caches and return the ids of the repositories meant to be shown.
    ///
    /// Repositories carrying a `hidden` marker are cataloged but not returned.
    pub fn load_diffusers_models(
        &mut self,
        model_path: &Path,
        command_path: Option<&Path>,
    ) -> Vec<String> {
        let mut places = vec![model_path];
        if let Some(command_path) = command_path.filter(|path| *path != model_path) {
            places.push(command_path);
        }
        self.catalog.clear();
        for place in places.iter().filter(|place| place.is_dir()) {
            match scan_cache_dir(place) {
                Ok(repos) => self.catalog.extend(repos),
                Err(e) => error!("error listing diffusers: {} {e:#}", place.display()),
            }
        }
        let output = self
            .catalog
            .repos()
            .iter()
            .filter(|repo| !repo.hidden)
            .map(|repo| repo.name.clone())
            .collect::<Vec<_>>();
        debug!(
            "scanning diffusers cache: {} {:?} {}",
            model_path.display(),
            command_path,
            output.len()
        );
        output
    }

    /// Download a CivitAI checkpoint into `ckpt_dir/model_path/model_name`, with its preview
    /// image alongside. The checkpoint folder is rescanned on the next lookup.
    pub fn download_civit_model(
        &mut self,
        ckpt_dir: &Path,
        model_path: &str,
        model_name: &str,
        url: &str,
        preview_url: Option<&str>,
    ) -> anyhow::Result<PathBuf> {
        let Some(civitai) = &self.civitai else {
            anyhow::bail!("downloads disabled, not fetching {url}");
        };
        let dest = ckpt_dir.join(model_path).join(model_name);
        info!("CivitAI download: name={model_name} url={url} path={model_path}");
        let path = civitai.download_model(url, &dest, preview_url).map_err(|e| {
            error!("CivitAI download error: name={model_name} url={url} path={model_path} {e}");
            e
        })?;
        self.cache.clear();
        Ok(path)
    }

    /// A cached repository named `name`, else the most downloaded hub match.
    pub fn find_diffuser(&self, name: &str) -> Option<String> {
        if self.catalog.contains(name) {
            return Some(name.to_string());
        }
        let hub = self.hub.as_ref()?;
        match hub.search_models(name, HUB_SEARCH_LIMIT) {
            Ok(models) => {
                debug!("searching diffusers models: {name} {}", !models.is_empty());
                models.into_iter().next().map(|model| model.name)
            }
            Err(e) => {
                error!("searching diffusers models: {name} {e}");
                None
            }
        }
    }
}

fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to)?;
    fs::remove_file(from)
}

/// Move the files directly inside `src` into `dest`, optionally only names containing
/// `ext_filter`, and remove `src` once it is empty. Failures are logged.
pub fn move_files(src: &Path, dest: &Path, ext_filter: Option<&str>) {
    if let Err(e) = fs::create_dir_all(dest) {
        error!("cannot create {}: {e}", dest.display());
        return;
    }
    let Ok(entries) = fs::read_dir(src) else {
        return;
    };
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if ext_filter.is_some_and(|ext| !name.contains(ext)) {
            continue;
        }
        warn!("moving {name} from {} to {}", src.display(), dest.display());
        if let Err(e) = move_file(&path, &dest.join(&name)) {
            debug!("move of {} failed: {e}", path.display());
        }
    }
    let empty = fs::read_dir(src)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(false);
    if empty {
        info!("removing empty folder: {}", src.display());
        if let Err(e) = fs::remove_dir(src) {
            debug!("cannot remove {}: {e}", src.display());
        }
    }
}

/// Move models left in legacy locations into their folders under `models_dir`.
pub fn cleanup_models(app_root: &Path, models_dir: &Path) {
    let moves: [(PathBuf, &str, Option<&str>); 6] = [
        (app_root.join("ESRGAN"), "ESRGAN", None),
        (models_dir.join("BSRGAN"), "ESRGAN", Some(".pth")),
        (app_root.join("gfpgan"), "GFPGAN", None),
        (app_root.join("SwinIR"), "SwinIR", None),
        (
            app_root.join("repositories/latent-diffusion/experiments/pretrained_models"),
            "LDSR",
            None,
        ),
        (app_root.join("ScuNET"), "ScuNET", None),
    ];
    for (src, dest, ext_filter) in moves {
        if src.is_dir() {
            move_files(&src, &models_dir.join(dest), ext_filter);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, b"x").unwrap();
    }

    #[test]
    fn move_files_filters_and_removes_empty_source() {
        let root = tempfile::tempdir().unwrap();
        let src = root.path().join("BSRGAN");
        let dest = root.path().join("ESRGAN");
        touch(&src.join("a.pth"));
        touch(&src.join("notes.txt"));

        move_files(&src, &dest, Some(".pth"));
        assert!(dest.join("a.pth").is_file());
        assert!(src.join("notes.txt").is_file());

        move_files(&src, &dest, None);
        assert!(dest.join("notes.txt").is_file());
        assert!(!src.exists());
    }

    #[test]
    fn move_files_tolerates_missing_source() {
        let root = tempfile::tempdir().unwrap();
        let dest = root.path().join("dest");
        move_files(&root.path().join("missing"), &dest, None);
        assert!(dest.is_dir());
    }

    #[test]
    fn cleanup_moves_legacy_folders() {
        let root = tempfile::tempdir().unwrap();
        let models = root.path().join("models");
        touch(&root.path().join("SwinIR/swinir.pth"));
        cleanup_models(root.path(), &models);
        assert!(models.join("SwinIR/swinir.pth").is_file());
        assert!(!root.path().join("SwinIR").exists());
        assert!(!models.join("GFPGAN").exists());
    }

    #[test]
    fn location_display() {
        assert_eq!(ModelLocation::Url("https://x/y.pth".into()).to_string(), "https://x/y.pth");
        assert_eq!(
            serde_json::to_string(&ModelLocation::Path(PathBuf::from("/m/a.pth"))).unwrap(),
            "\"/m/a.pth\""
        );
    }
}
