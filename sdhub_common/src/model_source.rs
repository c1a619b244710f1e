use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use crate::{get_token, TokenSource};
use walkdir::WalkDir;
use hf_hub::{
    api::sync::{ApiBuilder, ApiRepo},
    Repo, RepoType,
};

/// Where a diffusers model lives. This is easiest to create with [`ModelSource::from_model_id`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    ModelId(String),
    LocalDir(PathBuf),
}

impl Display for ModelSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ModelId(model_id) => write!(f, "model id: {model_id}"),
            Self::LocalDir(path) => write!(f, "local dir: {}", path.display()),
        }
    }
}

impl ModelSource {
    /// A Hugging Face model ID, or a local path if a directory exists there.
    pub fn from_model_id<S: ToString>(model_id: S) -> Self {
        let model_id = model_id.to_string();
        if Path::new(&model_id).is_dir() {
            Self::LocalDir(PathBuf::from(model_id))
        } else {
            Self::ModelId(model_id)
        }
    }

    /// A snapshot directory already on disk, such as a scanned cache record's path.
    pub fn local<P: Into<PathBuf>>(path: P) -> Self {
        Self::LocalDir(path.into())
    }

    /// Short name used for display and logging.
    pub fn name(&self) -> String {
        match self {
            Self::ModelId(model_id) => model_id.clone(),
            Self::LocalDir(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }
}

pub enum FileLoader {
    Api(Box<ApiRepo>),
    Local(PathBuf),
}

impl FileLoader {
    pub fn from_model_source(
        source: &ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
    ) -> anyhow::Result<Self> {
        match source {
            ModelSource::ModelId(model_id) => {
                let api_builder = ApiBuilder::new()
                    .with_progress(!silent)
                    .with_token(get_token(&token)?)
                    .build()?;
                let revision = revision.unwrap_or("main".to_string());
                let api = api_builder.repo(Repo::with_revision(
                    model_id.clone(),
                    RepoType::Model,
                    revision,
                ));

                Ok(Self::Api(Box::new(api)))
            }
            ModelSource::LocalDir(path) => {
                if !path.is_dir() {
                    anyhow::bail!("{} is not a directory", path.display());
                }
                Ok(Self::Local(path.clone()))
            }
        }
    }

    /// Repository-relative names of all files, using `/` separators.
    pub fn list_files(&self) -> anyhow::Result<Vec<String>> {
        match self {
            Self::Api(api) => api
                .info()
                .map(|repo| {
                    repo.siblings
                        .iter()
                        .map(|x| x.rfilename.clone())
                        .collect::<Vec<String>>()
                })
                .map_err(|e| anyhow::Error::msg(e.to_string())),
            Self::Local(root) => {
                let mut files = list_local(root)?;
                files.sort();
                Ok(files)
            }
        }
    }

    /// Local path of a file, downloading it first for hub sources.
    pub fn read_file(&self, name: &str) -> anyhow::Result<PathBuf> {
        match self {
            Self::Api(api) => api
                .get(name)
                .map_err(|e| anyhow::Error::msg(e.to_string())),
            Self::Local(root) => {
                let path = root.join(name);
                if !path.is_file() {
                    anyhow::bail!("{} not found in {}", name, root.display());
                }
                Ok(path)
            }
        }
    }

    pub fn read_to_string(&self, name: &str) -> anyhow::Result<String> {
        Ok(fs::read_to_string(self.read_file(name)?)?)
    }
}

fn list_local(root: &Path) -> anyhow::Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        if entry.file_type().is_dir() {
            continue;
        }
        if let Ok(rel) = entry.path().strip_prefix(root) {
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.push(rel);
        }
    }
    Ok(files)
}
