use std::{
    fs,
    path::{Path, PathBuf},
    time::SystemTime,
};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::warn;

/// Folder prefix of model repositories inside a Hugging Face cache.
pub const REPO_FOLDER_PREFIX: &str = "models--";

/// A model repository found in a Hugging Face cache directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoRecord {
    /// Repository id, for example `stabilityai/stable-diffusion-2-1`.
    pub name: String,
    pub filename: String,
    /// Snapshot directory of the selected revision.
    pub path: PathBuf,
    /// Bytes used by the repository's blobs.
    pub size: u64,
    pub mtime: DateTime<Utc>,
    /// Commit hash of the selected revision.
    pub hash: String,
    pub model_info: PathBuf,
    /// Helper pipelines (for example a prior) are downloaded with a `hidden` marker.
    pub hidden: bool,
}

fn repo_id_from_folder(folder: &str) -> Option<String> {
    let rest = folder.strip_prefix(REPO_FOLDER_PREFIX)?;
    if rest.is_empty() {
        return None;
    }
    Some(rest.split("--").collect::<Vec<_>>().join("/"))
}

fn modified(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// Pick the revision `refs/main` points at, else the most recently written snapshot.
fn select_revision(repo_path: &Path) -> anyhow::Result<String> {
    let snapshots = repo_path.join("snapshots");
    if let Ok(main) = fs::read_to_string(repo_path.join("refs").join("main")) {
        let main = main.trim();
        if !main.is_empty() && snapshots.join(main).is_dir() {
            return Ok(main.to_string());
        }
    }
    let mut candidates = fs::read_dir(&snapshots)
        .with_context(|| format!("missing snapshots in {}", repo_path.display()))?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .map(|entry| (modified(&entry.path()), entry.file_name().to_string_lossy().into_owned()))
        .collect::<Vec<_>>();
    candidates.sort();
    candidates
        .pop()
        .map(|(_, hash)| hash)
        .with_context(|| format!("no snapshots in {}", repo_path.display()))
}

fn blob_stats(repo_path: &Path) -> (u64, Option<SystemTime>) {
    let Ok(blobs) = fs::read_dir(repo_path.join("blobs")) else {
        return (0, None);
    };
    blobs
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .fold((0, None), |(size, newest), meta| {
            let mtime = meta.modified().ok();
            (size + meta.len(), newest.max(mtime))
        })
}

fn scan_repo(repo_path: &Path, name: String) -> anyhow::Result<RepoRecord> {
    let hash = select_revision(repo_path)?;
    let path = repo_path.join("snapshots").join(&hash);
    let (size, newest) = blob_stats(repo_path);
    let mtime = newest.unwrap_or_else(|| modified(&path));
    Ok(RepoRecord {
        filename: name.clone(),
        name,
        model_info: path.join("model_info.json"),
        hidden: path.join("hidden").is_file(),
        path,
        size,
        mtime: DateTime::<Utc>::from(mtime),
        hash,
    })
}

/// Scan a Hugging Face cache directory for model repositories, sorted by repository id.
///
/// Corrupted repositories are logged and skipped. Only a missing or unreadable `dir` is an error.
pub fn scan_cache_dir(dir: &Path) -> anyhow::Result<Vec<RepoRecord>> {
    let mut repos = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading cache {}", dir.display()))? {
        let entry = entry?;
        let folder = entry.file_name().to_string_lossy().into_owned();
        let Some(name) = repo_id_from_folder(&folder) else {
            continue;
        };
        if !entry.path().is_dir() {
            continue;
        }
        match scan_repo(&entry.path(), name) {
            Ok(record) => repos.push(record),
            Err(e) => warn!("skipping corrupted cache entry {folder}: {e:#}"),
        }
    }
    repos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(repos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_ids() {
        assert_eq!(
            repo_id_from_folder("models--runwayml--stable-diffusion-v1-5").as_deref(),
            Some("runwayml/stable-diffusion-v1-5")
        );
        assert_eq!(repo_id_from_folder("models--gpt2").as_deref(), Some("gpt2"));
        assert_eq!(repo_id_from_folder("datasets--foo--bar"), None);
        assert_eq!(repo_id_from_folder("models--"), None);
    }
}
