use std::{
    collections::HashSet,
    hash::Hash,
    path::{Path, PathBuf},
};

use tracing::debug;

/// Absolutize and de-duplicate search directories, keeping their first-seen order.
///
/// Empty entries are dropped. When `recursive` is set, a directory nested inside another
/// listed directory is redundant and dropped as well. Nesting is decided per path component,
/// so `/models/sd` never swallows `/models/sdxl`.
pub fn unique_directories<I, P>(directories: I, recursive: bool) -> Vec<PathBuf>
where
    I: IntoIterator<Item = P>,
    P: AsRef<Path>,
{
    let mut seen = HashSet::new();
    let mut dirs = Vec::new();
    for dir in directories {
        let dir = dir.as_ref();
        if dir.as_os_str().is_empty() {
            continue;
        }
        match std::path::absolute(dir) {
            Ok(abs) => {
                if seen.insert(abs.clone()) {
                    dirs.push(abs);
                }
            }
            Err(e) => debug!("skipping directory {}: {e}", dir.display()),
        }
    }
    if !recursive {
        return dirs;
    }
    dirs.iter()
        .filter(|dir| {
            !dirs
                .iter()
                .any(|other| other != *dir && dir.starts_with(other))
        })
        .cloned()
        .collect()
}

/// Order-preserving de-duplication.
pub fn unique_paths<T: Eq + Hash + Clone>(paths: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    paths
        .into_iter()
        .filter(|p| seen.insert(p.clone()))
        .collect()
}

/// Case-insensitive filename suffix filter.
///
/// An empty allow list accepts everything; any match in the deny list rejects.
#[derive(Debug, Clone, Default)]
pub struct ExtensionFilter {
    allow: Vec<String>,
    deny: Vec<String>,
}

impl ExtensionFilter {
    pub fn new<S: AsRef<str>>(allow: &[S], deny: &[S]) -> Self {
        Self {
            allow: allow.iter().map(|e| e.as_ref().to_uppercase()).collect(),
            deny: deny.iter().map(|e| e.as_ref().to_uppercase()).collect(),
        }
    }

    pub fn allow<S: AsRef<str>>(allow: &[S]) -> Self {
        Self::new(allow, &[])
    }

    pub fn matches(&self, path: &Path) -> bool {
        let name = path.to_string_lossy().to_uppercase();
        (self.allow.is_empty() || self.allow.iter().any(|ext| name.ends_with(ext)))
            && !self.deny.iter().any(|ext| name.ends_with(ext))
    }
}

/// Display name of a model file or URL: the last path segment without its extension.
pub fn friendly_name(file: &str) -> String {
    let path = if file.contains("http") {
        match reqwest::Url::parse(file) {
            Ok(url) => url.path().to_string(),
            Err(_) => file.to_string(),
        }
    } else {
        file.to_string()
    };
    Path::new(&path)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_directories_are_redundant_when_recursive() {
        let dirs = unique_directories(["/models", "/models/sd", "/models/sd", "", "/other"], true);
        assert_eq!(dirs, vec![PathBuf::from("/models"), PathBuf::from("/other")]);
    }

    #[test]
    fn nested_directories_kept_when_flat() {
        let dirs = unique_directories(["/models", "/models/sd", "/models"], false);
        assert_eq!(dirs, vec![PathBuf::from("/models"), PathBuf::from("/models/sd")]);
    }

    #[test]
    fn sibling_with_common_prefix_is_not_nested() {
        let dirs = unique_directories(["/models/sd", "/models/sdxl"], true);
        assert_eq!(dirs.len(), 2);
    }

    #[test]
    fn relative_directories_are_absolutized() {
        let dirs = unique_directories(["models"], true);
        assert!(dirs[0].is_absolute());
        assert!(dirs[0].ends_with("models"));
    }

    #[test]
    fn unique_paths_keeps_first_occurrence() {
        assert_eq!(unique_paths(["b", "a", "b", "c", "a"]), vec!["b", "a", "c"]);
    }

    #[test]
    fn extension_filter() {
        let filter = ExtensionFilter::new(&[".safetensors", ".ckpt"], &[".vae.safetensors"]);
        assert!(filter.matches(Path::new("/m/model.SafeTensors")));
        assert!(filter.matches(Path::new("/m/model.ckpt")));
        assert!(!filter.matches(Path::new("/m/model.vae.safetensors")));
        assert!(!filter.matches(Path::new("/m/readme.md")));
        assert!(ExtensionFilter::default().matches(Path::new("anything")));
    }

    #[test]
    fn friendly_names() {
        assert_eq!(friendly_name("/models/Stable-diffusion/v1-5.safetensors"), "v1-5");
        assert_eq!(
            friendly_name("https://example.com/files/RealESRGAN_x4plus.pth?download=1"),
            "RealESRGAN_x4plus"
        );
        assert_eq!(friendly_name("plain"), "plain");
    }
}
