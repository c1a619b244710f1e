//! Incremental, mtime-based directory scanning.
//!
//! A [`DirectoryCache`] remembers the modification time and file list of every directory it has
//! walked. A subtree is only walked again once its root (or, for recursive lookups, any cached
//! descendant) reports a different mtime, and not at all within the debounce window that
//! follows a walk.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    time::{Duration, Instant, SystemTime},
};

use tracing::{debug, error};
use walkdir::WalkDir;

use crate::{hf_cache::REPO_FOLDER_PREFIX, paths::unique_directories, unique_paths};

/// Minimum interval between two walks during which change checks answer "unchanged".
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_secs(1);

/// Cached state of a single directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub mtime: SystemTime,
    /// Full paths of the regular files directly inside the directory.
    pub files: Vec<PathBuf>,
}

/// Walk `top` bottom-up, returning each directory with the names of the files it contains.
///
/// Subdirectories are listed before their parent and siblings in name order. Symlinks are
/// followed; a link back to one of its own ancestors is reported and not descended into.
/// Directories whose name starts with `models--` hold Hugging Face cache internals and are
/// skipped. Entries whose type cannot be read, such as dangling links, count as files.
/// Other errors are handed to `on_error` and the offending directory is left out.
pub fn walk(top: &Path, on_error: &mut dyn FnMut(io::Error, &Path)) -> Vec<(PathBuf, Vec<OsString>)> {
    let walker = WalkDir::new(top)
        .follow_links(true)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with(REPO_FOLDER_PREFIX)
        });

    // Pre-order listing: (depth, dir, files); unreadable directories are dropped at the end.
    let mut dirs: Vec<(usize, PathBuf, Vec<OsString>)> = Vec::new();
    let mut index: HashMap<PathBuf, usize> = HashMap::new();
    let mut unreadable = HashSet::new();
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_dir() => {
                index.insert(entry.path().to_path_buf(), dirs.len());
                dirs.push((entry.depth(), entry.into_path(), Vec::new()));
            }
            Ok(entry) => {
                let parent = entry.path().parent().and_then(|parent| index.get(parent));
                if let Some(&i) = parent {
                    dirs[i].2.push(entry.file_name().to_os_string());
                }
            }
            Err(err) => {
                let path = err.path().unwrap_or(top).to_path_buf();
                if let Some(&i) = index.get(&path) {
                    // The directory itself was seen but could not be listed.
                    unreadable.insert(i);
                    on_error(io::Error::from(err), &path);
                    continue;
                }
                let parent = path.parent().and_then(|parent| index.get(parent)).copied();
                match (parent, err.loop_ancestor().is_some()) {
                    (Some(i), false) if fs::metadata(&path).is_err() => {
                        if let Some(name) = path.file_name() {
                            dirs[i].2.push(name.to_os_string());
                        }
                    }
                    _ => on_error(io::Error::from(err), &path),
                }
            }
        }
    }

    // Emit in post-order so children come before their parent.
    let mut out = Vec::with_capacity(dirs.len());
    let mut open: Vec<(usize, usize)> = Vec::new();
    let mut emit = |i: usize, dirs: &mut Vec<(usize, PathBuf, Vec<OsString>)>| {
        if !unreadable.contains(&i) {
            let (_, dir, files) = &mut dirs[i];
            out.push((std::mem::take(dir), std::mem::take(files)));
        }
    };
    for i in 0..dirs.len() {
        let depth = dirs[i].0;
        while open.last().is_some_and(|&(_, d)| d >= depth) {
            if let Some((j, _)) = open.pop() {
                emit(j, &mut dirs);
            }
        }
        open.push((i, depth));
    }
    while let Some((j, _)) = open.pop() {
        emit(j, &mut dirs);
    }
    out
}

/// Flatten the file lists of scanned directories.
pub fn directories_file_paths(directories: &BTreeMap<PathBuf, DirEntry>) -> Vec<PathBuf> {
    directories
        .values()
        .flat_map(|entry| entry.files.iter().cloned())
        .collect()
}

/// Process-independent cache of directory listings keyed by absolute path.
#[derive(Debug)]
pub struct DirectoryCache {
    entries: BTreeMap<PathBuf, DirEntry>,
    last_walk: Option<Instant>,
    debounce: Duration,
}

impl Default for DirectoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}

impl DirectoryCache {
    pub fn new(debounce: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            last_walk: None,
            debounce,
        }
    }

    pub fn debounce(&self) -> Duration {
        self.debounce
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, dir: &Path) -> Option<&DirEntry> {
        self.entries.get(dir)
    }

    /// Forget everything, forcing the next lookup to walk.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_walk = None;
    }

    fn within_debounce(&self) -> bool {
        self.last_walk
            .is_some_and(|last| last.elapsed() < self.debounce)
    }

    /// Cached entries at or below `dir`, in path order.
    fn subtree<'a>(&'a self, dir: &'a Path) -> impl Iterator<Item = (&'a PathBuf, &'a DirEntry)> + 'a {
        self.entries
            .range(dir.to_path_buf()..)
            .take_while(move |(path, _)| path.starts_with(dir))
    }

    /// Whether the on-disk directory still matches its cached mtime.
    fn is_current(path: &Path, entry: &DirEntry) -> bool {
        match fs::metadata(path) {
            Ok(meta) if meta.is_dir() => match meta.modified() {
                Ok(mtime) => mtime == entry.mtime,
                Err(e) => {
                    error!("Filesystem error: {}: {e}", path.display());
                    false
                }
            },
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => {
                error!("Filesystem error: {}: {e}", path.display());
                false
            }
        }
    }

    /// Decide whether `dir` has to be walked again.
    pub fn has_changed(&self, dir: &Path, recursive: bool) -> bool {
        let dir = match std::path::absolute(dir) {
            Ok(dir) => dir,
            Err(e) => {
                error!("Filesystem error: {}: {e}", dir.display());
                return true;
            }
        };
        let Some(entry) = self.entries.get(&dir) else {
            return true;
        };
        if self.within_debounce() {
            return false;
        }
        if !Self::is_current(&dir, entry) {
            return true;
        }
        recursive
            && self
                .subtree(&dir)
                .any(|(path, entry)| *path != dir && !Self::is_current(path, entry))
    }

    fn purge_missing(&mut self) {
        self.entries.retain(|path, _| path.is_dir());
    }

    fn rescan(&mut self, dir: &Path) {
        self.purge_missing();
        let walked = walk(dir, &mut |e, path| {
            debug!("FS walk error: {e} {}", path.display())
        });
        for (path, names) in walked {
            match fs::metadata(&path).and_then(|meta| meta.modified()) {
                Ok(mtime) => {
                    let stale = self
                        .entries
                        .get(&path)
                        .map_or(true, |entry| entry.mtime != mtime);
                    if stale {
                        let files = names.iter().map(|name| path.join(name)).collect();
                        self.entries.insert(path, DirEntry { mtime, files });
                    }
                }
                Err(e) => {
                    error!("Filesystem error: {}: {e}", path.display());
                    self.entries.remove(&path);
                }
            }
        }
        self.last_walk = Some(Instant::now());
    }

    /// Cached listings for `dir` (and, if `recursive`, every directory below it), walking the
    /// filesystem first if anything changed.
    pub fn directories(&mut self, dir: &Path, recursive: bool) -> BTreeMap<PathBuf, DirEntry> {
        let dir = match std::path::absolute(dir) {
            Ok(dir) => dir,
            Err(e) => {
                error!("Filesystem error: {}: {e}", dir.display());
                return BTreeMap::new();
            }
        };
        if self.has_changed(&dir, recursive) {
            self.rescan(&dir);
        }
        if recursive {
            self.subtree(&dir)
                .map(|(path, entry)| (path.clone(), entry.clone()))
                .collect()
        } else {
            self.entries
                .get(&dir)
                .map(|entry| (dir.clone(), entry.clone()))
                .into_iter()
                .collect()
        }
    }

    /// Newest mtime among the listed directories, or the epoch if none are known.
    pub fn mtime(&mut self, dir: &Path, recursive: bool) -> SystemTime {
        self.directories(dir, recursive)
            .values()
            .map(|entry| entry.mtime)
            .max()
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    /// All files below the given search roots, without duplicates.
    pub fn files<I, P>(&mut self, directories: I, recursive: bool) -> Vec<PathBuf>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut files = Vec::new();
        for dir in unique_directories(directories, recursive) {
            files.extend(directories_file_paths(&self.directories(&dir, recursive)));
        }
        unique_paths(files)
    }
}
