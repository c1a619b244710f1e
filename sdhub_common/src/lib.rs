mod civitai;
mod hf_cache;
mod hub;
mod model_source;
mod paths;
mod progress;
mod scanner;
mod tokens;

pub use civitai::{
    BaseModel, CivitClient, CivitFile, CivitImage, CivitModel, CivitStats, CivitVersion,
    CIVITAI_ENDPOINT, MIN_CHECKPOINT_SIZE,
};
pub use hf_cache::{scan_cache_dir, RepoRecord, REPO_FOLDER_PREFIX};
pub use hub::{DownloadOptions, HubClient, HubError, HubModel, DEFAULT_HUB_ENDPOINT};
pub use model_source::*;
pub use paths::{friendly_name, unique_directories, unique_paths, ExtensionFilter};
pub use progress::NiceProgressBar;
pub use scanner::{directories_file_paths, walk, DirEntry, DirectoryCache, DEFAULT_DEBOUNCE};
pub use tokens::get_token;
pub use tokens::TokenSource;
