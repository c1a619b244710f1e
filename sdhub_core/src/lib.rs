//! Core crate of sdhub: model discovery and sampler resolution for diffusion front ends.
//!
//! ```rust,no_run
//! use sdhub_core::{
//!     ModelHandle, ModelSource, SamplerRegistry, SchedulerConfig, SchedulerPreferences,
//!     TokenSource,
//! };
//!
//! let mut model = ModelHandle::load(
//!     ModelSource::from_model_id("stabilityai/stable-diffusion-2-1"),
//!     true,
//!     TokenSource::CacheToken,
//!     None,
//! )?;
//!
//! let registry = SamplerRegistry::diffusers();
//! let scheduler = registry.create_sampler(
//!     "DPM 2M",
//!     &mut model,
//!     &SchedulerConfig::new(),
//!     &SchedulerPreferences::default(),
//! )?;
//! println!("{}: {:?}", scheduler.class_name, scheduler.sigmas(20)?);
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod loader;
mod models;
mod samplers;
mod settings;

pub use loader::{
    cleanup_models, friendly_name, move_files, DiffusersCatalog, ModelLoader, ModelLocation,
    ModelRequest,
};
pub use models::ModelHandle;
pub use samplers::*;
pub use sdhub_common::{
    scan_cache_dir, BaseModel, CivitClient, CivitModel, DirectoryCache, DownloadOptions,
    ExtensionFilter, HubClient, HubModel, ModelSource, RepoRecord, TokenSource,
};
pub use settings::{default_hub_cache, Settings};
