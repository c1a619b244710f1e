use anyhow::Result;
use serde::Deserialize;
use tracing::{info, warn};

use sdhub_common::{FileLoader, ModelSource, TokenSource};

use crate::samplers::{Scheduler, SchedulerConfig, DEFAULT_SAMPLER};

const MODEL_INDEX: &str = "model_index.json";
const SCHEDULER_CONFIG: &str = "scheduler/scheduler_config.json";

#[derive(Clone, Debug, Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    name: String,
}

/// A diffusers model as far as sampler selection is concerned: its pipeline class and the
/// scheduler it currently uses.
#[derive(Debug, Clone)]
pub struct ModelHandle {
    pub name: String,
    pub source: Option<ModelSource>,
    /// Pipeline class from `model_index.json`, for example `StableDiffusionPipeline`.
    pub pipeline: String,
    pub scheduler: Option<Scheduler>,
    /// The scheduler config the model shipped with, recorded the first time its scheduler is
    /// replaced.
    pub scheduler_config: Option<SchedulerConfig>,
}

impl ModelHandle {
    pub fn new(name: impl Into<String>, pipeline: impl Into<String>, scheduler: Option<Scheduler>) -> Self {
        Self {
            name: name.into(),
            source: None,
            pipeline: pipeline.into(),
            scheduler,
            scheduler_config: None,
        }
    }

    /// Load the model description.
    ///
    /// Note:
    /// - `token` and `revision` are only applicable for Hugging Face models.
    pub fn load(
        source: ModelSource,
        silent: bool,
        token: TokenSource,
        revision: Option<String>,
    ) -> Result<Self> {
        info!("loading from source: {source}.");

        let loader = FileLoader::from_model_source(&source, silent, token, revision)?;
        let files = loader.list_files()?;

        if !files.iter().any(|file| file == MODEL_INDEX) {
            anyhow::bail!("Expected `{MODEL_INDEX}` file present.");
        }
        let ModelIndex { name: pipeline } =
            serde_json::from_str(&loader.read_to_string(MODEL_INDEX)?)?;
        info!("model pipeline is: {pipeline}");

        let scheduler = if files.iter().any(|file| file == SCHEDULER_CONFIG) {
            let scheduler =
                Scheduler::from_json(DEFAULT_SAMPLER, &loader.read_to_string(SCHEDULER_CONFIG)?)?;
            if scheduler.kind().is_none() {
                warn!("unrecognized scheduler class `{}`", scheduler.class_name);
            }
            Some(scheduler)
        } else {
            warn!("model has no `{SCHEDULER_CONFIG}`");
            None
        };

        Ok(Self {
            name: source.name(),
            source: Some(source),
            pipeline,
            scheduler,
            scheduler_config: None,
        })
    }

    /// The configuration the model itself brings: the recorded original, else the current
    /// scheduler's.
    pub fn embedded_config(&self) -> Option<&SchedulerConfig> {
        self.scheduler_config
            .as_ref()
            .or(self.scheduler.as_ref().map(|s| &s.config))
    }
}
