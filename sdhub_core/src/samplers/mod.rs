mod config;
mod scheduler;

use std::collections::{HashMap, HashSet};

use tracing::{debug, error};

use crate::models::ModelHandle;

pub use config::{
    algorithm_defaults, apply_present, global_defaults, resolve_config, BetaSchedule,
    DpmSolverAlgorithm, PredictionType, SchedulerConfig, SchedulerPreferences, UniPcVariant,
};
pub use scheduler::{Scheduler, SchedulerKind};

/// Name of the registry entry that keeps the model's own scheduler.
pub const DEFAULT_SAMPLER: &str = "Default";

#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    #[error("unknown sampler `{0}`")]
    NotFound(String),
    #[error("model `{0}` has no scheduler to keep")]
    MissingScheduler(String),
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
    #[error("unsupported schedule `{0}`")]
    UnsupportedSchedule(String),
    #[error("cannot run {steps} steps on a schedule trained with {train} timesteps")]
    InvalidSteps { steps: usize, train: usize },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// One selectable sampler.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerData {
    pub name: &'static str,
    /// `None` keeps whatever scheduler the model ships with.
    pub kind: Option<SchedulerKind>,
    pub aliases: Vec<String>,
    pub options: SchedulerConfig,
}

impl SamplerData {
    fn new(name: &'static str, kind: Option<SchedulerKind>) -> Self {
        Self {
            name,
            kind,
            aliases: Vec::new(),
            options: SchedulerConfig::new(),
        }
    }
}

/// The sampler table plus the lists currently offered to the user.
#[derive(Debug, Clone)]
pub struct SamplerRegistry {
    all: Vec<SamplerData>,
    visible: Vec<usize>,
    visible_img2img: Vec<usize>,
    aliases: HashMap<String, &'static str>,
}

impl Default for SamplerRegistry {
    fn default() -> Self {
        Self::diffusers()
    }
}

impl SamplerRegistry {
    /// The diffusers samplers, `Default` first. Everything is visible until
    /// [`SamplerRegistry::set_visible`] is called.
    pub fn diffusers() -> Self {
        use SchedulerKind::*;
        let all = vec![
            SamplerData::new(DEFAULT_SAMPLER, None),
            SamplerData::new("UniPC", Some(UniPcMultistep)),
            SamplerData::new("DEIS", Some(DeisMultistep)),
            SamplerData::new("PNDM", Some(Pndm)),
            SamplerData::new("DDPM", Some(Ddpm)),
            SamplerData::new("DDIM", Some(Ddim)),
            SamplerData::new("LMSD", Some(LmsDiscrete)),
            SamplerData::new("KDPM2", Some(Kdpm2Discrete)),
            SamplerData::new("KDPM2 a", Some(Kdpm2AncestralDiscrete)),
            SamplerData::new("DPM 1S", Some(DpmSolverSinglestep)),
            SamplerData::new("DPM 2M", Some(DpmSolverMultistep)),
            SamplerData::new("Euler", Some(EulerDiscrete)),
            SamplerData::new("Euler a", Some(EulerAncestralDiscrete)),
            SamplerData::new("Heun", Some(HeunDiscrete)),
        ];
        debug!(
            "available samplers: {:?}",
            all.iter().map(|s| s.name).collect::<Vec<_>>()
        );
        let everything = (0..all.len()).collect::<Vec<_>>();
        let mut registry = Self {
            all,
            visible: everything.clone(),
            visible_img2img: everything,
            aliases: HashMap::new(),
        };
        registry.rebuild_aliases();
        registry
    }

    pub fn all(&self) -> &[SamplerData] {
        &self.all
    }

    /// `None` and `"None"` select the first entry.
    pub fn find(&self, name: Option<&str>) -> Result<&SamplerData, SamplerError> {
        match name {
            None | Some("None") => self
                .all
                .first()
                .ok_or_else(|| SamplerError::NotFound("None".to_string())),
            Some(name) => self
                .all
                .iter()
                .find(|s| s.name == name)
                .ok_or_else(|| SamplerError::NotFound(name.to_string())),
        }
    }

    /// Restrict the offered samplers. An empty `show` offers `PLMS` and `UniPC` for txt2img and
    /// nothing for img2img; otherwise txt2img gets `show` plus `PLMS` and img2img exactly `show`.
    pub fn set_visible<S: AsRef<str>>(&mut self, show: &[S]) {
        let img2img = show.iter().map(|name| name.as_ref()).collect::<HashSet<&str>>();
        let txt2img = if show.is_empty() {
            HashSet::from(["PLMS", "UniPC"])
        } else {
            let mut shown = img2img.clone();
            shown.insert("PLMS");
            shown
        };
        let pick = |shown: &HashSet<&str>| {
            self.all
                .iter()
                .enumerate()
                .filter(|(_, s)| shown.contains(s.name))
                .map(|(i, _)| i)
                .collect::<Vec<_>>()
        };
        self.visible = pick(&txt2img);
        self.visible_img2img = pick(&img2img);
        self.rebuild_aliases();
    }

    fn rebuild_aliases(&mut self) {
        self.aliases.clear();
        for sampler in &self.all {
            self.aliases.insert(sampler.name.to_lowercase(), sampler.name);
            for alias in &sampler.aliases {
                self.aliases.insert(alias.to_lowercase(), sampler.name);
            }
        }
    }

    pub fn visible(&self) -> Vec<&SamplerData> {
        self.visible.iter().map(|&i| &self.all[i]).collect()
    }

    pub fn visible_img2img(&self) -> Vec<&SamplerData> {
        self.visible_img2img.iter().map(|&i| &self.all[i]).collect()
    }

    /// Canonical name for a sampler name or alias, ignoring case.
    pub fn resolve_alias(&self, name: &str) -> Option<&'static str> {
        self.aliases.get(&name.to_lowercase()).copied()
    }

    /// Build the scheduler `name` for `model` and install it as the model's scheduler.
    ///
    /// `Default` hands back the model's current scheduler. Unknown names are logged and
    /// treated as the first entry.
    pub fn create_sampler(
        &self,
        name: &str,
        model: &mut ModelHandle,
        overrides: &SchedulerConfig,
        prefs: &SchedulerPreferences,
    ) -> Result<Scheduler, SamplerError> {
        let data = match self.find(Some(name)) {
            Ok(data) => data,
            Err(e) => {
                error!("attempting to use {e}");
                self.find(None)?
            }
        };

        let Some(kind) = data.kind else {
            let scheduler = model
                .scheduler
                .clone()
                .ok_or_else(|| SamplerError::MissingScheduler(model.name.clone()))?;
            debug!(
                "sampler default {}: {:?}",
                scheduler.class_name, scheduler.config
            );
            return Ok(scheduler);
        };

        let mut options = data.options.clone();
        for (key, value) in overrides {
            options.insert(key.clone(), value.clone());
        }
        let config = resolve_config(data.name, model.embedded_config(), &options, prefs);
        let scheduler = Scheduler::new(data.name, kind, config);

        if model.scheduler_config.is_none() {
            model.scheduler_config = model.scheduler.as_ref().map(|s| s.config.clone());
        }
        model.scheduler = Some(scheduler.clone());
        debug!("sampler {}: {:?}", scheduler.name, scheduler.config);
        Ok(scheduler)
    }
}
