//! Default tables and the layered merge that turns them into a scheduler configuration.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use tracing::warn;

/// Option name to value, in insertion order.
pub type SchedulerConfig = serde_json::Map<String, Value>;

fn as_config(value: Value) -> SchedulerConfig {
    match value {
        Value::Object(map) => map,
        _ => SchedulerConfig::new(),
    }
}

// beta_start, beta_end and prediction_type really belong to the model; the model layer
// overrides them when it carries its own.
static GLOBAL_DEFAULTS: Lazy<SchedulerConfig> = Lazy::new(|| {
    as_config(json!({
        "num_train_timesteps": 1000,
        "beta_start": 0.0001,
        "beta_end": 0.02,
        "beta_schedule": "linear",
        "prediction_type": "epsilon",
    }))
});

static ALGORITHM_DEFAULTS: Lazy<HashMap<&'static str, SchedulerConfig>> = Lazy::new(|| {
    [
        ("DDIM", json!({ "clip_sample": true, "set_alpha_to_one": true, "steps_offset": 0, "thresholding": false, "clip_sample_range": 1.0, "sample_max_value": 1.0, "timestep_spacing": "linspace", "rescale_betas_zero_snr": false })),
        ("DDPM", json!({ "variance_type": "fixed_small", "clip_sample": true, "thresholding": false, "clip_sample_range": 1.0, "sample_max_value": 1.0, "timestep_spacing": "linspace" })),
        ("DEIS", json!({ "solver_order": 2, "thresholding": false, "sample_max_value": 1.0, "algorithm_type": "deis", "solver_type": "logrho", "lower_order_final": true })),
        ("DPM 1S", json!({ "solver_order": 2, "thresholding": false, "sample_max_value": 1.0, "algorithm_type": "dpmsolver++", "solver_type": "midpoint", "lower_order_final": true, "use_karras_sigmas": false })),
        ("DPM 2M", json!({ "thresholding": false, "sample_max_value": 1.0, "algorithm_type": "dpmsolver++", "solver_type": "midpoint", "lower_order_final": true, "use_karras_sigmas": false })),
        ("Euler a", json!({})),
        ("Euler", json!({ "interpolation_type": "linear", "use_karras_sigmas": false })),
        ("Heun", json!({ "use_karras_sigmas": false })),
        ("KDPM2 a", json!({ "steps_offset": 0 })),
        ("KDPM2", json!({ "steps_offset": 0 })),
        ("LMSD", json!({ "use_karras_sigmas": false, "timestep_spacing": "linspace", "steps_offset": 0 })),
        ("PNDM", json!({ "skip_prk_steps": false, "set_alpha_to_one": false, "steps_offset": 0 })),
        ("UniPC", json!({ "solver_order": 2, "thresholding": false, "sample_max_value": 1.0, "predict_x0": "bh2", "lower_order_final": true })),
    ]
    .into_iter()
    .map(|(name, value)| (name, as_config(value)))
    .collect()
});

/// Options shared by every scheduler.
pub fn global_defaults() -> &'static SchedulerConfig {
    &GLOBAL_DEFAULTS
}

/// Per-sampler defaults; empty for names without a table entry.
pub fn algorithm_defaults(name: &str) -> SchedulerConfig {
    ALGORITHM_DEFAULTS.get(name).cloned().unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum PredictionType {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "epsilon")]
    Epsilon,
    #[serde(rename = "sample")]
    Sample,
    #[serde(rename = "v_prediction")]
    #[value(name = "v_prediction")]
    VPrediction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum BetaSchedule {
    #[default]
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "linear")]
    Linear,
    #[serde(rename = "scaled_linear")]
    #[value(name = "scaled_linear")]
    ScaledLinear,
    #[serde(rename = "squaredcos_cap_v2")]
    #[value(name = "squaredcos_cap_v2")]
    SquaredcosCapV2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum UniPcVariant {
    #[serde(rename = "bh1")]
    Bh1,
    #[default]
    #[serde(rename = "bh2")]
    Bh2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum DpmSolverAlgorithm {
    #[default]
    #[serde(rename = "dpmsolver++")]
    #[value(name = "dpmsolver++")]
    DpmSolverPlusPlus,
    #[serde(rename = "sde-dpmsolver++")]
    #[value(name = "sde-dpmsolver++")]
    SdeDpmSolverPlusPlus,
    #[serde(rename = "dpmsolver")]
    #[value(name = "dpmsolver")]
    DpmSolver,
    #[serde(rename = "sde-dpmsolver")]
    #[value(name = "sde-dpmsolver")]
    SdeDpmSolver,
}

fn plain<T: Serialize>(value: &T) -> Value {
    Value::String(serde_plain::to_string(value).unwrap_or_default())
}

/// Unknown names fall back to the default choice instead of failing the whole document.
fn lenient<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: serde::de::DeserializeOwned + Default,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value.clone()).unwrap_or_else(|_| {
        warn!("unknown scheduler preference {value}, using default");
        T::default()
    }))
}

/// User-level scheduler preferences, applied last.
///
/// The defaults leave every algorithm's own defaults untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerPreferences {
    #[serde(deserialize_with = "lenient")]
    pub prediction_type: PredictionType,
    #[serde(deserialize_with = "lenient")]
    pub beta_schedule: BetaSchedule,
    pub use_karras: bool,
    pub use_thresholding: bool,
    pub use_loworder: bool,
    pub solver_order: u32,
    #[serde(deserialize_with = "lenient")]
    pub uni_pc_variant: UniPcVariant,
    #[serde(deserialize_with = "lenient")]
    pub dpm_solver: DpmSolverAlgorithm,
    /// Ignored unless positive.
    pub beta_start: f64,
    /// Ignored unless positive.
    pub beta_end: f64,
}

impl Default for SchedulerPreferences {
    fn default() -> Self {
        Self {
            prediction_type: PredictionType::Default,
            beta_schedule: BetaSchedule::Default,
            use_karras: false,
            use_thresholding: false,
            use_loworder: true,
            solver_order: 2,
            uni_pc_variant: UniPcVariant::Bh2,
            dpm_solver: DpmSolverAlgorithm::DpmSolverPlusPlus,
            beta_start: 0.,
            beta_end: 0.,
        }
    }
}

impl SchedulerPreferences {
    pub fn validate(&mut self) {
        self.solver_order = self.solver_order.clamp(1, 3);
        if !self.beta_start.is_finite() || self.beta_start < 0. {
            self.beta_start = 0.;
        }
        if !self.beta_end.is_finite() || self.beta_end < 0. {
            self.beta_end = 0.;
        }
        if self.beta_start > 0. && self.beta_end > 0. && self.beta_start >= self.beta_end {
            warn!(
                "beta_start {} is not below beta_end {}, ignoring both",
                self.beta_start, self.beta_end
            );
            self.beta_start = 0.;
            self.beta_end = 0.;
        }
    }

    /// Apply the preferences to `config`. Toggles only touch options the scheduler has.
    pub fn apply(&self, sampler: &str, config: &mut SchedulerConfig) {
        if self.prediction_type != PredictionType::Default {
            set_present(config, "prediction_type", plain(&self.prediction_type));
        }
        if self.beta_schedule != BetaSchedule::Default {
            set_present(config, "beta_schedule", plain(&self.beta_schedule));
        }
        set_present(config, "use_karras_sigmas", Value::Bool(self.use_karras));
        set_present(config, "thresholding", Value::Bool(self.use_thresholding));
        set_present(config, "lower_order_final", Value::Bool(self.use_loworder));
        set_present(config, "solver_order", Value::from(self.solver_order));
        set_present(config, "predict_x0", plain(&self.uni_pc_variant));
        if sampler == "DPM 2M" {
            set_present(config, "algorithm_type", plain(&self.dpm_solver));
        }
        if self.beta_start > 0. {
            set_present(config, "beta_start", Value::from(self.beta_start));
        }
        if self.beta_end > 0. {
            set_present(config, "beta_end", Value::from(self.beta_end));
        }
    }
}

fn set_present(config: &mut SchedulerConfig, key: &str, value: Value) {
    if let Some(slot) = config.get_mut(key) {
        *slot = value;
    }
}

/// Overwrite keys of `config` that also appear in `layer`; never adds keys.
pub fn apply_present(config: &mut SchedulerConfig, layer: &SchedulerConfig) {
    for (key, value) in layer {
        set_present(config, key, value.clone());
    }
}

/// Merge every layer for `sampler`: global defaults, the sampler's defaults, the model's own
/// scheduler config, explicit overrides and finally user preferences.
pub fn resolve_config(
    sampler: &str,
    model: Option<&SchedulerConfig>,
    overrides: &SchedulerConfig,
    prefs: &SchedulerPreferences,
) -> SchedulerConfig {
    let mut config = global_defaults().clone();
    for (key, value) in algorithm_defaults(sampler) {
        config.insert(key, value);
    }
    if let Some(model) = model {
        apply_present(&mut config, model);
    }
    apply_present(&mut config, overrides);
    prefs.apply(sampler, &mut config);
    config
}
