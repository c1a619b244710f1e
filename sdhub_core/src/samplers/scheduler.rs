use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{SamplerError, SchedulerConfig};

/// Scheduler classes, named as in a diffusers `scheduler_config.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SchedulerKind {
    #[serde(rename = "DDIMScheduler")]
    Ddim,
    #[serde(rename = "DDPMScheduler")]
    Ddpm,
    #[serde(rename = "DEISMultistepScheduler")]
    DeisMultistep,
    #[serde(rename = "DPMSolverMultistepScheduler")]
    DpmSolverMultistep,
    #[serde(rename = "DPMSolverSinglestepScheduler")]
    DpmSolverSinglestep,
    #[serde(rename = "EulerAncestralDiscreteScheduler")]
    EulerAncestralDiscrete,
    #[serde(rename = "EulerDiscreteScheduler")]
    EulerDiscrete,
    #[serde(rename = "HeunDiscreteScheduler")]
    HeunDiscrete,
    #[serde(rename = "KDPM2DiscreteScheduler")]
    Kdpm2Discrete,
    #[serde(rename = "KDPM2AncestralDiscreteScheduler")]
    Kdpm2AncestralDiscrete,
    #[serde(rename = "LMSDiscreteScheduler")]
    LmsDiscrete,
    #[serde(rename = "PNDMScheduler")]
    Pndm,
    #[serde(rename = "UniPCMultistepScheduler")]
    UniPcMultistep,
    #[serde(rename = "FlowMatchEulerDiscreteScheduler")]
    FlowMatchEulerDiscrete,
}

impl SchedulerKind {
    pub fn class_name(&self) -> String {
        serde_plain::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }

    pub fn from_class_name(name: &str) -> Option<Self> {
        serde_plain::from_str(name).ok()
    }
}

/// A constructed scheduler: its class, the sampler name it was built for and the effective
/// configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Scheduler {
    pub name: String,
    pub class_name: String,
    pub config: SchedulerConfig,
}

fn time_shift(mu: f64, sigma: f64, t: f64) -> f64 {
    let e = mu.exp();
    e / (e + (1. / t - 1.).powf(sigma))
}

fn calculate_shift(
    image_seq_len: usize,
    base_seq_len: usize,
    max_seq_len: usize,
    base_shift: f64,
    max_shift: f64,
) -> f64 {
    let m = (max_shift - base_shift) / (max_seq_len as f64 - base_seq_len as f64);
    let b = base_shift - m * base_seq_len as f64;
    image_seq_len as f64 * m + b
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    match n {
        0 => Vec::new(),
        1 => vec![start],
        _ => (0..n)
            .map(|i| start + (end - start) * i as f64 / (n - 1) as f64)
            .collect(),
    }
}

/// Piecewise-linear interpolation of `ys` sampled at integer positions.
fn interp_index(x: f64, ys: &[f64]) -> f64 {
    let last = ys.len() - 1;
    let x = x.clamp(0., last as f64);
    let low = x.floor() as usize;
    let high = (low + 1).min(last);
    let w = x - low as f64;
    ys[low] * (1. - w) + ys[high] * w
}

impl Scheduler {
    pub fn new(name: impl Into<String>, kind: SchedulerKind, config: SchedulerConfig) -> Self {
        Self {
            name: name.into(),
            class_name: kind.class_name(),
            config,
        }
    }

    /// Build from a `scheduler_config.json` document. Keys starting with `_` are metadata and
    /// are kept out of the configuration.
    pub fn from_json(name: impl Into<String>, json: &str) -> Result<Self, SamplerError> {
        let Value::Object(map) = serde_json::from_str::<Value>(json)? else {
            return Err(SamplerError::InvalidConfig(
                "scheduler config is not an object".to_string(),
            ));
        };
        let class_name = map
            .get("_class_name")
            .and_then(Value::as_str)
            .ok_or_else(|| SamplerError::InvalidConfig("missing `_class_name`".to_string()))?
            .to_string();
        let config = map
            .into_iter()
            .filter(|(key, _)| !key.starts_with('_'))
            .collect();
        Ok(Self {
            name: name.into(),
            class_name,
            config,
        })
    }

    pub fn kind(&self) -> Option<SchedulerKind> {
        SchedulerKind::from_class_name(&self.class_name)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn get_usize(&self, key: &str) -> Option<usize> {
        self.config
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.get_usize("num_train_timesteps").unwrap_or(1000)
    }

    /// The training noise schedule.
    pub fn betas(&self) -> Result<Vec<f64>, SamplerError> {
        let n = self.num_train_timesteps();
        let beta_start = self.get_f64("beta_start").unwrap_or(0.0001);
        let beta_end = self.get_f64("beta_end").unwrap_or(0.02);
        match self.get_str("beta_schedule").unwrap_or("linear") {
            "linear" => Ok(linspace(beta_start, beta_end, n)),
            "scaled_linear" => Ok(linspace(beta_start.sqrt(), beta_end.sqrt(), n)
                .into_iter()
                .map(|b| b * b)
                .collect()),
            "squaredcos_cap_v2" => {
                let alpha_bar =
                    |t: f64| ((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).cos().powi(2);
                Ok((0..n)
                    .map(|i| {
                        let t1 = i as f64 / n as f64;
                        let t2 = (i + 1) as f64 / n as f64;
                        (1. - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect())
            }
            other => Err(SamplerError::UnsupportedSchedule(other.to_string())),
        }
    }

    pub fn alphas_cumprod(&self) -> Result<Vec<f64>, SamplerError> {
        let mut acc = 1.;
        Ok(self
            .betas()?
            .into_iter()
            .map(|beta| {
                acc *= 1. - beta;
                acc
            })
            .collect())
    }

    /// Inference timesteps, highest noise first.
    pub fn timesteps(&self, num_steps: usize) -> Result<Vec<f64>, SamplerError> {
        let train = self.num_train_timesteps();
        if num_steps == 0 || num_steps > train {
            return Err(SamplerError::InvalidSteps {
                steps: num_steps,
                train,
            });
        }
        if self.kind() == Some(SchedulerKind::FlowMatchEulerDiscrete) {
            return Ok(self
                .flow_sigmas(num_steps, None)?
                .iter()
                .take(num_steps)
                .map(|sigma| sigma * train as f64)
                .collect());
        }
        let offset = self.get_usize("steps_offset").unwrap_or(0) as f64;
        let timesteps: Vec<f64> = match self.get_str("timestep_spacing").unwrap_or("linspace") {
            "linspace" => linspace(0., (train - 1) as f64, num_steps)
                .into_iter()
                .rev()
                .collect(),
            "leading" => {
                let ratio = (train / num_steps) as f64;
                (0..num_steps)
                    .rev()
                    .map(|i| (i as f64 * ratio).round() + offset)
                    .collect()
            }
            "trailing" => {
                let ratio = train as f64 / num_steps as f64;
                (0..num_steps)
                    .map(|i| (train as f64 - i as f64 * ratio).round() - 1.)
                    .collect()
            }
            other => return Err(SamplerError::UnsupportedSchedule(other.to_string())),
        };
        Ok(timesteps)
    }

    /// Resolution-dependent shift for dynamic flow matching, interpolated between
    /// `base_shift` at `base_image_seq_len` and `max_shift` at `max_image_seq_len`.
    pub fn dynamic_shift(&self, image_seq_len: usize) -> f64 {
        calculate_shift(
            image_seq_len,
            self.get_usize("base_image_seq_len").unwrap_or(256),
            self.get_usize("max_image_seq_len").unwrap_or(4096),
            self.get_f64("base_shift").unwrap_or(0.5),
            self.get_f64("max_shift").unwrap_or(1.15),
        )
    }

    /// Flow-matching sigmas from 1 down to 0, shifted statically or by `mu`.
    ///
    /// With dynamic shifting and no `mu`, the shift for `max_image_seq_len` (the model's
    /// native resolution) is used.
    pub fn flow_sigmas(&self, num_steps: usize, mu: Option<f64>) -> Result<Vec<f64>, SamplerError> {
        let sigmas = (0..=num_steps)
            .map(|v| v as f64 / num_steps as f64)
            .rev();
        if self.get_bool("use_dynamic_shifting").unwrap_or(false) {
            let mu = mu.unwrap_or_else(|| {
                self.dynamic_shift(self.get_usize("max_image_seq_len").unwrap_or(4096))
            });
            Ok(sigmas.map(|sigma| time_shift(mu, 1., sigma)).collect())
        } else {
            let shift = self.get_f64("shift").unwrap_or(1.);
            Ok(sigmas
                .map(|sigma| shift * sigma / (1. + (shift - 1.) * sigma))
                .collect())
        }
    }

    /// Noise levels for each inference timestep followed by a final 0.
    ///
    /// With `use_karras_sigmas` the levels follow the Karras et al. schedule between the same
    /// end points.
    pub fn sigmas(&self, num_steps: usize) -> Result<Vec<f64>, SamplerError> {
        if self.kind() == Some(SchedulerKind::FlowMatchEulerDiscrete) {
            return self.flow_sigmas(num_steps, None);
        }
        let train_sigmas = self
            .alphas_cumprod()?
            .into_iter()
            .map(|ac| ((1. - ac) / ac).sqrt())
            .collect::<Vec<_>>();
        let mut sigmas = self
            .timesteps(num_steps)?
            .into_iter()
            .map(|t| interp_index(t, &train_sigmas))
            .collect::<Vec<_>>();
        if self.get_bool("use_karras_sigmas").unwrap_or(false) {
            sigmas = karras_sigmas(&sigmas, 7.);
        }
        sigmas.push(0.);
        Ok(sigmas)
    }
}

fn karras_sigmas(sigmas: &[f64], rho: f64) -> Vec<f64> {
    let (Some(&max), Some(&min)) = (sigmas.first(), sigmas.last()) else {
        return Vec::new();
    };
    let min_inv = min.powf(1. / rho);
    let max_inv = max.powf(1. / rho);
    linspace(0., 1., sigmas.len())
        .into_iter()
        .map(|ramp| (max_inv + ramp * (min_inv - max_inv)).powf(rho))
        .collect()
}
