use std::collections::HashSet;

use sdhub_core::{
    algorithm_defaults, global_defaults, BetaSchedule, DpmSolverAlgorithm, ModelHandle,
    PredictionType, SamplerError, SamplerRegistry, Scheduler, SchedulerConfig, SchedulerKind,
    SchedulerPreferences, UniPcVariant,
};
use serde_json::{json, Value};

fn sd15() -> ModelHandle {
    let scheduler = Scheduler::from_json(
        "Default",
        r#"{
            "_class_name": "PNDMScheduler",
            "_diffusers_version": "0.6.0",
            "beta_end": 0.012,
            "beta_schedule": "scaled_linear",
            "beta_start": 0.00085,
            "num_train_timesteps": 1000,
            "set_alpha_to_one": false,
            "skip_prk_steps": true,
            "steps_offset": 1,
            "trained_betas": null,
            "clip_sample": false
        }"#,
    )
    .unwrap();
    ModelHandle::new("sd15", "StableDiffusionPipeline", Some(scheduler))
}

fn config(value: Value) -> SchedulerConfig {
    let Value::Object(map) = value else {
        unreachable!()
    };
    map
}

#[test]
fn no_layers_means_algorithm_defaults_over_globals() {
    let registry = SamplerRegistry::diffusers();
    for sampler in registry.all().iter().skip(1) {
        let mut model = ModelHandle::new("bare", "StableDiffusionPipeline", None);
        let scheduler = registry
            .create_sampler(
                sampler.name,
                &mut model,
                &SchedulerConfig::new(),
                &SchedulerPreferences::default(),
            )
            .unwrap();

        let mut expected = global_defaults().clone();
        for (key, value) in algorithm_defaults(sampler.name) {
            expected.insert(key, value);
        }
        assert_eq!(scheduler.config, expected, "{}", sampler.name);
        assert_eq!(scheduler.kind(), sampler.kind);
        assert_eq!(scheduler.name, sampler.name);
    }
}

#[test]
fn later_layers_never_add_keys() {
    let registry = SamplerRegistry::diffusers();
    let prefs = SchedulerPreferences {
        prediction_type: PredictionType::Sample,
        beta_schedule: BetaSchedule::SquaredcosCapV2,
        use_karras: true,
        use_thresholding: true,
        use_loworder: false,
        solver_order: 3,
        uni_pc_variant: UniPcVariant::Bh1,
        dpm_solver: DpmSolverAlgorithm::DpmSolver,
        beta_start: 0.001,
        beta_end: 0.03,
    };
    let overrides = config(json!({ "timestep_spacing": "trailing", "rho": 7.0, "shift": 3.0 }));
    for sampler in registry.all().iter().skip(1) {
        let mut model = sd15();
        let scheduler = registry
            .create_sampler(sampler.name, &mut model, &overrides, &prefs)
            .unwrap();
        let schema = global_defaults()
            .keys()
            .chain(algorithm_defaults(sampler.name).keys())
            .cloned()
            .collect::<HashSet<_>>();
        for key in scheduler.config.keys() {
            assert!(schema.contains(key), "{} gained `{key}`", sampler.name);
        }
        assert_eq!(scheduler.config["beta_schedule"], json!("squaredcos_cap_v2"));
        assert_eq!(scheduler.config["prediction_type"], json!("sample"));
        assert_eq!(scheduler.config["beta_start"], json!(0.001));
    }
}

#[test]
fn model_defaults_flow_into_the_new_scheduler() {
    let registry = SamplerRegistry::diffusers();
    let mut model = sd15();
    let scheduler = registry
        .create_sampler(
            "DDIM",
            &mut model,
            &SchedulerConfig::new(),
            &SchedulerPreferences::default(),
        )
        .unwrap();
    assert_eq!(scheduler.kind(), Some(SchedulerKind::Ddim));
    assert_eq!(scheduler.config["beta_schedule"], json!("scaled_linear"));
    assert_eq!(scheduler.config["steps_offset"], json!(1));
    assert_eq!(scheduler.config["clip_sample"], json!(false));
    assert_eq!(scheduler.config["set_alpha_to_one"], json!(false));
    assert!(!scheduler.config.contains_key("skip_prk_steps"));
}

#[test]
fn original_config_is_kept_across_replacements() {
    let registry = SamplerRegistry::diffusers();
    let prefs = SchedulerPreferences::default();
    let mut model = sd15();
    let original = model.scheduler.as_ref().unwrap().config.clone();

    let euler = registry
        .create_sampler("Euler", &mut model, &SchedulerConfig::new(), &prefs)
        .unwrap();
    assert_eq!(model.scheduler.as_ref(), Some(&euler));
    assert_eq!(model.scheduler_config.as_ref(), Some(&original));

    let pndm = registry
        .create_sampler("PNDM", &mut model, &SchedulerConfig::new(), &prefs)
        .unwrap();
    assert_eq!(model.scheduler_config.as_ref(), Some(&original));
    // Euler has no skip_prk_steps; the value still comes from the original config.
    assert_eq!(pndm.config["skip_prk_steps"], json!(true));
    assert_eq!(pndm.config["steps_offset"], json!(1));
}

#[test]
fn default_keeps_the_current_scheduler() {
    let registry = SamplerRegistry::diffusers();
    let mut model = sd15();
    let current = model.scheduler.clone().unwrap();
    let prefs = SchedulerPreferences::default();

    let kept = registry
        .create_sampler("Default", &mut model, &SchedulerConfig::new(), &prefs)
        .unwrap();
    assert_eq!(kept, current);
    assert!(model.scheduler_config.is_none());

    let mut bare = ModelHandle::new("bare", "StableDiffusionPipeline", None);
    assert!(matches!(
        registry.create_sampler("Default", &mut bare, &SchedulerConfig::new(), &prefs),
        Err(SamplerError::MissingScheduler(_))
    ));
}

#[test]
fn unknown_names_fall_back_to_first_entry() {
    let registry = SamplerRegistry::diffusers();
    let mut model = sd15();
    let current = model.scheduler.clone().unwrap();
    let scheduler = registry
        .create_sampler(
            "DPM++ 2M",
            &mut model,
            &SchedulerConfig::new(),
            &SchedulerPreferences::default(),
        )
        .unwrap();
    assert_eq!(scheduler, current);
}

#[test]
fn overrides_beat_model_defaults() {
    let registry = SamplerRegistry::diffusers();
    let mut model = sd15();
    let scheduler = registry
        .create_sampler(
            "LMSD",
            &mut model,
            &config(json!({ "steps_offset": 0, "timestep_spacing": "leading" })),
            &SchedulerPreferences::default(),
        )
        .unwrap();
    assert_eq!(scheduler.config["steps_offset"], json!(0));
    assert_eq!(scheduler.timesteps(4).unwrap(), vec![750., 500., 250., 0.]);
    let sigmas = scheduler.sigmas(4).unwrap();
    assert_eq!(sigmas.len(), 5);
}
