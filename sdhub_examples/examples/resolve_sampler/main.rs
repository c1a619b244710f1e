use clap::Parser;
use sdhub_core::{
    ModelHandle, ModelSource, SamplerRegistry, SchedulerConfig, SchedulerPreferences, TokenSource,
};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Model ID (local path or Hugging Face model ID)
    #[arg(short, long, default_value = "stabilityai/stable-diffusion-2-1")]
    model_id: String,

    /// Number of denoising steps
    #[arg(short, long, default_value_t = 20)]
    num_steps: usize,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut model = ModelHandle::load(
        ModelSource::from_model_id(args.model_id),
        false,
        TokenSource::CacheToken,
        None,
    )?;

    let registry = SamplerRegistry::diffusers();
    let prefs = SchedulerPreferences {
        use_karras: true,
        ..Default::default()
    };
    for sampler in registry.all() {
        let scheduler =
            registry.create_sampler(sampler.name, &mut model, &SchedulerConfig::new(), &prefs)?;
        let sigmas = scheduler.sigmas(args.num_steps)?;
        println!(
            "{:<8} {:<32} sigma_max={:.3}",
            sampler.name, scheduler.class_name, sigmas[0]
        );
    }

    Ok(())
}
