use std::{path::PathBuf, time::Instant};

use clap::Parser;
use sdhub_core::{friendly_name, ExtensionFilter, ModelLoader, ModelRequest, Settings, TokenSource};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Folder with single-file models
    #[arg(short, long)]
    models: PathBuf,

    /// Hugging Face cache with diffusers repositories
    #[arg(short, long)]
    diffusers: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings {
        no_download: true,
        ..Default::default()
    };
    let mut loader = ModelLoader::from_settings(&settings, TokenSource::None)?;

    let mut request = ModelRequest::new(&args.models);
    request.filter = ExtensionFilter::new(&[".safetensors", ".ckpt"], &[".vae.safetensors"]);

    let start = Instant::now();
    let models = loader.load_models(&request);
    println!("First scan took: {:.2}ms", start.elapsed().as_secs_f64() * 1000.);

    // Within the debounce window the listing comes from the cache.
    let start = Instant::now();
    let again = loader.load_models(&request);
    println!("Second scan took: {:.2}ms", start.elapsed().as_secs_f64() * 1000.);
    assert_eq!(models, again);

    for model in &models {
        println!("{:<40} {model}", friendly_name(&model.to_string()));
    }

    let cache = args.diffusers.unwrap_or(settings.diffusers_dir.clone());
    for name in loader.load_diffusers_models(&cache, None) {
        println!("diffusers: {name}");
    }

    Ok(())
}
