use std::path::PathBuf;

use clap::{Parser, Subcommand};
use cliclack::select;
use sdhub_core::{
    cleanup_models, BaseModel, BetaSchedule, CivitClient, DownloadOptions, ExtensionFilter,
    HubClient, ModelHandle, ModelLoader, ModelRequest, ModelSource, PredictionType,
    SamplerRegistry, SchedulerConfig, Settings, TokenSource,
};
use serde_json::Value;
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Subcommand)]
enum Command {
    /// List single-file models in a model folder.
    Models {
        /// Folder to search. Defaults to the checkpoint folder from the settings.
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Additional folder to search.
        #[arg(long)]
        command_path: Option<PathBuf>,

        /// Accepted file name suffixes, for example `.safetensors`.
        #[arg(long = "ext")]
        ext: Vec<String>,

        /// Rejected file name suffixes.
        #[arg(long)]
        exclude: Vec<String>,

        /// Reported when no model is found locally.
        #[arg(long)]
        url: Option<String>,
    },

    /// List diffusers repositories in the Hugging Face cache.
    Diffusers {
        /// Cache folder. Defaults to the diffusers folder from the settings.
        #[arg(short, long)]
        path: Option<PathBuf>,

        #[arg(long)]
        command_path: Option<PathBuf>,
    },

    /// List the samplers.
    Samplers {
        /// Samplers to offer. Defaults to `show_samplers` from the settings.
        #[arg(long)]
        show: Vec<String>,
    },

    /// Resolve the scheduler configuration of a sampler for a model.
    Resolve {
        /// Sampler name or alias. Asked for interactively when omitted.
        #[arg(short, long)]
        sampler: Option<String>,

        /// Model ID (cached repository, local path or Hugging Face model ID)
        #[arg(short, long)]
        model: String,

        /// Scheduler option override as `key=value`; the value is parsed as JSON when possible.
        #[arg(long = "set", value_parser = parse_key_value)]
        set: Vec<(String, Value)>,

        /// Also print the timesteps and sigmas for this many steps.
        #[arg(long)]
        steps: Option<usize>,

        #[arg(long)]
        prediction_type: Option<PredictionType>,

        #[arg(long)]
        beta_schedule: Option<BetaSchedule>,

        /// Use Karras sigmas where the scheduler supports them.
        #[arg(long)]
        karras: bool,
    },

    /// Search the hub for text-to-image diffusers models.
    Search {
        keyword: String,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Download a diffusers repository into the cache.
    Download {
        hub_id: String,

        /// Weight variant, for example `fp16`.
        #[arg(long)]
        variant: Option<String>,

        #[arg(long)]
        revision: Option<String>,
    },

    /// Search and download checkpoints from CivitAI.
    Civitai {
        #[command(subcommand)]
        action: CivitaiCommand,
    },

    /// Move models left in legacy folders into the models folder from the settings.
    Cleanup {
        /// Application folder holding the legacy folders. Defaults to the current directory.
        #[arg(long)]
        app_root: Option<PathBuf>,
    },
}

#[derive(Debug, Subcommand)]
enum CivitaiCommand {
    /// List the newest checkpoints.
    Search {
        /// Name to search for.
        name: Option<String>,

        #[arg(long)]
        tag: Option<String>,

        /// Model family: `sd15`, `sdxl` or `other`.
        #[arg(long, default_value = "sd15")]
        base: BaseModel,
    },

    /// Download a checkpoint into the checkpoint folder.
    Download {
        /// File URL of the model version.
        url: String,

        /// File name to save as.
        #[arg(short, long)]
        name: String,

        /// Subfolder of the checkpoint folder.
        #[arg(long, default_value = "")]
        path: String,

        /// Preview image saved next to the model.
        #[arg(long)]
        preview: Option<String>,
    },
}

#[derive(Parser)]
#[command(name = "sdhub", version, about)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    /// Settings file. By default, settings.json in the user's config directory is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Hugging Face token. Useful for accessing gated repositories.
    /// By default, the Hugging Face token at ~/.cache/huggingface/token is used.
    #[arg(long, global = true)]
    token: Option<String>,
}

fn parse_key_value(arg: &str) -> Result<(String, Value), String> {
    let (key, value) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected `key=value`, got `{arg}`"))?;
    if key.is_empty() {
        return Err("empty option name".to_string());
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::load(&args.config.unwrap_or_else(Settings::default_path));
    let token = args
        .token
        .map(TokenSource::Literal)
        .unwrap_or(TokenSource::CacheToken);

    match args.command {
        Command::Models {
            path,
            command_path,
            ext,
            exclude,
            url,
        } => {
            let mut loader = ModelLoader::from_settings(&settings, token)?;
            let mut request = ModelRequest::new(path.unwrap_or(settings.ckpt_dir.clone()));
            request.command_path = command_path.or(settings.command_path.clone());
            request.filter = ExtensionFilter::new(ext.as_slice(), exclude.as_slice());
            request.model_url = url;
            for model in loader.load_models(&request) {
                println!("{model}");
            }
        }
        Command::Diffusers { path, command_path } => {
            let mut loader = ModelLoader::from_settings(&settings, token)?;
            let path = path.unwrap_or(settings.diffusers_dir.clone());
            let shown = loader.load_diffusers_models(&path, command_path.as_deref());
            let repos = loader
                .catalog()
                .repos()
                .iter()
                .filter(|repo| shown.contains(&repo.name))
                .collect::<Vec<_>>();
            println!("{}", serde_json::to_string_pretty(&repos)?);
        }
        Command::Samplers { show } => {
            let mut registry = SamplerRegistry::diffusers();
            let show = if show.is_empty() {
                settings.show_samplers.clone()
            } else {
                show
            };
            registry.set_visible(show.as_slice());
            for sampler in registry.visible() {
                let class_name = sampler
                    .kind
                    .map(|kind| kind.class_name())
                    .unwrap_or_else(|| "model default".to_string());
                println!("{}\t{class_name}", sampler.name);
            }
        }
        Command::Resolve {
            sampler,
            model,
            set,
            steps,
            prediction_type,
            beta_schedule,
            karras,
        } => {
            let registry = SamplerRegistry::diffusers();
            let sampler = match sampler {
                Some(name) => match registry.resolve_alias(&name) {
                    Some(canonical) => canonical.to_string(),
                    None => {
                        warn!("unknown sampler `{name}`");
                        name
                    }
                },
                None => {
                    let mut prompt = select("Sampler:");
                    for sampler in registry.all() {
                        let hint = sampler.kind.map(|kind| kind.class_name()).unwrap_or_default();
                        prompt = prompt.item(sampler.name, sampler.name, hint);
                    }
                    prompt.interact()?.to_string()
                }
            };

            let mut loader = ModelLoader::from_settings(&settings, token.clone())?;
            loader.load_diffusers_models(&settings.diffusers_dir, None);
            let source = match loader.catalog().get(&model) {
                Some(repo) => ModelSource::local(&repo.path),
                None => ModelSource::from_model_id(&model),
            };
            let mut handle = ModelHandle::load(source, false, token, None)?;

            let mut prefs = settings.schedulers.clone();
            if let Some(prediction_type) = prediction_type {
                prefs.prediction_type = prediction_type;
            }
            if let Some(beta_schedule) = beta_schedule {
                prefs.beta_schedule = beta_schedule;
            }
            prefs.use_karras |= karras;
            let overrides = set.into_iter().collect::<SchedulerConfig>();

            let scheduler = registry.create_sampler(&sampler, &mut handle, &overrides, &prefs)?;
            info!("resolved {} as {}", scheduler.name, scheduler.class_name);
            let mut out = serde_json::to_value(&scheduler)?;
            if let (Some(steps), Value::Object(map)) = (steps, &mut out) {
                map.insert("timesteps".to_string(), serde_json::to_value(scheduler.timesteps(steps)?)?);
                map.insert("sigmas".to_string(), serde_json::to_value(scheduler.sigmas(steps)?)?);
            }
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Search { keyword, limit } => {
            let hub = HubClient::new(settings.hub_endpoint.clone(), token)?;
            let models = hub.search_models(&keyword, limit)?;
            println!("{}", serde_json::to_string_pretty(&models)?);
        }
        Command::Download {
            hub_id,
            variant,
            revision,
        } => {
            if settings.no_download {
                anyhow::bail!("downloads are disabled in the settings");
            }
            let hub = HubClient::new(settings.hub_endpoint.clone(), token)?;
            let dir = hub.download_diffusers_model(
                &hub_id,
                &DownloadOptions {
                    cache_dir: Some(settings.diffusers_dir.clone()),
                    variant,
                    revision,
                },
            )?;
            println!("{}", dir.display());
        }
        Command::Civitai {
            action: CivitaiCommand::Search { name, tag, base },
        } => {
            let civitai = CivitClient::new(settings.civitai_endpoint.clone())?;
            let models = civitai.search(name.as_deref(), tag.as_deref(), base)?;
            println!("{}", serde_json::to_string_pretty(&models)?);
        }
        Command::Civitai {
            action:
                CivitaiCommand::Download {
                    url,
                    name,
                    path,
                    preview,
                },
        } => {
            let mut loader = ModelLoader::from_settings(&settings, token)?;
            let file = loader.download_civit_model(
                &settings.ckpt_dir,
                &path,
                &name,
                &url,
                preview.as_deref(),
            )?;
            println!("{}", file.display());
        }
        Command::Cleanup { app_root } => {
            let app_root = match app_root {
                Some(app_root) => app_root,
                None => std::env::current_dir()?,
            };
            cleanup_models(&app_root, &settings.models_dir);
        }
    }

    Ok(())
}
