use std::{env, fs, path::PathBuf};

/// Where to find the Hugging Face token used for gated or private repositories.
#[derive(Debug, Clone, Default)]
pub enum TokenSource {
    Literal(String),
    EnvVar(String),
    Path(PathBuf),
    /// The token saved by `huggingface-cli login` at `~/.cache/huggingface/token`.
    #[default]
    CacheToken,
    None,
}

fn cache_token_path() -> anyhow::Result<PathBuf> {
    if let Ok(home) = env::var("HF_HOME") {
        return Ok(PathBuf::from(home).join("token"));
    }
    let home = dirs::home_dir().ok_or(anyhow::Error::msg("could not determine home directory"))?;
    Ok(home.join(".cache").join("huggingface").join("token"))
}

/// Resolve a token source. Missing files or variables yield `None`, empty tokens are skipped.
pub fn get_token(source: &TokenSource) -> anyhow::Result<Option<String>> {
    let token = match source {
        TokenSource::Literal(data) => Some(data.clone()),
        TokenSource::EnvVar(envvar) => env::var(envvar).ok(),
        TokenSource::Path(path) => fs::read_to_string(path).ok(),
        TokenSource::CacheToken => fs::read_to_string(cache_token_path()?).ok(),
        TokenSource::None => None,
    };
    Ok(token
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_is_trimmed() {
        let token = get_token(&TokenSource::Literal("  hf_abc\n".to_string())).unwrap();
        assert_eq!(token.as_deref(), Some("hf_abc"));
    }

    #[test]
    fn missing_path_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let token = get_token(&TokenSource::Path(dir.path().join("nope"))).unwrap();
        assert!(token.is_none());
    }

    #[test]
    fn blank_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        fs::write(&path, "\n").unwrap();
        assert!(get_token(&TokenSource::Path(path)).unwrap().is_none());
    }
}
