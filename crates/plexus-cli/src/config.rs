use std::collections::HashMap;
use std::path::{Path, PathBuf};

use plexus_ai::{AdapterConfig, JobPollerConfig, ProviderKind, DEFAULT_MAX_CONCURRENT};
use serde::Deserialize;

const DEFAULT_CONF_DIR_NAME: &str = ".plexus";

/// Settings read from `plexus.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct CliConfig {
    pub providers: HashMap<ProviderKind, ProviderSettings>,
    pub poller: JobPollerConfig,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProviderSettings {
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            providers: HashMap::new(),
            poller: JobPollerConfig::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
        }
    }
}

impl CliConfig {
    /// Preset for `kind`, overlaid with file settings and then `model_override`.
    pub fn adapter_config(
        &self,
        kind: ProviderKind,
        model_override: Option<&str>,
    ) -> AdapterConfig {
        let mut config = kind.default_config();
        if let Some(settings) = self.providers.get(&kind) {
            if let Some(api_key) = &settings.api_key {
                config = config.with_api_key(api_key.clone());
            }
            if let Some(model) = &settings.model {
                config = config.with_model(model.clone());
            }
            if let Some(base_url) = &settings.base_url {
                config = config.with_base_url(base_url.clone());
            }
        }
        if let Some(model) = model_override {
            config = config.with_model(model);
        }
        config
    }
}

#[derive(Debug, Deserialize, Default)]
struct PlexusTomlFile {
    #[serde(default)]
    providers: HashMap<String, PlexusTomlProvider>,
    #[serde(default)]
    poller: Option<JobPollerConfig>,
    #[serde(default)]
    max_concurrent: Option<usize>,
    #[serde(default)]
    env: HashMap<String, String>,
}

#[derive(Debug, Deserialize, Default)]
struct PlexusTomlProvider {
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    base_url: Option<String>,
}

pub fn default_config_path() -> PathBuf {
    home_dir().join(DEFAULT_CONF_DIR_NAME).join("plexus.toml")
}

pub fn default_log_dir() -> PathBuf {
    home_dir().join(DEFAULT_CONF_DIR_NAME)
}

/// A missing file at the default location yields the default config; a
/// missing explicit path is an error.
pub fn load_cli_config(path: Option<&Path>) -> Result<CliConfig, String> {
    let (path, explicit) = match path {
        Some(path) => (expand_path_with_home(path), true),
        None => (default_config_path(), false),
    };
    if !path.exists() && !explicit {
        return Ok(CliConfig::default());
    }
    let content = std::fs::read_to_string(&path)
        .map_err(|error| format!("read {} failed: {error}", path.display()))?;
    parse_cli_config(&content)
}

pub fn parse_cli_config(content: &str) -> Result<CliConfig, String> {
    let parsed: PlexusTomlFile =
        toml::from_str(content).map_err(|error| format!("parse plexus.toml failed: {error}"))?;

    let mut providers = HashMap::new();
    for (name, provider) in parsed.providers {
        let kind = name
            .parse::<ProviderKind>()
            .map_err(|error| format!("providers.{name}: {error}"))?;
        let settings = ProviderSettings {
            api_key: provider
                .api_key
                .as_deref()
                .and_then(|value| resolve_config_value(value, &parsed.env)),
            model: provider.model.filter(|model| !model.trim().is_empty()),
            base_url: provider.base_url.filter(|url| !url.trim().is_empty()),
        };
        providers.insert(kind, settings);
    }

    let max_concurrent = parsed.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT);
    if max_concurrent == 0 {
        return Err("max_concurrent must be at least 1".to_string());
    }

    Ok(CliConfig {
        providers,
        poller: parsed.poller.unwrap_or_default(),
        max_concurrent,
    })
}

/// `$NAME` reads from the file's `[env]` table first, then the process environment.
fn resolve_config_value(value: &str, env_map: &HashMap<String, String>) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(env_key) = trimmed.strip_prefix('$') {
        return env_map
            .get(env_key)
            .cloned()
            .or_else(|| std::env::var(env_key).ok())
            .filter(|resolved| !resolved.trim().is_empty());
    }
    Some(trimmed.to_string())
}

fn expand_path_with_home(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    if raw == "~" {
        return home_dir();
    }
    if let Some(suffix) = raw.strip_prefix("~/") {
        return home_dir().join(suffix);
    }
    path.to_path_buf()
}

fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_cli_config_reads_providers_poller_and_env_refs() {
        let config = parse_cli_config(
            r#"
max_concurrent = 3

[env]
GROQ_TOKEN = "gsk-from-file"

[providers.groq]
api_key = "$GROQ_TOKEN"
model = "llama-3.1-8b-instant"

[providers.fal-image]
api_key = "fal-literal"
base_url = "http://127.0.0.1:8080"

[poller]
max_retries = 5
retry_delay_ms = 200
"#,
        )
        .expect("config should parse");

        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.poller.max_retries, 5);
        assert_eq!(config.poller.retry_delay, Duration::from_millis(200));

        let groq = config.adapter_config(ProviderKind::Groq, None);
        assert_eq!(groq.api_key.as_deref(), Some("gsk-from-file"));
        assert_eq!(groq.default_model, "llama-3.1-8b-instant");

        let fal = config.adapter_config(ProviderKind::FalImage, Some("fal-ai/flux-pro/v1.1"));
        assert_eq!(fal.base_url, "http://127.0.0.1:8080");
        assert_eq!(fal.default_model, "fal-ai/flux-pro/v1.1");
    }

    #[test]
    fn parse_cli_config_rejects_unknown_provider() {
        let error = parse_cli_config("[providers.openai]\napi_key = \"x\"\n")
            .expect_err("unknown provider");
        assert!(error.contains("providers.openai"), "{error}");
    }

    #[test]
    fn parse_cli_config_rejects_zero_concurrency() {
        assert!(parse_cli_config("max_concurrent = 0\n").is_err());
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config = parse_cli_config("").expect("empty config");
        assert_eq!(config, CliConfig::default());
        assert_eq!(
            config.adapter_config(ProviderKind::Deepseek, None).default_model,
            "deepseek-chat"
        );
    }

    #[test]
    fn load_cli_config_reads_explicit_path() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("plexus.toml");
        std::fs::write(&path, "[providers.cohere]\nmodel = \"command-light\"\n")
            .expect("write config");

        let config = load_cli_config(Some(&path)).expect("config should load");
        assert_eq!(
            config.adapter_config(ProviderKind::Cohere, None).default_model,
            "command-light"
        );
    }

    #[test]
    fn load_cli_config_requires_explicit_path_to_exist() {
        let dir = tempfile::tempdir().expect("temp dir");
        let error =
            load_cli_config(Some(&dir.path().join("missing.toml"))).expect_err("missing file");
        assert!(error.contains("missing.toml"), "{error}");
    }
}
