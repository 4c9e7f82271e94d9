use figment::{Figment, providers::{Format, Toml, Json, Yaml, Env}};
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use crate::error::{ConfigError, Result};
use super::schema::PluginHostConfig;

const ENV_PREFIX: &str = "PLUGIN_HOST_";

pub async fn load_from_env_or_file() -> Result<PluginHostConfig> {
    let config: PluginHostConfig = Figment::new()
        .merge(Toml::file("plugin-host.toml"))
        .merge(Json::file("plugin-host.json"))
        .merge(Yaml::file("plugin-host.yaml"))
        .merge(Yaml::file("plugin-host.yml"))
        .merge(Env::prefixed(ENV_PREFIX).split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<PluginHostConfig> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into()
            ).into());
        }
    };

    if !path.exists() {
        return Err(ConfigError::Parse(format!("Config file not found: {}", path.display())).into());
    }

    let config: PluginHostConfig = figment
        .merge(Env::prefixed(ENV_PREFIX).split("_"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    validate(&config)?;
    apply_env_substitutions(config)
}

pub fn validate(config: &PluginHostConfig) -> Result<()> {
    let plugins = &config.plugins;

    if plugins.handshake_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "Plugin handshake timeout must be greater than 0".into()
        ).into());
    }

    let mut seen = HashSet::new();
    for entry in &plugins.plugins {
        if entry.name.trim().is_empty() {
            return Err(ConfigError::Validation("Plugin has empty name".into()).into());
        }
        if !seen.insert(entry.name.as_str()) {
            return Err(ConfigError::Validation(
                format!("Plugin '{}' is configured more than once", entry.name)
            ).into());
        }
    }

    let tracing = &config.telemetry.tracing;
    if !(0.0..=1.0).contains(&tracing.sampler) {
        return Err(ConfigError::Validation(
            format!("Tracing sampler must be between 0 and 1, got {}", tracing.sampler)
        ).into());
    }
    for exporter in tracing.exporters.iter().filter(|e| !e.disabled) {
        if exporter.exporter.endpoint.trim().is_empty() {
            return Err(ConfigError::Validation("Tracing exporter has empty endpoint".into()).into());
        }
    }

    for header in &plugins.forward_headers {
        if http::HeaderName::from_bytes(header.trim().as_bytes()).is_err() {
            return Err(ConfigError::Validation(
                format!("Invalid forwarded header name '{}'", header)
            ).into());
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: PluginHostConfig) -> Result<PluginHostConfig> {
    let re = env_var_pattern()?;

    config.plugins.path = substitute_path(&re, &config.plugins.path)?;

    for entry in &mut config.plugins.plugins {
        if let Some(path) = &entry.path {
            entry.path = Some(substitute_path(&re, path)?);
        }
        for arg in &mut entry.args {
            *arg = substitute_env_vars(&re, arg)?;
        }
        for value in entry.env.values_mut() {
            *value = substitute_env_vars(&re, value)?;
        }
    }

    for exporter in &mut config.telemetry.tracing.exporters {
        exporter.exporter.endpoint = substitute_env_vars(&re, &exporter.exporter.endpoint)?;
        for value in exporter.exporter.headers.values_mut() {
            *value = substitute_env_vars(&re, value)?;
        }
    }

    Ok(config)
}

fn env_var_pattern() -> Result<Regex> {
    Regex::new(r"\$\{([^}]+)\}").map_err(|e| ConfigError::Parse(e.to_string()).into())
}

fn substitute_path(re: &Regex, path: &Path) -> Result<PathBuf> {
    match path.to_str() {
        Some(s) => Ok(PathBuf::from(substitute_env_vars(re, s)?)),
        None => Ok(path.to_path_buf()),
    }
}

/// Expand `${VAR}` and `${VAR:-default}`. A missing variable without a default is an error.
fn substitute_env_vars(re: &Regex, input: &str) -> Result<String> {
    let mut result = input.to_string();

    for cap in re.captures_iter(input) {
        let expr = &cap[1];
        let (name, default) = match expr.split_once(":-") {
            Some((name, default)) => (name, Some(default)),
            None => (expr, None),
        };

        let value = match (std::env::var(name), default) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.to_string(),
            (Err(_), None) => {
                return Err(ConfigError::EnvVar(
                    format!("Environment variable '{}' not found", name)
                ).into());
            }
        };
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}
