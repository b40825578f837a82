//! Compose file parser

use super::config::ComposeConfig;
use crate::error::{LaunchError, Result};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

static INTERPOLATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("interpolation pattern is valid")
});

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        for name in DEFAULT_COMPOSE_FILES {
            let path = dir.join(name);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }

    /// Resolve the descriptor paths to load: explicit files, or the default
    /// file found in `dir`
    pub fn resolve_files(explicit: &[PathBuf], dir: &Path) -> Result<Vec<PathBuf>> {
        if !explicit.is_empty() {
            return Ok(explicit.to_vec());
        }
        Self::find_compose_file(dir)
            .map(|path| vec![path])
            .ok_or_else(|| LaunchError::ComposeNotFound(dir.to_path_buf()))
    }

    /// Parse compose file from path, interpolating from the process environment
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::parse_file_with_env(path, &env)
    }

    /// Parse compose file from path with an explicit variable set
    pub fn parse_file_with_env(path: &Path, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            LaunchError::ComposeParse(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse_str_with_env(&content, env)
    }

    /// Parse compose file from string without interpolation
    pub fn parse_str(content: &str) -> Result<ComposeConfig> {
        serde_yaml::from_str(content)
            .map_err(|e| LaunchError::ComposeParse(format!("Failed to parse YAML: {}", e)))
    }

    /// Interpolate variables then parse
    pub fn parse_str_with_env(content: &str, env: &HashMap<String, String>) -> Result<ComposeConfig> {
        Self::parse_str(&interpolate_string(content, env))
    }

    /// Parse multiple compose files (with merging)
    pub fn parse_files(paths: &[PathBuf]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            tracing::debug!("Loading compose file {}", path.display());
            let file_config = Self::parse_file(path)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two compose configurations. The overlay wins field by field
    /// within a service; services and volumes missing from the base are added.
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.version.is_some() {
            result.version = overlay.version;
        }
        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            let Some(existing) = result.services.get_mut(&name) else {
                result.services.insert(name, service);
                continue;
            };

            // image and build are alternatives, an override of one drops the other
            let overlay_has_image = service.image.is_some();
            let overlay_has_build = service.build.is_some();
            if overlay_has_image {
                existing.image = service.image;
                if !overlay_has_build {
                    existing.build = None;
                }
            }
            if overlay_has_build {
                existing.build = service.build;
                if !overlay_has_image {
                    existing.image = None;
                }
            }
            if service.command.is_some() {
                existing.command = service.command;
            }
            if service.environment.is_some() {
                existing.environment = service.environment;
            }
            if service.expose.is_some() {
                existing.expose = service.expose;
            }
            if service.ports.is_some() {
                existing.ports = service.ports;
            }
            if service.volumes.is_some() {
                existing.volumes = service.volumes;
            }
            if service.depends_on.is_some() {
                existing.depends_on = service.depends_on;
            }
            if service.healthcheck.is_some() {
                existing.healthcheck = service.healthcheck;
            }
            if service.restart.is_some() {
                existing.restart = service.restart;
            }
        }

        for (name, volume) in overlay.volumes {
            result.volumes.insert(name, volume);
        }

        result
    }
}

/// Interpolate `$VAR`, `${VAR}`, `${VAR:-default}` and `${VAR-default}`.
///
/// `$$` is an escaped dollar. `:-` falls back when the variable is unset or
/// empty, `-` only when it is unset. Unset variables without a default
/// become the empty string.
pub fn interpolate_string(s: &str, env: &HashMap<String, String>) -> String {
    INTERPOLATION
        .replace_all(s, |caps: &Captures| {
            if &caps[0] == "$$" {
                return "$".to_string();
            }

            let var = caps
                .get(1)
                .or_else(|| caps.get(4))
                .map(|m| m.as_str())
                .unwrap_or_default();
            let value = env.get(var);

            match (caps.get(2).map(|m| m.as_str()), caps.get(3)) {
                (Some(":-"), Some(default)) => match value {
                    Some(v) if !v.is_empty() => v.clone(),
                    _ => default.as_str().to_string(),
                },
                (Some("-"), Some(default)) => value
                    .cloned()
                    .unwrap_or_else(|| default.as_str().to_string()),
                _ => value.cloned().unwrap_or_else(|| {
                    tracing::warn!("Variable {} is not set, defaulting to empty string", var);
                    String::new()
                }),
            }
        })
        .into_owned()
}
