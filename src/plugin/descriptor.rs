//! Plugin binary resolution and validation

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::ValidationError;

/// Where to find a plugin and how to launch it. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDescriptor {
    /// Registry key, also the service name dispensed from the plugin.
    pub logical_name: String,
    pub path: PathBuf,
    /// Arguments passed to the executable.
    pub launch_command: Vec<String>,
    /// Extra environment for the child.
    pub env: HashMap<String, String>,
}

/// A descriptor whose executable passed [`validate_plugin_path`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedDescriptor {
    descriptor: PluginDescriptor,
}

impl ValidatedDescriptor {
    pub fn logical_name(&self) -> &str {
        &self.descriptor.logical_name
    }

    pub fn path(&self) -> &Path {
        &self.descriptor.path
    }

    pub fn launch_command(&self) -> &[String] {
        &self.descriptor.launch_command
    }

    pub fn env(&self) -> &HashMap<String, String> {
        &self.descriptor.env
    }
}

impl PluginDescriptor {
    pub fn new(logical_name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            logical_name: logical_name.into(),
            path: path.into(),
            launch_command: Vec::new(),
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.launch_command = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Resolve a relative path against `base_dir`.
    pub fn resolve(mut self, base_dir: &Path) -> Self {
        if self.path.is_relative() {
            self.path = base_dir.join(&self.path);
        }
        self
    }

    pub fn validate(&self) -> Result<ValidatedDescriptor, ValidationError> {
        let path = validate_plugin_path(&self.path)?;
        Ok(ValidatedDescriptor {
            descriptor: Self {
                path,
                ..self.clone()
            },
        })
    }
}

/// Check that `path` names a regular, non-empty, executable file.
pub fn validate_plugin_path(path: &Path) -> Result<PathBuf, ValidationError> {
    let metadata = match std::fs::metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ValidationError::PluginNotFound(path.to_path_buf()))
        }
        Err(e) => {
            return Err(ValidationError::Inaccessible {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
        }
    };

    if metadata.is_dir() {
        return Err(ValidationError::PluginIsDirectory(path.to_path_buf()));
    }
    if metadata.len() == 0 {
        return Err(ValidationError::PluginEmpty(path.to_path_buf()));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if metadata.permissions().mode() & 0o111 == 0 {
            return Err(ValidationError::PluginNotExecutable(path.to_path_buf()));
        }
    }

    Ok(path.to_path_buf())
}

/// Conventional location of a plugin binary: `<base>/<name>/bin/<os>_<arch>`.
pub fn resolve_plugin_path(base: &Path, name: &str) -> PathBuf {
    base.join(name).join("bin").join(format!("{}_{}", go_os(), go_arch()))
}

fn go_os() -> &'static str {
    match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    }
}

fn go_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        other => other,
    }
}
