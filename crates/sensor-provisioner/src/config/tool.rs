use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::executor::StageKind;

pub const TOOL_CONFIG_FILE: &str = "provisioner.toml";
pub const DEFAULT_DEVICE_ENV_VAR: &str = "SENSOR_ENV";

fn default_command() -> Vec<String> {
    vec!["pio".into()]
}

fn default_env_var() -> String {
    DEFAULT_DEVICE_ENV_VAR.into()
}

/// Optional per-project settings read from `provisioner.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolConfig {
    pub tool: ExternalToolConfig,
    pub paths: PathsConfig,
    pub timeouts: TimeoutsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExternalToolConfig {
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    /// Environment variable the tool's pre-build hook reads the device id from.
    #[serde(default = "default_env_var")]
    pub device_env_var: String,
}

impl Default for ExternalToolConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            device_env_var: default_env_var(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub project_descriptor: String,
    pub credentials: String,
    pub artifact: String,
    pub version_header: String,
    pub sdkconfig_defaults: String,
    pub build_dirs: Vec<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            project_descriptor: "platformio.ini".into(),
            credentials: "credentials.ini".into(),
            artifact: "include/device_config.h".into(),
            version_header: "include/git_version.h".into(),
            sdkconfig_defaults: "sdkconfig.defaults".into(),
            build_dirs: vec!["build".into(), ".pio/build".into()],
        }
    }
}

/// Per-stage timeouts in seconds. Unset means wait for the tool indefinitely.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsConfig {
    pub clean: Option<u64>,
    pub compile: Option<u64>,
    pub upload: Option<u64>,
}

impl TimeoutsConfig {
    pub fn all(secs: u64) -> Self {
        Self {
            clean: Some(secs),
            compile: Some(secs),
            upload: Some(secs),
        }
    }

    /// Profile installation is local and never times out.
    pub fn for_stage(&self, stage: StageKind) -> Option<Duration> {
        let secs = match stage {
            StageKind::Clean => self.clean,
            StageKind::Compile => self.compile,
            StageKind::Upload => self.upload,
            StageKind::InstallProfile => None,
        };
        secs.map(Duration::from_secs)
    }
}

impl ToolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tool.command.iter().all(|s| s.trim().is_empty()) {
            return Err(Error::msg(format!(
                "{TOOL_CONFIG_FILE}: [tool].command must not be empty"
            )));
        }
        if self.tool.device_env_var.trim().is_empty() {
            return Err(Error::msg(format!(
                "{TOOL_CONFIG_FILE}: [tool].device_env_var must not be empty"
            )));
        }
        for (name, secs) in [
            ("clean", self.timeouts.clean),
            ("compile", self.timeouts.compile),
            ("upload", self.timeouts.upload),
        ] {
            if secs == Some(0) {
                return Err(Error::msg(format!(
                    "{TOOL_CONFIG_FILE}: [timeouts].{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Loads `provisioner.toml` from the project root, or defaults when the file is absent.
pub fn load(root: &Path) -> Result<ToolConfig> {
    let path = root.join(TOOL_CONFIG_FILE);
    if !path.is_file() {
        return Ok(ToolConfig::default());
    }
    let data = fs::read_to_string(&path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    let cfg: ToolConfig = toml::from_str(&data)
        .map_err(|e| Error::msg(format!("TOML parse error in {}: {e}", path.display())))?;
    cfg.validate()?;
    Ok(cfg)
}
