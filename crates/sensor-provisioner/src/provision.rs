//! End-to-end entry points shared by the `provision` and `provision-prebuild` binaries.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::artifact::{self, ConfigArtifact};
use crate::config::{TimeoutsConfig, ToolConfig, tool};
use crate::credentials::{self, CredentialRecord};
use crate::device::DeviceId;
use crate::environment;
use crate::error::{Error, Result};
use crate::executor::{CommandTool, ExecCtx, ExecSink, PipelineRequest, PipelineRun, Requested};
use crate::version::{self, GitVersion};
use crate::workspace::ProjectLayout;

/// Tool configuration and resolved paths of one project checkout.
#[derive(Debug, Clone)]
pub struct Project {
    pub config: ToolConfig,
    pub layout: ProjectLayout,
}

impl Project {
    pub fn open(root: &Path) -> Result<Self> {
        let config = tool::load(root)?;
        let layout = ProjectLayout::resolve(root, &config.paths)?;
        debug!(root = %layout.root.display(), "opened project");
        Ok(Self { config, layout })
    }
}

/// Loads `<root>/.env` into the process environment if present. Existing variables win.
pub fn load_dotenv(root: &Path) {
    let path = root.join(".env");
    if path.is_file() && dotenv::from_path(&path).is_ok() {
        debug!("loaded {}", path.display());
    }
}

/// Interprets the trailing `clean`/`upload` words of the command line, in any order and case.
pub fn parse_stage_words<S: AsRef<str>>(words: &[S]) -> Result<Requested> {
    let mut requested = Requested::default();
    for w in words {
        match w.as_ref().to_ascii_lowercase().as_str() {
            "clean" => requested.clean = true,
            "upload" => requested.upload = true,
            other => {
                return Err(Error::msg(format!(
                    "unknown argument '{other}' (expected 'clean' and/or 'upload')"
                )));
            }
        }
    }
    Ok(requested)
}

#[derive(Debug, Clone)]
pub struct ProvisionOptions {
    pub project_dir: PathBuf,
    pub device: String,
    pub requested: Requested,
    pub dry_run: bool,
    /// Overrides every stage timeout from `provisioner.toml`.
    pub timeout_secs: Option<u64>,
    /// Overrides `[tool].command`.
    pub tool_command: Option<Vec<String>>,
}

impl ProvisionOptions {
    pub fn new(project_dir: impl Into<PathBuf>, device: impl Into<String>) -> Self {
        Self {
            project_dir: project_dir.into(),
            device: device.into(),
            requested: Requested::default(),
            dry_run: false,
            timeout_secs: None,
            tool_command: None,
        }
    }
}

fn render_config(project: &Project, device: &DeviceId) -> Result<(CredentialRecord, ConfigArtifact)> {
    let record = credentials::resolve(&project.layout, device)?;
    record.log_summary();
    let artifact = artifact::generate(&record)?;
    info!(fingerprint = %artifact.fingerprint, defines = artifact.define_count, "rendered device config");
    Ok((record, artifact))
}

/// Resolves the device, writes its config header and runs the build pipeline.
pub fn provision(opts: &ProvisionOptions, sink: Arc<dyn ExecSink>) -> Result<PipelineRun> {
    let device = DeviceId::parse(&opts.device)?;
    let mut project = Project::open(&opts.project_dir)?;
    if let Some(secs) = opts.timeout_secs {
        project.config.timeouts = TimeoutsConfig::all(secs);
    }
    if let Some(cmd) = &opts.tool_command {
        project.config.tool.command = cmd.clone();
    }
    project.config.validate()?;

    let env = environment::resolve(&project.layout, &device)?;
    let (record, artifact) = render_config(&project, &device)?;
    if opts.dry_run {
        info!(
            path = %project.layout.artifact.display(),
            "dry run: device config header not written"
        );
    } else {
        artifact::write_artifact(&artifact, &project.layout.artifact)?;
    }

    let tool = CommandTool::new(&project.config.tool, &project.layout.root);
    let mut ctx = ExecCtx::new(opts.dry_run, sink).with_secrets(record.secrets());
    let req = PipelineRequest {
        layout: &project.layout,
        environment: &env,
        requested: opts.requested,
        timeouts: project.config.timeouts,
        tool: &tool,
    };
    crate::executor::execute(&req, &mut ctx).into_result()
}

#[derive(Debug, Clone)]
pub struct PrebuildReport {
    pub artifact: ConfigArtifact,
    pub version: GitVersion,
}

/// What the build tool's pre-build hook does: regenerate both headers for `device`.
pub fn prebuild(project_dir: &Path, device: &str) -> Result<PrebuildReport> {
    let device = DeviceId::parse(device)?;
    let project = Project::open(project_dir)?;
    let (_, artifact) = render_config(&project, &device)?;
    artifact::write_artifact(&artifact, &project.layout.artifact)?;
    let version = version::write_header(&project.layout.root, &project.layout.version_header);
    Ok(PrebuildReport { artifact, version })
}
