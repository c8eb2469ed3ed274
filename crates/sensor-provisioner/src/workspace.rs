use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::config::PathsConfig;
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::profile::HardwareProfile;

/// Every conventional path of one project, resolved once against the project root.
#[derive(Debug, Clone)]
pub struct ProjectLayout {
    pub root: PathBuf,
    pub project_descriptor: PathBuf,
    pub credentials: PathBuf,
    pub artifact: PathBuf,
    pub version_header: PathBuf,
    pub sdkconfig_defaults: PathBuf,
    pub build_dirs: Vec<PathBuf>,
}

impl ProjectLayout {
    pub fn resolve(root: &Path, paths: &PathsConfig) -> Result<Self> {
        let root = if root.is_absolute() {
            root.to_path_buf()
        } else {
            let cwd = std::env::current_dir().map_err(|e| Error::io("cwd error", e))?;
            cwd.join(root)
        };

        let mut build_dirs = Vec::with_capacity(paths.build_dirs.len());
        for dir in &paths.build_dirs {
            build_dirs.push(resolve_under(&root, dir)?);
        }

        Ok(Self {
            project_descriptor: resolve_under(&root, &paths.project_descriptor)?,
            credentials: resolve_under(&root, &paths.credentials)?,
            artifact: resolve_under(&root, &paths.artifact)?,
            version_header: resolve_under(&root, &paths.version_header)?,
            sdkconfig_defaults: resolve_under(&root, &paths.sdkconfig_defaults)?,
            build_dirs,
            root,
        })
    }

    pub fn profile_template(&self, profile: HardwareProfile) -> PathBuf {
        self.root.join(profile.template_file())
    }

    /// SDK config the build tool generates per device (`sdkconfig.<device>`).
    pub fn device_sdkconfig(&self, device: &DeviceId) -> PathBuf {
        self.root.join(format!("sdkconfig.{device}"))
    }
}

fn resolve_under(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel = rel.trim();
    if rel.is_empty() {
        return Err(Error::msg("empty project path"));
    }
    let rel_pb = Path::new(rel);
    if rel_pb.is_absolute() {
        return Err(Error::msg(format!(
            "invalid project path '{}' (must be relative to the project root)",
            rel
        )));
    }
    if rel_pb
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(Error::msg(format!(
            "invalid project path '{}' (contains '..')",
            rel
        )));
    }
    Ok(root.join(rel_pb))
}

fn ensure_inside_root(root: &Path, target: &Path) -> Result<PathBuf> {
    let root_can = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let target_can = target
        .canonicalize()
        .unwrap_or_else(|_| target.to_path_buf());
    if !target_can.starts_with(&root_can) || target_can == root_can {
        return Err(Error::msg(format!(
            "refusing to remove '{}' (outside project root '{}')",
            target_can.display(),
            root_can.display()
        )));
    }
    Ok(target_can)
}

/// Removes `dir` if it exists. Returns whether anything was removed.
pub fn safe_remove_dir_all(root: &Path, dir: &Path) -> Result<bool> {
    if !dir.exists() {
        return Ok(false);
    }
    let dir_can = ensure_inside_root(root, dir)?;
    fs::remove_dir_all(&dir_can)
        .map_err(|e| Error::io(format!("failed to remove dir {}", dir_can.display()), e))?;
    Ok(true)
}

/// Removes `file` if it exists. Returns whether anything was removed.
pub fn safe_remove_file(root: &Path, file: &Path) -> Result<bool> {
    if !file.exists() {
        return Ok(false);
    }
    let file_can = ensure_inside_root(root, file)?;
    fs::remove_file(&file_can)
        .map_err(|e| Error::io(format!("failed to remove {}", file_can.display()), e))?;
    Ok(true)
}

pub fn write_text(p: &Path, s: &str) -> Result<()> {
    if let Some(parent) = p.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::io(format!("failed to create dir {}", parent.display()), e))?;
    }
    fs::write(p, s).map_err(|e| Error::io(format!("failed to write {}", p.display()), e))
}
