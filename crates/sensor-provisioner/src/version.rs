use std::io::ErrorKind;
use std::path::Path;
use std::process::{Command, Stdio};

use chrono::DateTime;
use tracing::{info, warn};

use crate::workspace::write_text;

const UNKNOWN: &str = "unknown";
const NO_GIT: &str = "no-git";

/// Commit information embedded in the firmware for identification only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitVersion {
    pub sha: String,
    pub timestamp: String,
}

impl GitVersion {
    fn placeholder(value: &str) -> Self {
        Self {
            sha: value.into(),
            timestamp: value.into(),
        }
    }
}

enum GitOutput {
    Ok(String),
    Failed,
    Missing,
}

fn git(root: &Path, args: &[&str]) -> GitOutput {
    let out = Command::new("git")
        .args(args)
        .current_dir(root)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match out {
        Ok(o) if o.status.success() => {
            GitOutput::Ok(String::from_utf8_lossy(&o.stdout).trim().to_string())
        }
        Ok(_) => GitOutput::Failed,
        Err(e) if e.kind() == ErrorKind::NotFound => GitOutput::Missing,
        Err(_) => GitOutput::Failed,
    }
}

/// `%Y-%m-%dT%H:%M:%SZ` in UTC for a unix commit time.
pub fn format_commit_time(raw_unix: &str) -> Option<String> {
    let secs: i64 = raw_unix.trim().parse().ok()?;
    let dt = DateTime::from_timestamp(secs, 0)?;
    Some(dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

/// Best effort: failures map to `unknown`, a missing git binary to `no-git`.
pub fn query(root: &Path) -> GitVersion {
    let sha = match git(root, &["rev-parse", "HEAD"]) {
        GitOutput::Ok(s) if !s.is_empty() => s.chars().take(7).collect::<String>(),
        GitOutput::Missing => return GitVersion::placeholder(NO_GIT),
        _ => return GitVersion::placeholder(UNKNOWN),
    };
    let timestamp = match git(root, &["log", "-1", "--format=%ct"]) {
        GitOutput::Ok(s) => format_commit_time(&s),
        _ => None,
    };
    match timestamp {
        Some(timestamp) => GitVersion { sha, timestamp },
        None => GitVersion::placeholder(UNKNOWN),
    }
}

pub fn render_header(v: &GitVersion) -> String {
    format!(
        "/**\n * Auto-generated Git version information\n * DO NOT EDIT MANUALLY\n */\n#pragma once\n\n#define GIT_COMMIT_SHA \"{}\"\n#define GIT_COMMIT_TIMESTAMP \"{}\"\n",
        v.sha, v.timestamp
    )
}

/// Writes the version header; a failed write is only a warning.
pub fn write_header(root: &Path, path: &Path) -> GitVersion {
    let v = query(root);
    match write_text(path, &render_header(&v)) {
        Ok(()) => info!(sha = %v.sha, timestamp = %v.timestamp, "generated git version info"),
        Err(e) => warn!("failed to write {}: {e}", path.display()),
    }
    v
}
