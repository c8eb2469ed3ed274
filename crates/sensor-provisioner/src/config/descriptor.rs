use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Section {
    name: String,
    entries: BTreeMap<String, String>,
}

impl Section {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keys are stored lower-cased, so lookups are case-insensitive.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
    }
}

/// A parsed section-based key/value descriptor (`platformio.ini`, `credentials.ini`).
#[derive(Debug, Clone)]
pub struct DescriptorDoc {
    pub path: PathBuf,
    // File order; section names are unique.
    sections: Vec<Section>,
}

impl DescriptorDoc {
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name == name)
    }

    pub fn sections(&self) -> impl Iterator<Item = &Section> {
        self.sections.iter()
    }

    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.get(key)
    }

    pub fn require_section(&self, name: &str) -> Result<&Section> {
        self.section(name).ok_or_else(|| Error::SectionMissing {
            path: self.path.clone(),
            section: name.to_string(),
            known: Vec::new(),
        })
    }
}

pub fn load(path: &Path) -> Result<DescriptorDoc> {
    if !path.is_file() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }
    let data = fs::read_to_string(path)
        .map_err(|e| Error::io(format!("failed to read {}", path.display()), e))?;
    parse(path, &data)
}

pub fn parse(path: &Path, text: &str) -> Result<DescriptorDoc> {
    let syntax = |line: usize, reason: String| Error::DescriptorSyntax {
        path: path.to_path_buf(),
        line,
        reason,
    };

    let mut sections: Vec<Section> = Vec::new();
    // Key of the last entry in the current section, while continuation lines may follow.
    let mut open_key: Option<String> = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim_end_matches('\r');
        let trimmed = line.trim();

        if trimmed.is_empty() {
            open_key = None;
            continue;
        }
        if trimmed.starts_with('#') || trimmed.starts_with(';') {
            continue;
        }

        let indented = line.starts_with([' ', '\t']);
        if indented {
            if let (Some(key), Some(section)) = (open_key.as_ref(), sections.last_mut()) {
                let value = section.entries.entry(key.clone()).or_default();
                if !value.is_empty() {
                    value.push('\n');
                }
                value.push_str(trimmed);
                continue;
            }
        }

        if let Some(inner) = trimmed.strip_prefix('[') {
            let Some(name) = inner.strip_suffix(']') else {
                return Err(syntax(lineno, "unterminated section header".into()));
            };
            let name = name.trim();
            if name.is_empty() {
                return Err(syntax(lineno, "empty section name".into()));
            }
            if sections.iter().any(|s| s.name == name) {
                return Err(syntax(lineno, format!("duplicate section '[{name}]'")));
            }
            sections.push(Section {
                name: name.to_string(),
                entries: BTreeMap::new(),
            });
            open_key = None;
            continue;
        }

        let Some(split_at) = trimmed.find(['=', ':']) else {
            // The line is not echoed: it may be a wrapped secret value.
            return Err(syntax(
                lineno,
                "expected 'key = value' or a section header".into(),
            ));
        };
        let key = trimmed[..split_at].trim().to_ascii_lowercase();
        let value = trimmed[split_at + 1..].trim();
        if key.is_empty() {
            return Err(syntax(lineno, "empty key".into()));
        }
        let Some(section) = sections.last_mut() else {
            return Err(syntax(
                lineno,
                format!("key '{key}' appears before any section header"),
            ));
        };
        if section.entries.contains_key(&key) {
            return Err(syntax(
                lineno,
                format!("duplicate key '{key}' in section '[{}]'", section.name),
            ));
        }
        section.entries.insert(key.clone(), value.to_string());
        open_key = Some(key);
    }

    Ok(DescriptorDoc {
        path: path.to_path_buf(),
        sections,
    })
}
