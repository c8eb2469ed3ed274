use std::fmt;
use std::path::PathBuf;

use crate::executor::StageKind;

#[derive(Debug)]
pub enum Error {
    /// A descriptor file does not exist.
    ConfigNotFound { path: PathBuf },
    /// A descriptor file could not be parsed.
    DescriptorSyntax {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    /// A named section is absent. `known` lists the alternatives worth showing (may be empty).
    SectionMissing {
        path: PathBuf,
        section: String,
        known: Vec<String>,
    },
    /// A required field is absent in an otherwise-present section.
    FieldMissing {
        path: PathBuf,
        section: String,
        field: String,
    },
    UnrecognizedProfile {
        device: String,
        value: String,
        accepted: Vec<String>,
    },
    /// A value is present but cannot be used or safely rendered.
    FieldInvalid {
        section: String,
        field: String,
        reason: String,
    },
    ExternalToolFailure {
        stage: StageKind,
        code: Option<i32>,
    },
    StageTimeout { stage: StageKind, secs: u64 },
    InvalidDeviceId(String),
    Io { context: String, source: std::io::Error },
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn field_invalid(
        section: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::FieldInvalid {
            section: section.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigNotFound { path } => {
                write!(f, "descriptor file {} not found", path.display())
            }
            Error::DescriptorSyntax { path, line, reason } => {
                write!(f, "{}:{line}: {reason}", path.display())
            }
            Error::SectionMissing {
                path,
                section,
                known,
            } => {
                write!(f, "section '[{section}]' not found in {}", path.display())?;
                if !known.is_empty() {
                    write!(f, " (known devices: {})", known.join(", "))?;
                }
                Ok(())
            }
            Error::FieldMissing {
                path,
                section,
                field,
            } => write!(
                f,
                "missing field '{field}' in section '[{section}]' of {}",
                path.display()
            ),
            Error::UnrecognizedProfile {
                device,
                value,
                accepted,
            } => write!(
                f,
                "device '{device}' extends unknown base '{value}' (expected one of: {})",
                accepted.join(", ")
            ),
            Error::FieldInvalid {
                section,
                field,
                reason,
            } => write!(f, "invalid value for '{field}' in '[{section}]': {reason}"),
            Error::ExternalToolFailure { stage, code } => match code {
                Some(code) => write!(f, "{stage} failed with exit code {code}"),
                None => write!(f, "{stage} was terminated by a signal"),
            },
            Error::StageTimeout { stage, secs } => {
                write!(f, "{stage} timed out after {secs}s")
            }
            Error::InvalidDeviceId(id) => write!(
                f,
                "invalid device id '{id}' (allowed: letters, digits, '_', '-', '.')"
            ),
            Error::Io { context, source } => write!(f, "{context}: {source}"),
            Error::Msg(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::msg(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::msg(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
