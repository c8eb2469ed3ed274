use tracing::{debug, info};

use crate::config::{DescriptorDoc, descriptor};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::profile::{ENV_SECTION_PREFIX, HardwareProfile};
use crate::workspace::ProjectLayout;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEnvironment {
    pub id: DeviceId,
    pub extends: HardwareProfile,
}

/// Loads the project descriptor and resolves `device` to the hardware profile it extends.
pub fn resolve(layout: &ProjectLayout, device: &DeviceId) -> Result<DeviceEnvironment> {
    let doc = descriptor::load(&layout.project_descriptor)?;
    resolve_in(&doc, device)
}

pub fn resolve_in(doc: &DescriptorDoc, device: &DeviceId) -> Result<DeviceEnvironment> {
    let section_name = format!("{ENV_SECTION_PREFIX}{device}");
    let Some(section) = doc.section(&section_name) else {
        return Err(Error::SectionMissing {
            path: doc.path.clone(),
            section: section_name,
            known: known_devices(doc),
        });
    };

    let extends = section
        .get("extends")
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::FieldMissing {
            path: doc.path.clone(),
            section: section_name.clone(),
            field: "extends".into(),
        })?;

    let Some(profile) = HardwareProfile::from_extends(extends) else {
        return Err(Error::UnrecognizedProfile {
            device: device.to_string(),
            value: extends.to_string(),
            accepted: HardwareProfile::accepted_extends(),
        });
    };

    info!(device = %device, profile = %profile, "device extends {}", profile.section_name());
    Ok(DeviceEnvironment {
        id: device.clone(),
        extends: profile,
    })
}

/// Device ids declared in the descriptor: every `env:*` section that is not a base profile.
pub fn known_devices(doc: &DescriptorDoc) -> Vec<String> {
    let mut out: Vec<String> = doc
        .sections()
        .map(|s| s.name())
        .filter(|name| !HardwareProfile::is_profile_section(name))
        .filter_map(|name| name.strip_prefix(ENV_SECTION_PREFIX))
        .map(ToOwned::to_owned)
        .collect();
    out.sort();
    debug!(count = out.len(), "known devices");
    out
}
