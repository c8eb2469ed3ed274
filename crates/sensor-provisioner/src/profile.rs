use std::fmt;

/// Section-name prefix shared by device and base environments in the project descriptor.
pub const ENV_SECTION_PREFIX: &str = "env:";

/// The closed set of base hardware targets a device can extend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareProfile {
    Esp32s3Base,
    Esp32c3Base,
}

impl HardwareProfile {
    pub const ALL: [HardwareProfile; 2] = [HardwareProfile::Esp32s3Base, HardwareProfile::Esp32c3Base];

    pub fn id(self) -> &'static str {
        match self {
            HardwareProfile::Esp32s3Base => "esp32s3_base",
            HardwareProfile::Esp32c3Base => "esp32c3_base",
        }
    }

    /// Default SDK configuration template copied into the active slot before compiling.
    pub fn template_file(self) -> &'static str {
        match self {
            HardwareProfile::Esp32s3Base => "sdkconfig.defaults_esp32s3_base",
            HardwareProfile::Esp32c3Base => "sdkconfig.defaults_esp32c3_base",
        }
    }

    pub fn section_name(self) -> String {
        format!("{ENV_SECTION_PREFIX}{}", self.id())
    }

    /// Matches an `extends` value (`env:<profile>`) against the table.
    pub fn from_extends(value: &str) -> Option<Self> {
        let id = value.trim().strip_prefix(ENV_SECTION_PREFIX)?;
        Self::ALL.into_iter().find(|p| p.id() == id)
    }

    pub fn is_profile_section(section: &str) -> bool {
        Self::ALL.iter().any(|p| p.section_name() == section)
    }

    pub fn accepted_extends() -> Vec<String> {
        Self::ALL.iter().map(|p| p.section_name()).collect()
    }
}

impl fmt::Display for HardwareProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extends_values_map_to_profiles() {
        assert_eq!(
            HardwareProfile::from_extends("env:esp32s3_base"),
            Some(HardwareProfile::Esp32s3Base)
        );
        assert_eq!(
            HardwareProfile::from_extends(" env:esp32c3_base "),
            Some(HardwareProfile::Esp32c3Base)
        );
        assert_eq!(HardwareProfile::from_extends("esp32c3_base"), None);
        assert_eq!(HardwareProfile::from_extends("env:esp32_base"), None);
        assert_eq!(HardwareProfile::from_extends("env:ESP32C3_BASE"), None);
    }

    #[test]
    fn every_profile_has_its_own_template() {
        for p in HardwareProfile::ALL {
            assert!(p.template_file().ends_with(p.id()));
            assert!(HardwareProfile::is_profile_section(&p.section_name()));
        }
        assert_eq!(
            HardwareProfile::accepted_extends(),
            vec!["env:esp32s3_base", "env:esp32c3_base"]
        );
    }
}
