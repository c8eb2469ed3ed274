//! Rendering of the per-device configuration header.
//!
//! [`generate`] is pure: identical records render byte-identical text. Writing the result is a
//! separate step ([`write_artifact`]) so rendering can be tested without a filesystem.

use std::path::Path;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::credentials::{CredentialRecord, SHARED_SECTION};
use crate::error::{Error, Result};
use crate::workspace::write_text;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefineValue {
    Str(String),
    Int(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Define {
    pub name: &'static str,
    pub value: DefineValue,
}

/// Rendered header text plus a short fingerprint of its definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    pub text: String,
    pub fingerprint: String,
    pub define_count: usize,
}

fn string_define(
    section: &str,
    name: &'static str,
    field: &str,
    value: &str,
) -> Result<Define> {
    if let Some(c) = value.chars().find(|c| c.is_control()) {
        return Err(Error::field_invalid(
            section,
            field,
            format!(
                "contains control character {:?} which cannot be embedded in a C string",
                c
            ),
        ));
    }
    Ok(Define {
        name,
        value: DefineValue::Str(value.to_string()),
    })
}

fn int_define(name: &'static str, value: impl Into<u32>) -> Define {
    Define {
        name,
        value: DefineValue::Int(value.into()),
    }
}

/// Definitions in emission order. Optional values appear only when the descriptor set them.
pub fn definitions(record: &CredentialRecord) -> Result<Vec<Define>> {
    let device = record.device.as_str();
    let mut out = vec![
        string_define(device, "CONFIG_SENSOR_ID", "sensor_id", &record.sensor_id)?,
        string_define(
            device,
            "CONFIG_BEARER_TOKEN",
            "bearer_token",
            record.bearer_token.expose(),
        )?,
        string_define(
            device,
            "CONFIG_WIFI_CREDENTIALS",
            "wifi_credentials",
            record.wifi_credentials.expose(),
        )?,
        string_define(SHARED_SECTION, "CONFIG_API_URL", "url", &record.url)?,
        string_define(
            SHARED_SECTION,
            "CONFIG_SENSOR_SET",
            "sensor_set_id",
            &record.sensor_set_id,
        )?,
        int_define("CONFIG_SENSOR_SDA_GPIO", record.sda_gpio),
        int_define("CONFIG_SENSOR_SCL_GPIO", record.scl_gpio),
    ];

    if let Some(k) = &record.keepalive {
        out.push(int_define("CONFIG_KEEPALIVE_GPIO", k.gpio));
        if k.interval_minutes.is_explicit() {
            out.push(int_define(
                "CONFIG_KEEPALIVE_INTERVAL_MINUTES",
                k.interval_minutes.value,
            ));
        }
        if k.duration_seconds.is_explicit() {
            out.push(int_define(
                "CONFIG_KEEPALIVE_DURATION_SECONDS",
                k.duration_seconds.value,
            ));
        }
    }
    if let Some(gpio) = record.keepalive_led_gpio {
        out.push(int_define("CONFIG_KEEPALIVE_LED_GPIO", gpio));
    }
    if record.battery_adc_gpio.is_explicit() {
        out.push(int_define(
            "CONFIG_BATTERY_ADC_GPIO",
            record.battery_adc_gpio.value,
        ));
    }
    if record.night_start_hour.is_explicit() {
        out.push(int_define(
            "CONFIG_NIGHT_START_HOUR",
            record.night_start_hour.value,
        ));
    }
    if record.night_end_hour.is_explicit() {
        out.push(int_define("CONFIG_NIGHT_END_HOUR", record.night_end_hour.value));
    }
    if record.local_timezone.is_explicit() {
        out.push(string_define(
            device,
            "CONFIG_LOCAL_TIMEZONE",
            "local_timezone",
            &record.local_timezone.value,
        )?);
    }
    if record.sensor_power_drain.is_explicit() {
        out.push(string_define(
            device,
            "CONFIG_SENSOR_POWER_DRAIN",
            "sensor_power_drain",
            record.sensor_power_drain.value.as_str(),
        )?);
    }
    Ok(out)
}

/// Escapes `"` and `\` for a C string literal. Control characters are rejected before this.
pub fn escape_c_string(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    for c in raw.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn render_define(d: &Define) -> String {
    match &d.value {
        DefineValue::Str(s) => format!("#define {} \"{}\"", d.name, escape_c_string(s)),
        DefineValue::Int(n) => format!("#define {} {}", d.name, n),
    }
}

pub fn generate(record: &CredentialRecord) -> Result<ConfigArtifact> {
    let defines = definitions(record)?;
    let lines: Vec<String> = defines.iter().map(render_define).collect();

    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let fingerprint = hex::encode(hasher.finalize())[..16].to_string();

    let mut text = String::new();
    text.push_str("/**\n");
    text.push_str(&format!(
        " * Auto-generated configuration for device '{}'\n",
        record.device
    ));
    text.push_str(" * DO NOT EDIT MANUALLY\n");
    text.push_str(&format!(" * fingerprint: {fingerprint}\n"));
    text.push_str(" */\n");
    text.push_str("#pragma once\n\n");
    for line in &lines {
        text.push_str(line);
        text.push('\n');
    }

    Ok(ConfigArtifact {
        text,
        fingerprint,
        define_count: lines.len(),
    })
}

pub fn write_artifact(artifact: &ConfigArtifact, path: &Path) -> Result<()> {
    write_text(path, &artifact.text)?;
    info!(
        path = %path.display(),
        defines = artifact.define_count,
        fingerprint = %artifact.fingerprint,
        "wrote device config header"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::{Keepalive, Origin, PowerDrain, Secret, Setting};
    use crate::device::DeviceId;

    fn default<T>(value: T) -> Setting<T> {
        Setting {
            value,
            origin: Origin::Default,
        }
    }

    fn explicit<T>(value: T) -> Setting<T> {
        Setting {
            value,
            origin: Origin::Descriptor,
        }
    }

    fn record() -> CredentialRecord {
        CredentialRecord {
            device: DeviceId::parse("sensor_temp").unwrap(),
            url: "https://api.example.com".into(),
            sensor_set_id: "set1".into(),
            sensor_id: "temp01".into(),
            bearer_token: Secret::new("tok"),
            wifi_credentials: Secret::new("ssid:pw"),
            sda_gpio: 21,
            scl_gpio: 22,
            keepalive: None,
            keepalive_led_gpio: None,
            battery_adc_gpio: default(2),
            night_start_hour: default(22),
            night_end_hour: default(4),
            local_timezone: default("PST8PDT,M3.2.0,M11.1.0".into()),
            sensor_power_drain: default(PowerDrain::Low),
        }
    }

    fn define_lines(text: &str) -> Vec<&str> {
        text.lines().filter(|l| l.starts_with("#define ")).collect()
    }

    #[test]
    fn minimal_record_renders_seven_definitions() {
        let art = generate(&record()).unwrap();
        let defines = define_lines(&art.text);
        assert_eq!(
            defines,
            vec![
                "#define CONFIG_SENSOR_ID \"temp01\"",
                "#define CONFIG_BEARER_TOKEN \"tok\"",
                "#define CONFIG_WIFI_CREDENTIALS \"ssid:pw\"",
                "#define CONFIG_API_URL \"https://api.example.com\"",
                "#define CONFIG_SENSOR_SET \"set1\"",
                "#define CONFIG_SENSOR_SDA_GPIO 21",
                "#define CONFIG_SENSOR_SCL_GPIO 22",
            ]
        );
        assert_eq!(art.define_count, 7);
        assert!(art.text.contains("#pragma once"));
        assert!(!art.text.contains("KEEPALIVE"));
        assert!(!art.text.contains("BATTERY"));
        assert!(!art.text.contains("NIGHT"));
    }

    #[test]
    fn rendering_is_deterministic_and_leaves_record_untouched() {
        let rec = record();
        let before = rec.clone();
        let a = generate(&rec).unwrap();
        let b = generate(&rec).unwrap();
        assert_eq!(a.text, b.text);
        assert_eq!(a.fingerprint, b.fingerprint);
        assert_eq!(rec, before);
    }

    #[test]
    fn fingerprint_tracks_content() {
        let mut other = record();
        other.sda_gpio = 4;
        assert_ne!(
            generate(&record()).unwrap().fingerprint,
            generate(&other).unwrap().fingerprint
        );
    }

    #[test]
    fn quotes_and_backslashes_are_escaped() {
        let mut rec = record();
        rec.wifi_credentials = Secret::new(r#"my "net":pa\ss"#);
        let art = generate(&rec).unwrap();
        assert!(
            art.text
                .contains(r#"#define CONFIG_WIFI_CREDENTIALS "my \"net\":pa\\ss""#),
            "{}",
            art.text
        );
    }

    #[test]
    fn embedded_newlines_are_rejected() {
        let mut rec = record();
        rec.url = "https://a\nb".into();
        let err = generate(&rec).unwrap_err();
        assert!(
            matches!(&err, Error::FieldInvalid { section, field, .. }
                if section == "all_sensors" && field == "url"),
            "unexpected err: {err}"
        );

        let mut rec = record();
        rec.sensor_set_id = "set\u{7}".into();
        let err = generate(&rec).unwrap_err();
        assert!(
            matches!(&err, Error::FieldInvalid { section, field, .. }
                if section == "all_sensors" && field == "sensor_set_id"),
            "unexpected err: {err}"
        );

        let mut rec = record();
        rec.bearer_token = Secret::new("zq9\r");
        let err = generate(&rec).unwrap_err();
        assert!(
            matches!(&err, Error::FieldInvalid { section, field, .. }
                if section == "sensor_temp" && field == "bearer_token"),
            "unexpected err: {err}"
        );
        assert!(!err.to_string().contains("zq9"));
    }

    #[test]
    fn explicit_optionals_are_emitted_in_order() {
        let mut rec = record();
        rec.keepalive = Some(Keepalive {
            gpio: 5,
            interval_minutes: explicit(6),
            duration_seconds: default(10),
        });
        rec.keepalive_led_gpio = Some(8);
        rec.battery_adc_gpio = explicit(3);
        rec.night_end_hour = explicit(5);
        rec.local_timezone = explicit("UTC0".into());
        rec.sensor_power_drain = explicit(PowerDrain::High);

        let art = generate(&rec).unwrap();
        let defines = define_lines(&art.text);
        assert_eq!(
            &defines[7..],
            &[
                "#define CONFIG_KEEPALIVE_GPIO 5",
                "#define CONFIG_KEEPALIVE_INTERVAL_MINUTES 6",
                "#define CONFIG_KEEPALIVE_LED_GPIO 8",
                "#define CONFIG_BATTERY_ADC_GPIO 3",
                "#define CONFIG_NIGHT_END_HOUR 5",
                "#define CONFIG_LOCAL_TIMEZONE \"UTC0\"",
                "#define CONFIG_SENSOR_POWER_DRAIN \"high\"",
            ]
        );
        assert!(!art.text.contains("CONFIG_NIGHT_START_HOUR"));
        assert!(!art.text.contains("CONFIG_KEEPALIVE_DURATION_SECONDS"));
    }

    #[test]
    fn write_artifact_creates_parent_dirs_and_overwrites() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("include").join("device_config.h");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "stale").unwrap();

        let art = generate(&record()).unwrap();
        write_artifact(&art, &path).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), art.text);
    }
}
