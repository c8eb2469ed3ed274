//! Per-device credential and parameter resolution.
//!
//! The credential descriptor has one shared `[all_sensors]` section and one section per device.
//! Required fields fail resolution when absent; optional fields fall back to documented defaults
//! (or leave their feature disabled) and never fail because they are missing.

use std::fmt;

use tracing::{info, warn};

use crate::config::{DescriptorDoc, Section, descriptor};
use crate::device::DeviceId;
use crate::error::{Error, Result};
use crate::workspace::ProjectLayout;

pub const SHARED_SECTION: &str = "all_sensors";

pub const DEFAULT_BATTERY_ADC_GPIO: u8 = 2;
pub const DEFAULT_NIGHT_START_HOUR: u8 = 22;
pub const DEFAULT_NIGHT_END_HOUR: u8 = 4;
pub const DEFAULT_LOCAL_TIMEZONE: &str = "PST8PDT,M3.2.0,M11.1.0";
pub const DEFAULT_KEEPALIVE_INTERVAL_MINUTES: u32 = 4;
pub const DEFAULT_KEEPALIVE_DURATION_SECONDS: u32 = 10;

const MAX_GPIO: u8 = 48;

/// A value that must never reach logs or diagnostics.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(redacted)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("redacted")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Descriptor,
    Default,
}

/// An optional value together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Setting<T> {
    pub value: T,
    pub origin: Origin,
}

impl<T> Setting<T> {
    fn resolved(value: Option<T>, default: T) -> Self {
        match value {
            Some(value) => Self {
                value,
                origin: Origin::Descriptor,
            },
            None => Self {
                value: default,
                origin: Origin::Default,
            },
        }
    }

    pub fn is_explicit(&self) -> bool {
        self.origin == Origin::Descriptor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerDrain {
    Low,
    High,
}

impl PowerDrain {
    pub fn as_str(self) -> &'static str {
        match self {
            PowerDrain::Low => "low",
            PowerDrain::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keepalive {
    pub gpio: u8,
    pub interval_minutes: Setting<u32>,
    pub duration_seconds: Setting<u32>,
}

/// The fully-resolved configuration of one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub device: DeviceId,
    pub url: String,
    pub sensor_set_id: String,
    pub sensor_id: String,
    pub bearer_token: Secret,
    pub wifi_credentials: Secret,
    pub sda_gpio: u8,
    pub scl_gpio: u8,
    /// `None` when no `keepalive_gpio` is configured.
    pub keepalive: Option<Keepalive>,
    pub keepalive_led_gpio: Option<u8>,
    pub battery_adc_gpio: Setting<u8>,
    pub night_start_hour: Setting<u8>,
    pub night_end_hour: Setting<u8>,
    pub local_timezone: Setting<String>,
    pub sensor_power_drain: Setting<PowerDrain>,
}

impl CredentialRecord {
    /// Values that must be scrubbed from any displayed tool output: the token, the Wi-Fi
    /// credential string, and each password inside it (`ssid:password[;ssid:password]`).
    pub fn secrets(&self) -> Vec<&str> {
        let wifi = self.wifi_credentials.expose();
        let mut out = vec![self.bearer_token.expose(), wifi];
        out.extend(
            wifi.split(';')
                .filter_map(|entry| entry.split_once(':'))
                .map(|(_, password)| password.trim())
                .filter(|p| !p.is_empty()),
        );
        out
    }

    pub fn log_summary(&self) {
        info!(device = %self.device, "resolved credentials");
        info!("  sensor_id: {}", self.sensor_id);
        info!("  bearer_token: {}", self.bearer_token);
        info!("  wifi_credentials: {}", self.wifi_credentials);
        info!("  url: {}", self.url);
        info!("  sensor_set_id: {}", self.sensor_set_id);
        info!("  sda_gpio: {}", self.sda_gpio);
        info!("  scl_gpio: {}", self.scl_gpio);
        match &self.keepalive {
            Some(k) => info!(
                "  keepalive: gpio {} every {} min for {} s",
                k.gpio, k.interval_minutes.value, k.duration_seconds.value
            ),
            None => info!("  keepalive: disabled"),
        }
        match self.keepalive_led_gpio {
            Some(gpio) => info!("  keepalive_led_gpio: {gpio}"),
            None => info!("  keepalive_led_gpio: disabled"),
        }
        info!(
            "  battery_adc_gpio: {}{}",
            self.battery_adc_gpio.value,
            origin_note(self.battery_adc_gpio.origin)
        );
        info!(
            "  night hours: {:02}:00-{:02}:00{}",
            self.night_start_hour.value,
            self.night_end_hour.value,
            origin_note(self.night_start_hour.origin)
        );
        info!(
            "  local_timezone: {}{}",
            self.local_timezone.value,
            origin_note(self.local_timezone.origin)
        );
        info!(
            "  sensor_power_drain: {}{}",
            self.sensor_power_drain.value.as_str(),
            origin_note(self.sensor_power_drain.origin)
        );
    }
}

fn origin_note(origin: Origin) -> &'static str {
    match origin {
        Origin::Descriptor => "",
        Origin::Default => " (default)",
    }
}

pub fn resolve(layout: &ProjectLayout, device: &DeviceId) -> Result<CredentialRecord> {
    info!(
        "loading credentials for '{}' from {}",
        device,
        layout.credentials.display()
    );
    let doc = descriptor::load(&layout.credentials)?;
    resolve_in(&doc, device)
}

pub fn resolve_in(doc: &DescriptorDoc, device: &DeviceId) -> Result<CredentialRecord> {
    let shared = Fields::new(doc, doc.require_section(SHARED_SECTION)?);
    let own = Fields::new(doc, doc.require_section(device.as_str())?);

    let url = shared.required("url")?.to_string();
    let sensor_set_id = shared.required("sensor_set_id")?.to_string();
    let sensor_id = own.required("sensor_id")?.to_string();
    let bearer_token = Secret::new(own.required("bearer_token")?);
    let wifi_credentials = Secret::new(own.required("wifi_credentials")?);
    let sda_gpio = own.required_with("sda_gpio", parse_gpio)?;
    let scl_gpio = own.required_with("scl_gpio", parse_gpio)?;

    let keepalive_gpio = own.optional("keepalive_gpio", parse_gpio)?;
    let interval = own.optional("keepalive_interval_minutes", parse_positive)?;
    let duration = own.optional("keepalive_duration_seconds", parse_positive)?;
    let keepalive = match keepalive_gpio {
        Some(gpio) => Some(Keepalive {
            gpio,
            interval_minutes: Setting::resolved(interval, DEFAULT_KEEPALIVE_INTERVAL_MINUTES),
            duration_seconds: Setting::resolved(duration, DEFAULT_KEEPALIVE_DURATION_SECONDS),
        }),
        None => {
            if interval.is_some() || duration.is_some() {
                warn!(
                    device = %device,
                    "keepalive timing is set but keepalive_gpio is not; keepalive stays disabled"
                );
            }
            None
        }
    };

    let record = CredentialRecord {
        device: device.clone(),
        url,
        sensor_set_id,
        sensor_id,
        bearer_token,
        wifi_credentials,
        sda_gpio,
        scl_gpio,
        keepalive,
        keepalive_led_gpio: own.optional("keepalive_led_gpio", parse_gpio)?,
        battery_adc_gpio: Setting::resolved(
            own.optional("battery_adc_gpio", parse_gpio)?,
            DEFAULT_BATTERY_ADC_GPIO,
        ),
        night_start_hour: Setting::resolved(
            own.optional("night_start_hour", parse_hour)?,
            DEFAULT_NIGHT_START_HOUR,
        ),
        night_end_hour: Setting::resolved(
            own.optional("night_end_hour", parse_hour)?,
            DEFAULT_NIGHT_END_HOUR,
        ),
        local_timezone: Setting::resolved(
            own.optional("local_timezone", |v| Ok(v.to_string()))?,
            DEFAULT_LOCAL_TIMEZONE.to_string(),
        ),
        sensor_power_drain: Setting::resolved(
            own.optional("sensor_power_drain", parse_power_drain)?,
            PowerDrain::Low,
        ),
    };
    Ok(record)
}

struct Fields<'a> {
    doc: &'a DescriptorDoc,
    section: &'a Section,
}

impl<'a> Fields<'a> {
    fn new(doc: &'a DescriptorDoc, section: &'a Section) -> Self {
        Self { doc, section }
    }

    // Blank values count as absent.
    fn present(&self, field: &str) -> Option<&'a str> {
        self.section
            .get(field)
            .map(str::trim)
            .filter(|v| !v.is_empty())
    }

    fn required(&self, field: &str) -> Result<&'a str> {
        self.present(field).ok_or_else(|| Error::FieldMissing {
            path: self.doc.path.clone(),
            section: self.section.name().to_string(),
            field: field.to_string(),
        })
    }

    fn required_with<T>(
        &self,
        field: &str,
        parse: impl Fn(&str) -> std::result::Result<T, String>,
    ) -> Result<T> {
        let raw = self.required(field)?;
        parse(raw).map_err(|reason| Error::field_invalid(self.section.name(), field, reason))
    }

    /// An absent or blank value is `None`. A malformed one is an error rather than a fallback
    /// to the default, since numeric values are emitted unquoted into the header.
    fn optional<T>(
        &self,
        field: &str,
        parse: impl Fn(&str) -> std::result::Result<T, String>,
    ) -> Result<Option<T>> {
        let Some(raw) = self.present(field) else {
            return Ok(None);
        };
        parse(raw)
            .map(Some)
            .map_err(|reason| Error::field_invalid(self.section.name(), field, reason))
    }
}

fn parse_gpio(raw: &str) -> std::result::Result<u8, String> {
    match raw.parse::<u8>() {
        Ok(n) if n <= MAX_GPIO => Ok(n),
        _ => Err(format!("expected a GPIO number 0-{MAX_GPIO}, got '{raw}'")),
    }
}

fn parse_hour(raw: &str) -> std::result::Result<u8, String> {
    match raw.parse::<u8>() {
        Ok(n) if n <= 23 => Ok(n),
        _ => Err(format!("expected an hour 0-23, got '{raw}'")),
    }
}

fn parse_positive(raw: &str) -> std::result::Result<u32, String> {
    match raw.parse::<u32>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(format!("expected a positive integer, got '{raw}'")),
    }
}

fn parse_power_drain(raw: &str) -> std::result::Result<PowerDrain, String> {
    match raw.to_ascii_lowercase().as_str() {
        "low" => Ok(PowerDrain::Low),
        "high" => Ok(PowerDrain::High),
        _ => Err(format!("expected 'low' or 'high', got '{raw}'")),
    }
}
