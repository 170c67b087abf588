//! Runtime settings for instrument discovery.
//!
//! Settings are layered with `figment`: built-in defaults, then an optional
//! TOML file, then `LAB_INSTRUMENTS_` environment variables. Nested keys use
//! a double underscore, e.g. `LAB_INSTRUMENTS_SUTTER__PORT=/dev/ttyUSB0`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Default location of the settings file, relative to the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "lab_instruments.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "LAB_INSTRUMENTS_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    pub visa: VisaSettings,
    pub sutter: SutterSettings,
    pub daq: DaqSettings,
}

/// VISA resources searched when grabbing SCPI instruments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisaSettings {
    /// Resource names such as `TCPIP0::192.168.0.12::inst0::INSTR`.
    pub resources: Vec<String>,
    /// Timeout for opening a resource and for each I/O call, in ms.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SutterSettings {
    /// Serial port. When unset, ports are scanned for the controller's USB id.
    pub port: Option<String>,
    /// Regex matched against the serial port's USB serial number.
    pub usb_id: String,
    pub baud_rate: u32,
    /// Read timeout in ms.
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaqSettings {
    pub device: String,
    pub input_pfi: u32,
    pub output_pfi: u32,
    pub counter: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            visa: VisaSettings::default(),
            sutter: SutterSettings::default(),
            daq: DaqSettings::default(),
        }
    }
}

impl Default for VisaSettings {
    fn default() -> Self {
        Self {
            resources: Vec::new(),
            timeout_ms: 5000,
        }
    }
}

impl Default for SutterSettings {
    fn default() -> Self {
        Self {
            port: None,
            usb_id: r"^SI\w+$".to_string(),
            baud_rate: 9600,
            timeout_ms: 2000,
        }
    }
}

impl Default for DaqSettings {
    fn default() -> Self {
        Self {
            device: "PXI1Slot6".to_string(),
            input_pfi: 0,
            output_pfi: 1,
            counter: 0,
        }
    }
}

impl VisaSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl SutterSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Settings {
    /// Load from [`DEFAULT_CONFIG_FILE`] (if present) and the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_FILE)
    }

    /// Load from a specific TOML file and the environment.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Settings = Self::figment(path.as_ref())
            .extract()
            .with_context(|| format!("failed to load settings from {:?}", path.as_ref()))?;
        settings.validate()?;
        Ok(settings)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn validate(&self) -> Result<()> {
        let levels = ["trace", "debug", "info", "warn", "error"];
        if !levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow!(
                "invalid log_level {:?}, must be one of: {}",
                self.log_level,
                levels.join(", ")
            ));
        }
        if self.visa.timeout_ms == 0 || self.sutter.timeout_ms == 0 {
            return Err(anyhow!("timeouts must be strictly positive"));
        }
        regex::Regex::new(&self.sutter.usb_id)
            .with_context(|| format!("invalid sutter.usb_id pattern {:?}", self.sutter.usb_id))?;
        Ok(())
    }

    /// Render as TOML, e.g. to bootstrap a settings file.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("failed to serialize settings")
    }

    /// Write the settings to `path` as TOML.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<PathBuf> {
        let path = path.as_ref().to_path_buf();
        std::fs::write(&path, self.to_toml()?)
            .with_context(|| format!("failed to write {path:?}"))?;
        Ok(path)
    }
}
