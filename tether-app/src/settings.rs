//! Persistent host settings (JSON file in the app data directory).

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tether_core::{BridgeConfig, ControllerConfig};
use tracing::warn;

const SETTINGS_ENV: &str = "TETHER_SETTINGS";
const DEFAULT_APP_NAME: &str = "Tether";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub app_name: String,
    pub invoke_timeout_ms: u64,
    pub ticker_interval_ms: u64,
    pub large_data_limit: usize,
    pub trace_envelopes: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            app_name: DEFAULT_APP_NAME.into(),
            invoke_timeout_ms: 10_000,
            ticker_interval_ms: 3_000,
            large_data_limit: 10_000,
            trace_envelopes: false,
        }
    }
}

impl AppSettings {
    /// Where the settings file lives: `$TETHER_SETTINGS` when set and
    /// non-empty, otherwise `settings.json` under the platform data directory.
    pub fn path() -> PathBuf {
        Self::path_with_override(std::env::var_os(SETTINGS_ENV))
    }

    fn path_with_override(overridden: Option<OsString>) -> PathBuf {
        match overridden.filter(|p| !p.is_empty()) {
            Some(p) => PathBuf::from(p),
            None => data_dir().join("settings.json"),
        }
    }

    /// Read `path`, falling back to defaults when the file is missing or
    /// malformed. Out-of-range values are clamped.
    pub fn load(path: &Path) -> Self {
        let parsed = match fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<AppSettings>(&raw)
                .map_err(|e| warn!(settings_path = ?path, "ignoring malformed settings: {e}"))
                .ok(),
            Err(_) => None,
        };
        parsed.unwrap_or_default().clamped()
    }

    /// `load`, then write the result back if no file existed yet.
    pub fn load_or_init(path: &Path) -> Self {
        let settings = Self::load(path);
        if !path.exists() {
            if let Err(e) = settings.save(path) {
                warn!(settings_path = ?path, "could not write default settings: {e}");
            }
        }
        settings
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, json)
    }

    fn clamped(mut self) -> Self {
        let name = self.app_name.trim();
        self.app_name = if name.is_empty() {
            DEFAULT_APP_NAME.into()
        } else {
            name.to_string()
        };
        self.invoke_timeout_ms = self.invoke_timeout_ms.clamp(50, 600_000);
        self.ticker_interval_ms = self.ticker_interval_ms.clamp(100, 60_000);
        self.large_data_limit = self.large_data_limit.clamp(1, 1_000_000);
        self
    }

    /// Controller wiring: invoke timeout plus envelope tracing.
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            bridge: BridgeConfig::with_timeout(Duration::from_millis(self.invoke_timeout_ms)),
            trace_envelopes: self.trace_envelopes,
        }
    }

    pub fn ticker_interval(&self) -> Duration {
        Duration::from_millis(self.ticker_interval_ms)
    }
}

#[cfg(target_os = "windows")]
fn data_dir() -> PathBuf {
    std::env::var_os("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Tether")
}

#[cfg(not(target_os = "windows"))]
fn data_dir() -> PathBuf {
    let base = std::env::var_os("XDG_DATA_HOME")
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(std::env::temp_dir);
    base.join("tether")
}
