use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::capture::CaptureSettings;

pub const DEFAULT_RESOLUTION: &str = "640x360";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub camera: CameraConfig,
    pub webrtc: WebRtcConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the signaling/viewer HTTP server to. Required.
    pub bind: Option<String>,
    pub port: u16,
    /// Directory the static viewer page is served from.
    pub web_root: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: None,
            port: 8080,
            web_root: "web".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Capture device identifier (v4l2 device path, or dshow device name on
    /// Windows). Required.
    pub device: Option<String>,
    /// Capture resolution as `<width>x<height>`.
    pub resolution: Option<String>,
}

impl CameraConfig {
    /// Resolve the capture invocation parameters. `None` when the device is
    /// not configured (caught by `validate` before this is ever reached).
    pub fn capture_settings(&self) -> Option<CaptureSettings> {
        Some(CaptureSettings {
            device: self.device.clone()?,
            resolution: self
                .resolution
                .clone()
                .unwrap_or_else(|| DEFAULT_RESOLUTION.to_string()),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN servers handed to every viewer peer connection. Empty means
    /// host candidates only, which is fine on a LAN.
    pub stun_urls: Vec<String>,
}

/// Load configuration from a TOML file at the given path. The file is
/// required: the capture device and bind address have no usable defaults.
pub fn load_config(path: &Path) -> Result<GatewayConfig> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: GatewayConfig =
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")?;

    tracing::info!("Loaded config from {}", path.display());
    Ok(config)
}

impl GatewayConfig {
    /// Collect configuration issues. `ERROR:` entries are fatal at startup;
    /// `WARN:` entries are logged and tolerated.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        if self.server.bind.as_deref().is_none_or(str::is_empty) {
            issues.push("ERROR: server.bind is required".to_string());
        }
        if self.camera.device.as_deref().is_none_or(str::is_empty) {
            issues.push("ERROR: camera.device is required".to_string());
        }
        match &self.camera.resolution {
            None => issues.push(format!(
                "WARN: camera.resolution not set, defaulting to {DEFAULT_RESOLUTION}"
            )),
            Some(r) if !is_resolution(r) => issues.push(format!(
                "ERROR: camera.resolution '{r}' is not of the form <width>x<height>"
            )),
            Some(_) => {}
        }
        for url in &self.webrtc.stun_urls {
            if !url.starts_with("stun:") {
                issues.push(format!(
                    "WARN: webrtc.stun_urls entry '{url}' does not look like a STUN URL"
                ));
            }
        }

        if issues.is_empty() { Ok(()) } else { Err(issues) }
    }
}

fn is_resolution(s: &str) -> bool {
    match s.split_once('x') {
        Some((w, h)) => {
            w.parse::<u32>().is_ok_and(|v| v > 0) && h.parse::<u32>().is_ok_and(|v| v > 0)
        }
        None => false,
    }
}
