/// Discovery of the audio output devices an application may be pinned to.
///
/// Devices come either from the `global.devices` list in the config or from a
/// SoundVolumeView JSON export (`/sjson`), which is written as UTF-16.
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::GlobalConfig;

/// Set of valid output device names.  Membership is exact (case-sensitive),
/// matching the names SoundVolumeView expects on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceSet {
    names: BTreeSet<String>,
}

impl DeviceSet {
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { names: names.into_iter().map(Into::into).collect() }
    }

    pub fn contains(&self, device: &str) -> bool {
        self.names.contains(device)
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }
}

impl fmt::Display for DeviceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.names.iter().map(String::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

/// One row of the SoundVolumeView JSON export.  Unknown fields are ignored.
#[derive(Debug, Deserialize)]
struct ExportedItem {
    #[serde(rename = "Name", default)]
    name: String,
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Direction", default)]
    direction: String,
}

/// Returns the valid device set for `global`.
///
/// An explicit `devices` list wins; otherwise SoundVolumeView is asked to
/// export its device table.  This blocks on the external tool, so async
/// callers must run it on a blocking thread.
pub fn discover(global: &GlobalConfig) -> Result<DeviceSet> {
    if let Some(names) = &global.devices {
        info!("Using {} device(s) from config", names.len());
        return Ok(DeviceSet::from_names(names.iter().cloned()));
    }
    export_from_sound_volume_view(&global.sound_volume_view_path)
}

fn export_from_sound_volume_view(tool: &str) -> Result<DeviceSet> {
    if !Path::new(tool).is_file() {
        bail!("Invalid SoundVolumeView path '{tool}'. Make sure the path is set correctly in the config");
    }

    let dir = tempfile::tempdir().context("Failed to create temporary directory")?;
    let export_path = dir.path().join("devices.json");

    let status = Command::new(tool)
        .arg("/sjson")
        .arg(&export_path)
        .status()
        .with_context(|| format!("Failed to run {tool}"))?;
    if !status.success() {
        bail!("Finding valid audio devices failed using {tool} /sjson. Error code = {:?}", status.code());
    }

    let raw = std::fs::read(&export_path)
        .with_context(|| format!("Failed to read device export: {}", export_path.display()))?;
    let devices = parse_export(&raw)?;
    info!("Found {} output device(s)", devices.len());
    debug!("Valid devices: {devices}");
    Ok(devices)
}

/// Parses a SoundVolumeView export and keeps render devices only.
pub fn parse_export(raw: &[u8]) -> Result<DeviceSet> {
    let text = decode_export(raw)?;
    let items: Vec<ExportedItem> =
        serde_json::from_str(&text).context("Failed to parse device export JSON")?;
    Ok(DeviceSet::from_names(
        items
            .into_iter()
            .filter(|item| item.direction == "Render" && item.kind == "Device")
            .map(|item| item.name),
    ))
}

/// Decodes UTF-16LE (with or without BOM).  Falls back to UTF-8 when the
/// buffer carries a UTF-8 BOM or has no interleaved NUL bytes.
fn decode_export(raw: &[u8]) -> Result<String> {
    if let Some(rest) = raw.strip_prefix(&[0xEF, 0xBB, 0xBF]) {
        return String::from_utf8(rest.to_vec()).context("Device export is not valid UTF-8");
    }
    let looks_utf16 = raw.starts_with(&[0xFF, 0xFE]) || raw.get(1) == Some(&0);
    if !looks_utf16 {
        return String::from_utf8(raw.to_vec()).context("Device export is not valid UTF-8");
    }
    if raw.len() % 2 != 0 {
        bail!("Device export has an odd byte length for UTF-16");
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let text = String::from_utf16(&units).context("Device export is not valid UTF-16")?;
    Ok(text.trim_start_matches('\u{feff}').to_string())
}
