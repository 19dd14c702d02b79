use std::{
    collections::HashSet,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context};
use desk_core::DeskConfig;
use serde::Deserialize;
use shared::{
    domain::{DeskCredentials, DeskId, HeightLimits, Preset},
    protocol::DEFAULT_API_BASE_URL,
};
use url::Url;

pub const DEFAULT_CONFIG_PATH: &str = "deskctl.toml";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    api_base_url: Option<String>,
    stream_idle_timeout_secs: Option<u64>,
    active_desk: Option<String>,
    #[serde(default)]
    desks: Vec<FileDesk>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileDesk {
    id: String,
    name: Option<String>,
    access_token: Option<String>,
    sitting_height: Option<i32>,
    standing_height: Option<i32>,
    #[serde(default)]
    presets: Vec<FilePreset>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilePreset {
    height: i32,
    name: Option<String>,
    order: Option<i32>,
}

#[derive(Debug)]
pub struct DeskSettings {
    pub config: DeskConfig,
    pub presets: Vec<Preset>,
}

#[derive(Debug)]
pub struct Settings {
    pub api_base_url: Url,
    pub stream_idle_timeout: Duration,
    pub active_desk: Option<DeskId>,
    pub desks: Vec<DeskSettings>,
}

/// Reads the config file, then applies `DESKCTL_*` environment overrides.
///
/// A missing file is only an error when the path was given explicitly.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound && !explicit => String::new(),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config '{}'", path.display()))
        }
    };

    parse_settings(&raw, |key| std::env::var(key).ok())
        .with_context(|| format!("invalid config '{}'", path.display()))
}

pub fn parse_settings(
    raw: &str,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Settings> {
    let file: FileConfig = toml::from_str(raw)?;

    let api_base_url = env("DESKCTL_API_BASE_URL")
        .or(file.api_base_url)
        .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
    let api_base_url = Url::parse(&api_base_url)
        .with_context(|| format!("api_base_url '{api_base_url}' is not a valid URL"))?;

    let idle_secs = match env("DESKCTL_STREAM_IDLE_TIMEOUT_SECS") {
        Some(value) => value
            .parse::<u64>()
            .with_context(|| format!("DESKCTL_STREAM_IDLE_TIMEOUT_SECS '{value}' is not a number"))?,
        None => file
            .stream_idle_timeout_secs
            .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
    };
    if idle_secs == 0 {
        bail!("stream_idle_timeout_secs must be positive");
    }

    let fallback_token = env("DESKCTL_ACCESS_TOKEN");
    let mut seen = HashSet::new();
    let mut desks = Vec::with_capacity(file.desks.len());
    for desk in file.desks {
        if desk.id.trim().is_empty() {
            bail!("desk id must not be empty");
        }
        if !seen.insert(desk.id.clone()) {
            bail!("desk '{}' is configured more than once", desk.id);
        }
        desks.push(desk_settings(desk, fallback_token.as_deref())?);
    }

    let active_desk = file.active_desk.map(DeskId::new);
    if let Some(active) = &active_desk {
        if !seen.contains(active.as_str()) {
            bail!("active_desk '{active}' is not a configured desk");
        }
    }

    Ok(Settings {
        api_base_url,
        stream_idle_timeout: Duration::from_secs(idle_secs),
        active_desk,
        desks,
    })
}

fn desk_settings(desk: FileDesk, fallback_token: Option<&str>) -> anyhow::Result<DeskSettings> {
    let access_token = desk
        .access_token
        .filter(|token| !token.is_empty())
        .or_else(|| fallback_token.map(str::to_string))
        .with_context(|| {
            format!(
                "desk '{}' has no access_token and DESKCTL_ACCESS_TOKEN is not set",
                desk.id
            )
        })?;

    let defaults = HeightLimits::default();
    let limits = HeightLimits {
        sitting_cm: desk.sitting_height.unwrap_or(defaults.sitting_cm),
        standing_cm: desk.standing_height.unwrap_or(defaults.standing_cm),
    };
    if limits.sitting_cm >= limits.standing_cm {
        bail!(
            "desk '{}': sitting_height {} must be below standing_height {}",
            desk.id,
            limits.sitting_cm,
            limits.standing_cm
        );
    }

    let presets = assign_orders(&desk.id, desk.presets)?;
    let id = DeskId::new(desk.id);
    Ok(DeskSettings {
        config: DeskConfig {
            name: desk.name.unwrap_or_else(|| id.to_string()),
            credentials: DeskCredentials::new(id, access_token),
            limits,
        },
        presets,
    })
}

/// Presets without an order continue after the highest order seen so far.
fn assign_orders(desk_id: &str, presets: Vec<FilePreset>) -> anyhow::Result<Vec<Preset>> {
    let mut next = 0;
    let mut seen = HashSet::new();
    let mut assigned = Vec::with_capacity(presets.len());
    for preset in presets {
        let order = preset.order.unwrap_or(next);
        if !seen.insert(order) {
            bail!("desk '{desk_id}' has more than one preset with order {order}");
        }
        next = next.max(order.saturating_add(1));
        assigned.push(Preset::new(preset.height, order, preset.name));
    }
    Ok(assigned)
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
