use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque device identifier assigned by the device proxy. Equality key for a desk.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeskId(pub String);

impl DeskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Stopped,
    MovingUp,
    MovingDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Closed,
    Connecting,
    Open,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeskCredentials {
    pub id: DeskId,
    pub access_token: String,
}

impl DeskCredentials {
    pub fn new(id: DeskId, access_token: impl Into<String>) -> Self {
        Self {
            id,
            access_token: access_token.into(),
        }
    }
}

impl fmt::Debug for DeskCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeskCredentials")
            .field("id", &self.id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

pub const DEFAULT_SITTING_HEIGHT_CM: i32 = 60;
pub const DEFAULT_STANDING_HEIGHT_CM: i32 = 100;

/// Heights used by the plain raise/lower commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeightLimits {
    pub sitting_cm: i32,
    pub standing_cm: i32,
}

impl Default for HeightLimits {
    fn default() -> Self {
        Self {
            sitting_cm: DEFAULT_SITTING_HEIGHT_CM,
            standing_cm: DEFAULT_STANDING_HEIGHT_CM,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Preset {
    pub height: i32,
    pub order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Preset {
    pub fn new(height: i32, order: i32, name: Option<String>) -> Self {
        Self {
            height,
            order,
            name,
        }
    }

    /// Whether `height` lies within ±1 cm of this preset.
    pub fn matches_height(&self, height: i32) -> bool {
        (self.height - 1..=self.height + 1).contains(&height)
    }
}

pub fn ordered_presets(presets: &[Preset]) -> Vec<Preset> {
    let mut ordered = presets.to_vec();
    ordered.sort_by_key(|preset| preset.order);
    ordered
}

pub fn height_ordered_presets(presets: &[Preset]) -> Vec<Preset> {
    let mut ordered = presets.to_vec();
    ordered.sort_by_key(|preset| (preset.height, preset.order));
    ordered
}

/// Label for a preset: its name, or "Preset #n" by position among `presets` in display order.
pub fn display_name(preset: &Preset, presets: &[Preset]) -> String {
    if let Some(name) = preset.name.as_deref().filter(|name| !name.is_empty()) {
        return name.to_string();
    }
    ordered_presets(presets)
        .iter()
        .position(|candidate| candidate == preset)
        .map(|index| format!("Preset #{}", index + 1))
        .unwrap_or_else(|| "Preset".to_string())
}
