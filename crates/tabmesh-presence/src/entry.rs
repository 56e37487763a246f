//! Presence entries

use serde::{Deserialize, Serialize};

use tabmesh_core::Identity;

/// Activity status of a participant
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    #[default]
    Active,
    Idle,
    Away,
}

/// Cursor position in canvas coordinates
#[derive(Clone, Copy, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        CursorPosition { x, y }
    }

    /// Linear interpolation; `t` outside `[0, 1]` extrapolates
    pub fn lerp(&self, other: &CursorPosition, t: f64) -> CursorPosition {
        CursorPosition {
            x: self.x + (other.x - self.x) * t,
            y: self.y + (other.y - self.y) * t,
        }
    }
}

/// Selected object ids
#[derive(Clone, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Selection {
    #[serde(default)]
    pub ids: Vec<String>,
}

impl Selection {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Live status of one participant context
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceEntry {
    /// Tab id of the participant context
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub device_id: String,
    pub tab_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub selection: Selection,
    #[serde(default)]
    pub status: PresenceStatus,
    /// Local receive time of the last update (ms)
    #[serde(default)]
    pub last_seen: u64,
    #[serde(default)]
    pub is_same_device: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency: Option<u64>,
}

impl PresenceEntry {
    pub fn from_identity(identity: &Identity, now_ms: u64) -> Self {
        PresenceEntry {
            id: identity.tab_id.to_string(),
            user_id: identity.user_id.clone(),
            device_id: identity.device_id.to_string(),
            tab_id: identity.tab_id.to_string(),
            display_name: identity
                .user_id
                .clone()
                .unwrap_or_else(|| identity.tab_id.to_string()),
            color: color_for(identity.tab_id.as_str()).to_string(),
            cursor: None,
            selection: Selection::default(),
            status: PresenceStatus::Active,
            last_seen: now_ms,
            is_same_device: false,
            latency: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = color.into();
        self
    }

    #[inline]
    pub fn is_stale(&self, now_ms: u64, stale_timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen) > stale_timeout_ms
    }
}

const PALETTE: [&str; 8] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0", "#f032e6", "#bcf60c",
];

/// Stable color for an id
pub fn color_for(id: &str) -> &'static str {
    let hash = id
        .bytes()
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u32));
    PALETTE[hash as usize % PALETTE.len()]
}
