//! Presets: saved universe snapshots with a default fade time and the
//! active modes of profile-based fixtures at capture time.
//!
//! Channel arrays are always stored as exactly 512 bytes; sparse or
//! overlong input is padded or trimmed at the boundary.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::universe::{Universe, DMX_CHANNELS};

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preset {
    pub id: Uuid,
    pub name: String,
    /// Raw (pre-master) channel levels, exactly 512 bytes.
    pub channels: Vec<u8>,
    /// Default fade time in milliseconds when recalled without override.
    pub fade_time: u64,
    /// UI tag, carried through opaquely.
    pub color: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fixture_modes: BTreeMap<Uuid, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Compact listing used by the automation protocol.
#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetSummary {
    pub id: Uuid,
    pub name: String,
    pub fade_time: u64,
    pub color: String,
}

impl From<&Preset> for PresetSummary {
    fn from(preset: &Preset) -> Self {
        Self {
            id: preset.id,
            name: preset.name.clone(),
            fade_time: preset.fade_time,
            color: preset.color.clone(),
        }
    }
}

/// Partial update; `id` and `created_at` are never touched.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresetPatch {
    pub name: Option<String>,
    pub channels: Option<Vec<u8>>,
    pub fade_time: Option<u64>,
    pub color: Option<String>,
    pub fixture_modes: Option<BTreeMap<Uuid, String>>,
}

#[derive(Error, Debug)]
pub enum PresetError {
    #[error("unknown preset {0}")]
    UnknownPreset(Uuid),
}

#[derive(Default)]
pub struct PresetStore {
    presets: Vec<Preset>,
}

fn pad_channels(mut channels: Vec<u8>) -> Vec<u8> {
    channels.resize(DMX_CHANNELS, 0);
    channels
}

impl PresetStore {
    pub fn from_stored(presets: Vec<Preset>) -> Self {
        let presets = presets
            .into_iter()
            .map(|p| Preset {
                channels: pad_channels(p.channels),
                ..p
            })
            .collect();
        Self { presets }
    }

    pub fn list(&self) -> &[Preset] {
        &self.presets
    }

    pub fn summaries(&self) -> Vec<PresetSummary> {
        self.presets.iter().map(PresetSummary::from).collect()
    }

    pub fn get(&self, id: Uuid) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == id)
    }

    pub fn create(
        &mut self,
        name: String,
        channels: Vec<u8>,
        fade_time: u64,
        color: String,
        fixture_modes: BTreeMap<Uuid, String>,
    ) -> &Preset {
        let now = Utc::now();
        self.presets.push(Preset {
            id: Uuid::new_v4(),
            name,
            channels: pad_channels(channels),
            fade_time,
            color,
            fixture_modes,
            created_at: now,
            updated_at: now,
        });
        self.presets.last().expect("just pushed")
    }

    /// Capture the universe's current raw state as a new preset.
    pub fn capture(
        &mut self,
        name: String,
        universe: &Universe,
        fade_time: u64,
        color: String,
        fixture_modes: BTreeMap<Uuid, String>,
    ) -> &Preset {
        self.create(name, universe.raw().to_vec(), fade_time, color, fixture_modes)
    }

    pub fn update(&mut self, id: Uuid, patch: PresetPatch) -> Result<&Preset, PresetError> {
        let preset = self
            .presets
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(PresetError::UnknownPreset(id))?;
        if let Some(name) = patch.name {
            preset.name = name;
        }
        if let Some(channels) = patch.channels {
            preset.channels = pad_channels(channels);
        }
        if let Some(fade_time) = patch.fade_time {
            preset.fade_time = fade_time;
        }
        if let Some(color) = patch.color {
            preset.color = color;
        }
        if let Some(fixture_modes) = patch.fixture_modes {
            preset.fixture_modes = fixture_modes;
        }
        preset.updated_at = Utc::now();
        Ok(preset)
    }

    pub fn delete(&mut self, id: Uuid) -> bool {
        let before = self.presets.len();
        self.presets.retain(|p| p.id != id);
        self.presets.len() != before
    }
}
