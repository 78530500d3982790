//! The fixture registry: named groupings of DMX channels, optionally
//! bound to a profile document.
//!
//! The registry never writes to the universe. Mode activation returns the
//! list of channel writes it implies; the engine applies them (and runs
//! the mode-switch hygiene pass) so both remote surfaces share one
//! implementation.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::profiles::{ChannelRole, FixtureProfile, ProfileLibrary, ProfileMode};
use crate::universe::DMX_CHANNELS;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ColorMode {
    Rgb,
    Hsb,
}

/// One DMX address claimed by a fixture.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelBinding {
    pub name: String,
    pub dmx_channel: usize,
}

/// Rich-client canvas placement, carried through opaquely.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasLayout {
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    #[serde(default)]
    pub rotation: f64,
    #[serde(default)]
    pub width: f64,
    #[serde(default)]
    pub height: f64,
    #[serde(default)]
    pub on_canvas: bool,
}

impl CanvasLayout {
    fn valid(&self) -> bool {
        [self.x, self.y, self.rotation, self.width, self.height]
            .iter()
            .all(|v| v.is_finite())
            && self.width >= 0.0
            && self.height >= 0.0
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fixture {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub color_mode: ColorMode,
    pub channels: Vec<ChannelBinding>,
    /// Copy of the profile document as of the last sync, for
    /// profile-based fixtures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<FixtureProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_address: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout: Option<CanvasLayout>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Fixture {
    pub fn is_profile_based(&self) -> bool {
        self.profile.is_some() && self.start_address.is_some()
    }
}

/// One write the engine should apply to the universe.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ChannelWrite {
    pub channel: usize,
    pub value: u8,
}

/// Partial update; absent fields keep their current value.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixturePatch {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub color_mode: Option<ColorMode>,
    pub channels: Option<Vec<ChannelBinding>>,
    pub layout: Option<CanvasLayout>,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("unknown fixture {0}")]
    UnknownFixture(Uuid),
    #[error("unknown profile '{0}'")]
    UnknownProfile(String),
    #[error("fixture {0} is not profile-based")]
    NotProfileFixture(Uuid),
    #[error("profile has no mode named '{0}'")]
    UnknownMode(String),
    #[error("start address {start} with {count} channels exceeds the DMX universe")]
    InvalidAddress { start: usize, count: usize },
    #[error("layout fields out of bounds")]
    InvalidLayout,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStrategy {
    Replace,
    Merge,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureExport {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub fixtures: Vec<Fixture>,
}

#[derive(Clone, PartialEq, Debug, Default, Serialize)]
pub struct ImportResult {
    pub added: usize,
    pub skipped: usize,
    pub conflicts: Vec<String>,
}

#[derive(Default)]
pub struct FixtureRegistry {
    fixtures: Vec<Fixture>,
}

impl FixtureRegistry {
    pub fn from_stored(fixtures: Vec<Fixture>) -> Self {
        Self { fixtures }
    }

    pub fn list(&self) -> &[Fixture] {
        &self.fixtures
    }

    pub fn get(&self, id: Uuid) -> Option<&Fixture> {
        self.fixtures.iter().find(|f| f.id == id)
    }

    fn get_mut(&mut self, id: Uuid) -> Option<&mut Fixture> {
        self.fixtures.iter_mut().find(|f| f.id == id)
    }

    /// Create a flat fixture from explicit channel bindings.
    pub fn create(
        &mut self,
        name: String,
        kind: String,
        color_mode: ColorMode,
        channels: Vec<ChannelBinding>,
        layout: Option<CanvasLayout>,
    ) -> Result<&Fixture, RegistryError> {
        if let Some(layout) = &layout {
            if !layout.valid() {
                return Err(RegistryError::InvalidLayout);
            }
        }
        let now = Utc::now();
        self.fixtures.push(Fixture {
            id: Uuid::new_v4(),
            name,
            kind,
            color_mode,
            channels,
            profile: None,
            start_address: None,
            active_mode: None,
            layout,
            created_at: now,
            updated_at: now,
        });
        Ok(self.fixtures.last().expect("just pushed"))
    }

    /// Create a fixture bound to a profile, with contiguous addresses
    /// starting at `start_address`.
    pub fn create_from_profile(
        &mut self,
        name: String,
        profile_id: &str,
        start_address: usize,
        library: &ProfileLibrary,
    ) -> Result<&Fixture, RegistryError> {
        let profile = library
            .get(profile_id)
            .ok_or_else(|| RegistryError::UnknownProfile(profile_id.to_string()))?;
        if start_address < 1 || start_address + profile.channel_count - 1 > DMX_CHANNELS {
            return Err(RegistryError::InvalidAddress {
                start: start_address,
                count: profile.channel_count,
            });
        }

        let channels = profile
            .sorted_keys()
            .enumerate()
            .map(|(index, key)| ChannelBinding {
                name: profile.channels[key].label.clone(),
                dmx_channel: start_address + index,
            })
            .collect();
        let active_mode = profile.modes.first().map(|m| m.name.clone());

        let now = Utc::now();
        self.fixtures.push(Fixture {
            id: Uuid::new_v4(),
            name,
            kind: profile.fixture.clone(),
            color_mode: ColorMode::Hsb,
            channels,
            profile: Some(profile.clone()),
            start_address: Some(start_address),
            active_mode,
            layout: None,
            created_at: now,
            updated_at: now,
        });
        Ok(self.fixtures.last().expect("just pushed"))
    }

    pub fn update(&mut self, id: Uuid, patch: FixturePatch) -> Result<&Fixture, RegistryError> {
        if let Some(layout) = &patch.layout {
            if !layout.valid() {
                return Err(RegistryError::InvalidLayout);
            }
        }
        let fixture = self.get_mut(id).ok_or(RegistryError::UnknownFixture(id))?;
        if let Some(name) = patch.name {
            fixture.name = name;
        }
        if let Some(kind) = patch.kind {
            fixture.kind = kind;
        }
        if let Some(color_mode) = patch.color_mode {
            fixture.color_mode = color_mode;
        }
        if let Some(channels) = patch.channels {
            fixture.channels = channels;
        }
        if let Some(layout) = patch.layout {
            fixture.layout = Some(layout);
        }
        fixture.updated_at = Utc::now();
        Ok(fixture)
    }

    pub fn delete(&mut self, id: Uuid) -> bool {
        let before = self.fixtures.len();
        self.fixtures.retain(|f| f.id != id);
        self.fixtures.len() != before
    }

    /// Activate `mode_name` on a profile-based fixture. Returns the writes
    /// the engine must apply: the mode-select channel first (when the
    /// profile has one), then the mode's defaults in key order.
    pub fn set_active_mode(
        &mut self,
        id: Uuid,
        mode_name: &str,
    ) -> Result<Vec<ChannelWrite>, RegistryError> {
        let fixture = self.get_mut(id).ok_or(RegistryError::UnknownFixture(id))?;
        let (profile, start) = match (&fixture.profile, fixture.start_address) {
            (Some(profile), Some(start)) => (profile, start),
            _ => return Err(RegistryError::NotProfileFixture(id)),
        };
        let mode = profile
            .mode(mode_name)
            .ok_or_else(|| RegistryError::UnknownMode(mode_name.to_string()))?;

        let mut writes = Vec::new();
        if let Some(mode_key) = &profile.mode_channel {
            if let Some(index) = profile.channel_index(mode_key) {
                writes.push(ChannelWrite {
                    channel: start + index,
                    value: mode.channel_value,
                });
            }
        }
        for (key, &value) in &mode.defaults {
            if let Some(index) = profile.channel_index(key) {
                writes.push(ChannelWrite {
                    channel: start + index,
                    value,
                });
            }
        }

        fixture.active_mode = Some(mode_name.to_string());
        fixture.updated_at = Utc::now();
        Ok(writes)
    }

    /// Mode-switch hygiene: DMX addresses of dynamic-role channels that
    /// have no control surface in `mode_name` and are not kept alive by a
    /// default or the color wheel group. The engine zeroes these after
    /// applying the activation writes.
    pub fn mode_cleanup_channels(
        &self,
        id: Uuid,
        mode_name: &str,
    ) -> Result<Vec<usize>, RegistryError> {
        let fixture = self.get(id).ok_or(RegistryError::UnknownFixture(id))?;
        let (profile, start) = match (&fixture.profile, fixture.start_address) {
            (Some(profile), Some(start)) => (profile, start),
            _ => return Err(RegistryError::NotProfileFixture(id)),
        };
        let mode = profile
            .mode(mode_name)
            .ok_or_else(|| RegistryError::UnknownMode(mode_name.to_string()))?;

        Ok(profile
            .sorted_keys()
            .enumerate()
            .filter(|(_, key)| dynamic_without_control(profile, mode, key))
            .map(|(index, _)| start + index)
            .collect())
    }

    /// One report line per DMX address claimed by more than one binding.
    /// The first binding encountered owns the address.
    pub fn validate_channel_conflicts(&self) -> Vec<String> {
        let mut owners: HashMap<usize, (&str, &str)> = HashMap::new();
        let mut conflicts = Vec::new();
        for fixture in &self.fixtures {
            for binding in &fixture.channels {
                match owners.get(&binding.dmx_channel) {
                    Some((owner_fixture, owner_channel)) => {
                        conflicts.push(format!(
                            "DMX {}: '{}' ({}) conflicts with '{}' ({})",
                            binding.dmx_channel,
                            owner_fixture,
                            owner_channel,
                            fixture.name,
                            binding.name,
                        ));
                    }
                    None => {
                        owners.insert(binding.dmx_channel, (&fixture.name, &binding.name));
                    }
                }
            }
        }
        conflicts
    }

    /// Re-sync stored profile copies against the bundled library; the
    /// bundled document is authoritative. Id, start address, active mode
    /// and layout are untouched. Returns whether anything changed.
    pub fn refresh_profiles(&mut self, library: &ProfileLibrary) -> bool {
        let mut changed = false;
        for fixture in &mut self.fixtures {
            let Some(stored) = &fixture.profile else {
                continue;
            };
            let Some(bundled) = library.find_by_name(&stored.fixture) else {
                continue;
            };
            if stored != bundled {
                log::info!(
                    "refreshing profile '{}' on fixture '{}'",
                    stored.fixture,
                    fixture.name
                );
                fixture.profile = Some(bundled.clone());
                changed = true;
            }
        }
        changed
    }

    pub fn export(&self) -> FixtureExport {
        FixtureExport {
            version: 1,
            exported_at: Utc::now(),
            fixtures: self.fixtures.clone(),
        }
    }

    pub fn import(&mut self, document: FixtureExport, strategy: ImportStrategy) -> ImportResult {
        match strategy {
            ImportStrategy::Replace => {
                let added = document.fixtures.len();
                self.fixtures = document.fixtures;
                ImportResult {
                    added,
                    skipped: 0,
                    conflicts: Vec::new(),
                }
            }
            ImportStrategy::Merge => {
                let mut result = ImportResult::default();
                for incoming in document.fixtures {
                    if self.get(incoming.id).is_some() {
                        result.conflicts.push(format!(
                            "fixture '{}' ({}) already exists",
                            incoming.name, incoming.id
                        ));
                        result.skipped += 1;
                        continue;
                    }
                    let overlap = incoming.channels.iter().find_map(|binding| {
                        self.fixtures.iter().find_map(|existing| {
                            existing
                                .channels
                                .iter()
                                .any(|b| b.dmx_channel == binding.dmx_channel)
                                .then(|| (binding.dmx_channel, existing.name.clone()))
                        })
                    });
                    if let Some((channel, existing)) = overlap {
                        result.conflicts.push(format!(
                            "fixture '{}' overlaps DMX {} with '{}'",
                            incoming.name, channel, existing
                        ));
                        result.skipped += 1;
                        continue;
                    }
                    self.fixtures.push(incoming);
                    result.added += 1;
                }
                result
            }
        }
    }
}

fn dynamic_without_control(profile: &FixtureProfile, mode: &ProfileMode, key: &str) -> bool {
    if profile.channels[key].role != ChannelRole::Dynamic {
        return false;
    }
    if matches!(mode.controls.get(key), Some(Some(_))) {
        return false;
    }
    if mode.defaults.contains_key(key) {
        return false;
    }
    if let Some(group) = &mode.color_wheel_group {
        if group.contains(key) {
            return false;
        }
    }
    true
}
