//! Fixture profile documents.
//!
//! A profile is an immutable template describing a fixture's channel
//! layout and operating modes. Profiles are JSON documents loaded from a
//! directory at startup; a built-in set of generic profiles seeds the
//! library when that directory is missing or empty. Documents are
//! validated on load, not on use.
//!
//! Channel keys sort lexicographically to give the channel order, so a
//! profile's DMX footprint is `sorted(channels.keys())` mapped onto
//! consecutive addresses from the fixture's start address.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Semantic role of a profile channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ChannelRole {
    Dimmer,
    Temperature,
    Hue,
    Saturation,
    Brightness,
    Red,
    Green,
    Blue,
    ModeSelect,
    Dynamic,
    Custom,
}

/// One channel within a profile.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProfileChannel {
    pub role: ChannelRole,
    pub label: String,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ControlStep {
    pub label: String,
    pub value: u8,
}

/// How a channel is surfaced in a given mode. `null` in the `controls`
/// map means the channel is suppressed in that mode.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Control {
    Fader,
    Momentary,
    Toggle,
    Stepped {
        steps: Vec<ControlStep>,
        #[serde(
            default,
            rename = "extraButtons",
            skip_serializing_if = "Vec::is_empty"
        )]
        extra_buttons: Vec<ControlStep>,
    },
}

/// Names the hue/saturation(/brightness) channels forming a color wheel.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColorWheelGroup {
    pub hue: String,
    pub saturation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<String>,
}

impl ColorWheelGroup {
    pub fn contains(&self, key: &str) -> bool {
        self.hue == key || self.saturation == key || self.brightness.as_deref() == Some(key)
    }
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileMode {
    pub name: String,
    /// Value asserted on the mode-select channel when this mode activates.
    pub channel_value: u8,
    #[serde(default)]
    pub controls: BTreeMap<String, Option<Control>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_wheel_group: Option<ColorWheelGroup>,
    /// Values asserted on other channels when this mode activates.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub defaults: BTreeMap<String, u8>,
}

#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixtureProfile {
    /// Display name; also the identity used for drift refresh.
    pub fixture: String,
    pub channel_count: usize,
    pub channels: BTreeMap<String, ProfileChannel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub modes: Vec<ProfileMode>,
    /// Unknown document fields, preserved but ignored.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("channelCount must be at least 1")]
    EmptyChannelCount,
    #[error("profile has no channels")]
    NoChannels,
    #[error("channelCount is {expected} but {actual} channels are defined")]
    ChannelCountMismatch { expected: usize, actual: usize },
    #[error("{context} references unknown channel key '{key}'")]
    UnknownKey { context: String, key: String },
}

impl FixtureProfile {
    /// Channel keys in channel order (lexicographic).
    pub fn sorted_keys(&self) -> impl Iterator<Item = &String> {
        self.channels.keys()
    }

    /// 0-based index of `key` within the channel order.
    pub fn channel_index(&self, key: &str) -> Option<usize> {
        self.channels.keys().position(|k| k == key)
    }

    pub fn mode(&self, name: &str) -> Option<&ProfileMode> {
        self.modes.iter().find(|m| m.name == name)
    }

    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.channel_count == 0 {
            return Err(ProfileError::EmptyChannelCount);
        }
        if self.channels.is_empty() {
            return Err(ProfileError::NoChannels);
        }
        if self.channels.len() != self.channel_count {
            return Err(ProfileError::ChannelCountMismatch {
                expected: self.channel_count,
                actual: self.channels.len(),
            });
        }
        if let Some(mode_key) = &self.mode_channel {
            if !self.channels.contains_key(mode_key) {
                return Err(ProfileError::UnknownKey {
                    context: "modeChannel".into(),
                    key: mode_key.clone(),
                });
            }
        }
        for mode in &self.modes {
            for key in mode.controls.keys() {
                if !self.channels.contains_key(key) {
                    return Err(ProfileError::UnknownKey {
                        context: format!("mode '{}' controls", mode.name),
                        key: key.clone(),
                    });
                }
            }
            for key in mode.defaults.keys() {
                if !self.channels.contains_key(key) {
                    return Err(ProfileError::UnknownKey {
                        context: format!("mode '{}' defaults", mode.name),
                        key: key.clone(),
                    });
                }
            }
            if let Some(group) = &mode.color_wheel_group {
                for key in [Some(&group.hue), Some(&group.saturation), group.brightness.as_ref()]
                    .into_iter()
                    .flatten()
                {
                    if !self.channels.contains_key(key) {
                        return Err(ProfileError::UnknownKey {
                            context: format!("mode '{}' colorWheelGroup", mode.name),
                            key: key.clone(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// A loaded profile with its document id (the file stem).
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct ProfileEntry {
    pub id: String,
    pub profile: FixtureProfile,
}

#[derive(Default)]
pub struct ProfileLibrary {
    profiles: BTreeMap<String, FixtureProfile>,
}

impl ProfileLibrary {
    /// Scan `dir` for `*.json` profile documents. Invalid documents are
    /// logged and skipped. When nothing loads, the built-in generic
    /// profiles seed the library; on-disk documents win over built-ins
    /// with the same id.
    pub fn load(dir: &Path) -> Self {
        let mut profiles = BTreeMap::new();

        match fs::read_dir(dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("json") {
                        continue;
                    }
                    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    match Self::parse_file(&path) {
                        Ok(profile) => {
                            profiles.insert(stem.to_string(), profile);
                        }
                        Err(e) => log::warn!("skipping profile {}: {e}", path.display()),
                    }
                }
            }
            Err(e) => log::warn!("profile directory {} unavailable: {e}", dir.display()),
        }

        if profiles.is_empty() {
            log::info!("no profile documents found, using built-in profiles");
        }
        for (id, profile) in builtin_profiles() {
            profiles.entry(id).or_insert(profile);
        }

        log::info!("{} fixture profiles loaded", profiles.len());
        Self { profiles }
    }

    fn parse_file(path: &Path) -> Result<FixtureProfile, String> {
        let text = fs::read_to_string(path).map_err(|e| e.to_string())?;
        let profile: FixtureProfile = serde_json::from_str(&text).map_err(|e| e.to_string())?;
        profile.validate().map_err(|e| e.to_string())?;
        Ok(profile)
    }

    pub fn list(&self) -> Vec<ProfileEntry> {
        self.profiles
            .iter()
            .map(|(id, profile)| ProfileEntry {
                id: id.clone(),
                profile: profile.clone(),
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&FixtureProfile> {
        self.profiles.get(id)
    }

    /// Lookup by the profile's display name, used by drift refresh.
    pub fn find_by_name(&self, fixture: &str) -> Option<&FixtureProfile> {
        self.profiles.values().find(|p| p.fixture == fixture)
    }

    #[cfg(test)]
    pub fn from_profiles(profiles: impl IntoIterator<Item = (String, FixtureProfile)>) -> Self {
        Self {
            profiles: profiles.into_iter().collect(),
        }
    }
}

fn channel(role: ChannelRole, label: &str) -> ProfileChannel {
    ProfileChannel {
        role,
        label: label.to_string(),
    }
}

/// Generic profiles compiled into the binary.
pub fn builtin_profiles() -> Vec<(String, FixtureProfile)> {
    let dimmer = FixtureProfile {
        fixture: "Generic Dimmer".into(),
        channel_count: 1,
        channels: BTreeMap::from([("ch01".into(), channel(ChannelRole::Dimmer, "Intensity"))]),
        mode_channel: None,
        modes: Vec::new(),
        extra: Default::default(),
    };

    let rgb = FixtureProfile {
        fixture: "Generic RGB Par".into(),
        channel_count: 4,
        channels: BTreeMap::from([
            ("ch01".into(), channel(ChannelRole::Dimmer, "Intensity")),
            ("ch02".into(), channel(ChannelRole::Red, "Red")),
            ("ch03".into(), channel(ChannelRole::Green, "Green")),
            ("ch04".into(), channel(ChannelRole::Blue, "Blue")),
        ]),
        mode_channel: None,
        modes: Vec::new(),
        extra: Default::default(),
    };

    let rgbw = FixtureProfile {
        fixture: "Generic RGBW Par".into(),
        channel_count: 5,
        channels: BTreeMap::from([
            ("ch01".into(), channel(ChannelRole::Dimmer, "Intensity")),
            ("ch02".into(), channel(ChannelRole::Red, "Red")),
            ("ch03".into(), channel(ChannelRole::Green, "Green")),
            ("ch04".into(), channel(ChannelRole::Blue, "Blue")),
            ("ch05".into(), channel(ChannelRole::Custom, "White")),
        ]),
        mode_channel: None,
        modes: Vec::new(),
        extra: Default::default(),
    };

    let moving_head = FixtureProfile {
        fixture: "Generic Moving Head".into(),
        channel_count: 8,
        channels: BTreeMap::from([
            ("ch01".into(), channel(ChannelRole::Dimmer, "Intensity")),
            ("ch02".into(), channel(ChannelRole::ModeSelect, "Mode")),
            ("ch03".into(), channel(ChannelRole::Hue, "Color Wheel")),
            ("ch04".into(), channel(ChannelRole::Saturation, "Saturation")),
            ("ch05".into(), channel(ChannelRole::Dynamic, "Gobo")),
            ("ch06".into(), channel(ChannelRole::Dynamic, "Prism")),
            ("ch07".into(), channel(ChannelRole::Dynamic, "Strobe")),
            ("ch08".into(), channel(ChannelRole::Custom, "Speed")),
        ]),
        mode_channel: Some("ch02".into()),
        modes: vec![
            ProfileMode {
                name: "Wash".into(),
                channel_value: 0,
                controls: BTreeMap::from([
                    ("ch01".into(), Some(Control::Fader)),
                    ("ch03".into(), Some(Control::Fader)),
                    ("ch04".into(), Some(Control::Fader)),
                ]),
                color_wheel_group: Some(ColorWheelGroup {
                    hue: "ch03".into(),
                    saturation: "ch04".into(),
                    brightness: None,
                }),
                defaults: BTreeMap::new(),
            },
            ProfileMode {
                name: "Effects".into(),
                channel_value: 64,
                controls: BTreeMap::from([
                    ("ch01".into(), Some(Control::Fader)),
                    (
                        "ch05".into(),
                        Some(Control::Stepped {
                            steps: vec![
                                ControlStep {
                                    label: "Open".into(),
                                    value: 0,
                                },
                                ControlStep {
                                    label: "Dots".into(),
                                    value: 32,
                                },
                                ControlStep {
                                    label: "Stars".into(),
                                    value: 64,
                                },
                            ],
                            extra_buttons: Vec::new(),
                        }),
                    ),
                    ("ch07".into(), Some(Control::Toggle)),
                ]),
                color_wheel_group: None,
                defaults: BTreeMap::from([("ch08".into(), 127)]),
            },
        ],
        extra: Default::default(),
    };

    vec![
        ("generic-dimmer".to_string(), dimmer),
        ("generic-rgb-par".to_string(), rgb),
        ("generic-rgbw-par".to_string(), rgbw),
        ("generic-moving-head".to_string(), moving_head),
    ]
}
