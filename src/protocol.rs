//! Wire types for both remote-control surfaces.
//!
//! Both protocols exchange one JSON object per line. Message variants are
//! internally tagged: the live-client protocol on `type` (colon-namespaced
//! event names), the automation protocol on `action` / `event`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fixtures::{
    CanvasLayout, ChannelBinding, ColorMode, Fixture, FixtureExport, ImportStrategy,
};
use crate::presets::{Preset, PresetSummary};
use crate::profiles::ProfileEntry;

// ---------------------------------------------------------------------------
// Live-client protocol (rich UI), TCP 9090
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type")]
pub enum LiveCommand {
    #[serde(rename = "dmx:set-channel")]
    SetChannel { channel: usize, value: f64 },
    #[serde(rename = "dmx:set-channels")]
    SetChannels { values: BTreeMap<String, f64> },
    #[serde(rename = "dmx:master")]
    Master { value: f64 },
    #[serde(rename = "dmx:blackout", rename_all = "camelCase")]
    Blackout {
        #[serde(default)]
        fade_time: Option<u64>,
    },
    #[serde(rename = "preset:recall", rename_all = "camelCase")]
    PresetRecall {
        id: Uuid,
        #[serde(default)]
        fade_time: Option<u64>,
    },
    #[serde(rename = "preset:save", rename_all = "camelCase")]
    PresetSave {
        name: String,
        #[serde(default)]
        fade_time: u64,
        #[serde(default)]
        color: String,
    },
    #[serde(rename = "preset:update", rename_all = "camelCase")]
    PresetUpdate {
        id: Uuid,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        channels: Option<Vec<u8>>,
        #[serde(default)]
        fade_time: Option<u64>,
        #[serde(default)]
        color: Option<String>,
    },
    #[serde(rename = "preset:delete")]
    PresetDelete { id: Uuid },
    #[serde(rename = "fixture:create", rename_all = "camelCase")]
    FixtureCreate {
        name: String,
        #[serde(rename = "type")]
        kind: String,
        color_mode: ColorMode,
        channels: Vec<ChannelBinding>,
        #[serde(default)]
        layout: Option<CanvasLayout>,
    },
    #[serde(rename = "fixture:update", rename_all = "camelCase")]
    FixtureUpdate {
        id: Uuid,
        #[serde(default)]
        name: Option<String>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
        #[serde(default)]
        color_mode: Option<ColorMode>,
        #[serde(default)]
        channels: Option<Vec<ChannelBinding>>,
        #[serde(default)]
        layout: Option<CanvasLayout>,
    },
    #[serde(rename = "fixture:delete")]
    FixtureDelete { id: Uuid },
    #[serde(rename = "fixture:create-from-profile", rename_all = "camelCase")]
    FixtureCreateFromProfile {
        name: String,
        profile_id: String,
        start_address: usize,
    },
    #[serde(rename = "fixture:set-mode", rename_all = "camelCase")]
    FixtureSetMode { fixture_id: Uuid, mode_name: String },
    #[serde(rename = "fixture:trigger-start")]
    TriggerStart { channel: usize },
    #[serde(rename = "fixture:trigger-end")]
    TriggerEnd { channel: usize },
    #[serde(rename = "fixture:get-profiles")]
    GetProfiles,
    #[serde(rename = "fixture:export")]
    Export,
    #[serde(rename = "fixture:import")]
    Import {
        document: FixtureExport,
        strategy: ImportStrategy,
    },
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type")]
pub enum LiveEvent {
    #[serde(rename = "dmx:state")]
    DmxState { channels: Vec<u8>, master: u8 },
    #[serde(rename = "dmx:status")]
    DmxStatus {
        connected: bool,
        port: Option<String>,
    },
    #[serde(rename = "presets:list")]
    PresetsList { presets: Vec<Preset> },
    #[serde(rename = "preset:activated")]
    PresetActivated { id: Uuid, name: String },
    #[serde(rename = "fixtures:list")]
    FixturesList { fixtures: Vec<Fixture> },
    #[serde(rename = "fixtures:conflicts")]
    FixturesConflicts { conflicts: Vec<String> },
    #[serde(rename = "fixtures:profiles")]
    FixturesProfiles { profiles: Vec<ProfileEntry> },
    #[serde(rename = "fixture:export-result")]
    ExportResult { document: FixtureExport },
    #[serde(rename = "fixture:import-result")]
    ImportResult {
        added: usize,
        skipped: usize,
        conflicts: Vec<String>,
    },
}

// ---------------------------------------------------------------------------
// Automation protocol (external controllers), TCP 9091
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerState {
    On,
    Off,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AutomationCommand {
    #[serde(rename_all = "camelCase")]
    RecallPreset {
        id: Uuid,
        #[serde(default)]
        fade_time: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Blackout {
        #[serde(default)]
        fade_time: Option<u64>,
    },
    SetChannel { channel: usize, value: f64 },
    MasterDimmer { value: f64 },
    #[serde(rename_all = "camelCase")]
    SetMode { fixture_id: Uuid, mode_name: String },
    Trigger {
        channel: usize,
        state: TriggerState,
    },
    GetState,
    ListPresets,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Ok,
    Error,
}

/// Response envelope; `action` always echoes the inbound action, or
/// `"unknown"` when the frame could not be parsed.
#[derive(Clone, Debug, Serialize)]
pub struct AutomationResponse {
    pub status: ResponseStatus,
    pub action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AutomationResponse {
    pub fn ok(action: &str) -> Self {
        Self {
            status: ResponseStatus::Ok,
            action: action.to_string(),
            data: None,
            message: None,
        }
    }

    pub fn ok_with(action: &str, data: serde_json::Value) -> Self {
        Self {
            status: ResponseStatus::Ok,
            action: action.to_string(),
            data: Some(data),
            message: None,
        }
    }

    pub fn err(action: &str, message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            action: action.to_string(),
            data: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AutomationEvent {
    DmxStatus { connected: bool },
    PresetActivated { id: Uuid, name: String },
    PresetsUpdated { presets: Vec<PresetSummary> },
}

/// The `action` field of an automation frame, for error echoing when the
/// typed parse fails.
pub fn frame_action(line: &str) -> String {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(String::from))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_commands_parse_from_tagged_json() {
        let cmd: LiveCommand =
            serde_json::from_str(r#"{"type":"dmx:set-channel","channel":10,"value":200}"#).unwrap();
        assert!(matches!(
            cmd,
            LiveCommand::SetChannel {
                channel: 10,
                value
            } if value == 200.0
        ));

        let cmd: LiveCommand =
            serde_json::from_str(r#"{"type":"dmx:blackout","fadeTime":500}"#).unwrap();
        assert!(matches!(
            cmd,
            LiveCommand::Blackout {
                fade_time: Some(500)
            }
        ));

        let cmd: LiveCommand = serde_json::from_str(
            r#"{"type":"fixture:create-from-profile","name":"Spot","profileId":"generic-moving-head","startAddress":10}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            LiveCommand::FixtureCreateFromProfile { start_address: 10, .. }
        ));
    }

    #[test]
    fn unknown_live_command_fails_to_parse() {
        assert!(serde_json::from_str::<LiveCommand>(r#"{"type":"dmx:warp","factor":9}"#).is_err());
    }

    #[test]
    fn live_events_carry_colon_namespaced_type() {
        let event = LiveEvent::DmxStatus {
            connected: true,
            port: Some("/dev/ttyUSB0".into()),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "dmx:status");
        assert_eq!(value["connected"], true);
        assert_eq!(value["port"], "/dev/ttyUSB0");
    }

    #[test]
    fn automation_commands_parse_with_snake_case_actions() {
        let cmd: AutomationCommand = serde_json::from_str(
            r#"{"action":"recall_preset","id":"6ec0bd7f-11c0-43da-975e-2a8ad9ebae0b","fadeTime":250}"#,
        )
        .unwrap();
        assert!(matches!(
            cmd,
            AutomationCommand::RecallPreset {
                fade_time: Some(250),
                ..
            }
        ));

        let cmd: AutomationCommand =
            serde_json::from_str(r#"{"action":"trigger","channel":4,"state":"on"}"#).unwrap();
        assert!(matches!(
            cmd,
            AutomationCommand::Trigger {
                channel: 4,
                state: TriggerState::On
            }
        ));

        let cmd: AutomationCommand = serde_json::from_str(r#"{"action":"get_state"}"#).unwrap();
        assert!(matches!(cmd, AutomationCommand::GetState));
    }

    #[test]
    fn missing_arguments_fail_the_typed_parse_but_keep_the_action() {
        let line = r#"{"action":"set_channel","channel":3}"#;
        assert!(serde_json::from_str::<AutomationCommand>(line).is_err());
        assert_eq!(frame_action(line), "set_channel");
        assert_eq!(frame_action("not json"), "unknown");
        assert_eq!(frame_action(r#"{"value":1}"#), "unknown");
    }

    #[test]
    fn response_envelope_skips_empty_fields() {
        let ok = serde_json::to_value(AutomationResponse::ok("blackout")).unwrap();
        assert_eq!(ok["status"], "ok");
        assert_eq!(ok["action"], "blackout");
        assert!(ok.get("data").is_none());
        assert!(ok.get("message").is_none());

        let err = serde_json::to_value(AutomationResponse::err("unknown", "no parse")).unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["message"], "no parse");
    }

    #[test]
    fn automation_events_tag_on_event_field() {
        let ev = serde_json::to_value(AutomationEvent::DmxStatus { connected: false }).unwrap();
        assert_eq!(ev["event"], "dmx_status");
        let ev = serde_json::to_value(AutomationEvent::PresetsUpdated {
            presets: Vec::new(),
        })
        .unwrap();
        assert_eq!(ev["event"], "presets_updated");
        assert!(ev["presets"].as_array().unwrap().is_empty());
    }
}
