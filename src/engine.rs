//! The engine task: single writer for all authoritative state.
//!
//! Every mutation from either server arrives as an [`EngineCommand`] on
//! one mpsc queue; commands that return data embed a oneshot responder.
//! The task also owns the 25 ms driver that advances fades and keeps the
//! serial thread's frame cell filled, so fade steps and serial frames
//! share one clock.
//!
//! Fan-out is split by shape: the coalescable channel state goes through
//! a `watch` (receivers only ever see the latest value, which is exactly
//! the throttling semantic the live server needs), discrete events go
//! through a `broadcast`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Duration, MissedTickBehavior};
use uuid::Uuid;

use crate::fade::FadeEngine;
use crate::fixtures::{
    CanvasLayout, ChannelBinding, ChannelWrite, ColorMode, Fixture, FixtureExport, FixturePatch,
    FixtureRegistry, ImportResult, ImportStrategy, RegistryError,
};
use crate::presets::{Preset, PresetError, PresetPatch, PresetStore, PresetSummary};
use crate::profiles::{ProfileEntry, ProfileLibrary};
use crate::store::{Store, StoreData};
use crate::transmitter::TxStatus;
use crate::universe::{Snapshot, Universe, DMX_CHANNELS};

pub const TICK_PERIOD: Duration = Duration::from_millis(25);

/// Raw channel state + master, as broadcast to live clients.
#[derive(Clone, PartialEq, Debug)]
pub struct DmxState {
    pub channels: Vec<u8>,
    pub master: u8,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Preset(#[from] PresetError),
}

/// Initial state pushed to a live client on connect.
#[derive(Clone, Debug)]
pub struct FullState {
    pub dmx: DmxState,
    pub status: TxStatus,
    pub presets: Vec<Preset>,
    pub fixtures: Vec<Fixture>,
    pub conflicts: Vec<String>,
    pub profiles: Vec<ProfileEntry>,
}

#[derive(Debug)]
pub enum EngineCommand {
    SetChannel {
        channel: usize,
        value: f64,
    },
    SetChannels {
        values: Vec<(usize, f64)>,
    },
    SetMaster {
        value: f64,
    },
    Blackout {
        fade_time: Option<u64>,
    },
    Trigger {
        channel: usize,
        on: bool,
    },
    RecallPreset {
        id: Uuid,
        fade_time: Option<u64>,
        respond: Option<oneshot::Sender<Result<(Uuid, String), EngineError>>>,
    },
    SavePreset {
        name: String,
        fade_time: u64,
        color: String,
    },
    UpdatePreset {
        id: Uuid,
        patch: PresetPatch,
    },
    DeletePreset {
        id: Uuid,
    },
    CreateFixture {
        name: String,
        kind: String,
        color_mode: ColorMode,
        channels: Vec<ChannelBinding>,
        layout: Option<CanvasLayout>,
    },
    UpdateFixture {
        id: Uuid,
        patch: FixturePatch,
    },
    DeleteFixture {
        id: Uuid,
    },
    CreateFixtureFromProfile {
        name: String,
        profile_id: String,
        start_address: usize,
        respond: Option<oneshot::Sender<Result<Uuid, EngineError>>>,
    },
    SetFixtureMode {
        fixture_id: Uuid,
        mode_name: String,
        respond: Option<oneshot::Sender<Result<(), EngineError>>>,
    },
    GetFullState {
        respond: oneshot::Sender<FullState>,
    },
    GetProfiles {
        respond: oneshot::Sender<Vec<ProfileEntry>>,
    },
    ListPresets {
        respond: oneshot::Sender<Vec<PresetSummary>>,
    },
    ExportFixtures {
        respond: oneshot::Sender<FixtureExport>,
    },
    ImportFixtures {
        document: FixtureExport,
        strategy: ImportStrategy,
        respond: oneshot::Sender<ImportResult>,
    },
}

/// Discrete engine events, bridged to both servers.
#[derive(Clone, Debug)]
pub enum EngineEvent {
    TransmitterStatus {
        connected: bool,
        port: Option<String>,
    },
    PresetActivated {
        id: Uuid,
        name: String,
    },
    PresetsChanged {
        presets: Vec<Preset>,
    },
    FixturesChanged {
        fixtures: Vec<Fixture>,
        conflicts: Vec<String>,
    },
}

/// Everything a server needs to talk to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    pub commands: mpsc::Sender<EngineCommand>,
    pub events: broadcast::Sender<EngineEvent>,
    pub dmx: watch::Receiver<DmxState>,
}

impl EngineHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

pub struct Engine {
    universe: Universe,
    fades: FadeEngine,
    registry: FixtureRegistry,
    presets: PresetStore,
    profiles: ProfileLibrary,
    store: Store,
    events: broadcast::Sender<EngineEvent>,
    dmx_tx: watch::Sender<DmxState>,
    dirty: Arc<AtomicBool>,
    last_status: TxStatus,
}

impl Engine {
    /// Assemble the engine around previously loaded state. Returns the
    /// engine, the handle for servers, and the frame cell the transmitter
    /// samples.
    pub fn new(
        profiles: ProfileLibrary,
        store: Store,
        data: StoreData,
    ) -> (Self, EngineHandle, mpsc::Receiver<EngineCommand>, Arc<Mutex<Snapshot>>) {
        let mut universe = Universe::new();
        let frame_cell = Arc::new(Mutex::new(universe.effective()));
        let dirty = Arc::new(AtomicBool::new(false));

        // The universe's one listener keeps the serial cell current and
        // flags the watch publish; the engine flushes after each command.
        let cell = frame_cell.clone();
        let dirty_flag = dirty.clone();
        universe.subscribe(Box::new(move |effective| {
            *cell.lock() = *effective;
            dirty_flag.store(true, Ordering::Release);
        }));

        let (events, _) = broadcast::channel(64);
        let (dmx_tx, dmx_rx) = watch::channel(DmxState {
            channels: universe.raw().to_vec(),
            master: universe.master(),
        });
        let (command_tx, command_rx) = mpsc::channel(256);

        let engine = Self {
            universe,
            fades: FadeEngine::new(),
            registry: FixtureRegistry::from_stored(data.fixtures),
            presets: PresetStore::from_stored(data.presets),
            profiles,
            store,
            events: events.clone(),
            dmx_tx,
            dirty,
            last_status: TxStatus {
                connected: false,
                port: None,
            },
        };
        let handle = EngineHandle {
            commands: command_tx,
            events,
            dmx: dmx_rx,
        };
        (engine, handle, command_rx, frame_cell)
    }

    /// Run until the command channel closes. `status_rx` carries
    /// transmitter transitions from the serial thread.
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<EngineCommand>,
        mut status_rx: mpsc::UnboundedReceiver<TxStatus>,
    ) {
        let mut ticker = tokio::time::interval(TICK_PERIOD);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => {
                        self.handle_command(cmd);
                        self.flush_dmx();
                    }
                    None => break,
                },
                status = status_rx.recv() => {
                    if let Some(status) = status {
                        self.last_status = status.clone();
                        let _ = self.events.send(EngineEvent::TransmitterStatus {
                            connected: status.connected,
                            port: status.port,
                        });
                    }
                },
                _ = ticker.tick() => {
                    self.fades.tick(&mut self.universe, tokio::time::Instant::now());
                    self.flush_dmx();
                },
            }
        }
        log::info!("engine stopped");
    }

    fn flush_dmx(&mut self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            let _ = self.dmx_tx.send(DmxState {
                channels: self.universe.raw().to_vec(),
                master: self.universe.master(),
            });
        }
    }

    fn persist(&mut self) {
        let data = StoreData {
            fixtures: self.registry.list().to_vec(),
            presets: self.presets.list().to_vec(),
        };
        if let Err(e) = self.store.save(&data) {
            log::error!("failed to persist store: {e}");
        }
    }

    fn emit_presets(&mut self) {
        let _ = self.events.send(EngineEvent::PresetsChanged {
            presets: self.presets.list().to_vec(),
        });
    }

    fn emit_fixtures(&mut self) {
        self.refresh_fixtures();
        let _ = self.events.send(EngineEvent::FixturesChanged {
            fixtures: self.registry.list().to_vec(),
            conflicts: self.registry.validate_channel_conflicts(),
        });
    }

    /// Bundled profiles are authoritative; re-sync stored copies whenever
    /// fixtures are about to be read.
    fn refresh_fixtures(&mut self) {
        if self.registry.refresh_profiles(&self.profiles) {
            self.persist();
        }
    }

    fn apply_writes(&mut self, writes: &[ChannelWrite]) {
        if writes.is_empty() {
            return;
        }
        self.universe
            .set_channels(writes.iter().map(|w| (w.channel, w.value as f64)));
    }

    fn recall_preset(
        &mut self,
        id: Uuid,
        fade_override: Option<u64>,
    ) -> Result<(Uuid, String), EngineError> {
        let preset = self
            .presets
            .get(id)
            .ok_or(PresetError::UnknownPreset(id))?
            .clone();

        let fade_time = fade_override.unwrap_or(preset.fade_time);
        if fade_time > 0 {
            let mut target = [0u8; DMX_CHANNELS];
            target.copy_from_slice(&preset.channels);
            let _ = self.fades.fade_to(&mut self.universe, target, fade_time);
        } else {
            self.fades.cancel();
            self.universe.apply_snapshot(&preset.channels);
        }

        let mut modes_changed = false;
        for (fixture_id, mode_name) in &preset.fixture_modes {
            match self.registry.set_active_mode(*fixture_id, mode_name) {
                Ok(writes) => {
                    self.apply_writes(&writes);
                    modes_changed = true;
                }
                Err(e) => {
                    log::warn!("preset '{}': mode restore on {fixture_id} failed: {e}", preset.name)
                }
            }
        }
        if modes_changed {
            self.persist();
            self.emit_fixtures();
        }

        let _ = self.events.send(EngineEvent::PresetActivated {
            id: preset.id,
            name: preset.name.clone(),
        });
        Ok((preset.id, preset.name))
    }

    fn set_fixture_mode(&mut self, fixture_id: Uuid, mode_name: &str) -> Result<(), EngineError> {
        let writes = self.registry.set_active_mode(fixture_id, mode_name)?;
        self.apply_writes(&writes);
        // Hygiene pass: dynamic channels with nothing driving them in the
        // new mode drop to zero.
        let cleanup = self.registry.mode_cleanup_channels(fixture_id, mode_name)?;
        if !cleanup.is_empty() {
            self.universe
                .set_channels(cleanup.into_iter().map(|ch| (ch, 0.0)));
        }
        self.persist();
        self.emit_fixtures();
        Ok(())
    }

    fn active_fixture_modes(&self) -> BTreeMap<Uuid, String> {
        self.registry
            .list()
            .iter()
            .filter_map(|f| f.active_mode.clone().map(|m| (f.id, m)))
            .collect()
    }

    fn full_state(&mut self) -> FullState {
        self.refresh_fixtures();
        FullState {
            dmx: DmxState {
                channels: self.universe.raw().to_vec(),
                master: self.universe.master(),
            },
            status: self.last_status.clone(),
            presets: self.presets.list().to_vec(),
            fixtures: self.registry.list().to_vec(),
            conflicts: self.registry.validate_channel_conflicts(),
            profiles: self.profiles.list(),
        }
    }

    fn handle_command(&mut self, cmd: EngineCommand) {
        match cmd {
            EngineCommand::SetChannel { channel, value } => {
                self.universe.set_channel(channel, value);
            }
            EngineCommand::SetChannels { values } => {
                self.universe.set_channels(values);
            }
            EngineCommand::SetMaster { value } => {
                self.universe.set_master(value);
            }
            EngineCommand::Blackout { fade_time } => match fade_time {
                Some(ms) if ms > 0 => {
                    let _ = self.fades.fade_to_blackout(&mut self.universe, ms);
                }
                _ => {
                    self.fades.cancel();
                    self.universe.blackout();
                }
            },
            EngineCommand::Trigger { channel, on } => {
                self.universe
                    .set_channel(channel, if on { 255.0 } else { 0.0 });
            }
            EngineCommand::RecallPreset {
                id,
                fade_time,
                respond,
            } => {
                let result = self.recall_preset(id, fade_time);
                if let Err(e) = &result {
                    log::warn!("preset recall failed: {e}");
                }
                if let Some(respond) = respond {
                    let _ = respond.send(result);
                }
            }
            EngineCommand::SavePreset {
                name,
                fade_time,
                color,
            } => {
                let modes = self.active_fixture_modes();
                self.presets
                    .capture(name, &self.universe, fade_time, color, modes);
                self.persist();
                self.emit_presets();
            }
            EngineCommand::UpdatePreset { id, patch } => {
                let result = self.presets.update(id, patch).map(|_| ());
                match result {
                    Ok(()) => {
                        self.persist();
                        self.emit_presets();
                    }
                    Err(e) => log::warn!("preset update failed: {e}"),
                }
            }
            EngineCommand::DeletePreset { id } => {
                if self.presets.delete(id) {
                    self.persist();
                    self.emit_presets();
                } else {
                    log::warn!("preset delete: unknown preset {id}");
                }
            }
            EngineCommand::CreateFixture {
                name,
                kind,
                color_mode,
                channels,
                layout,
            } => {
                let result = self
                    .registry
                    .create(name, kind, color_mode, channels, layout)
                    .map(|_| ());
                match result {
                    Ok(()) => {
                        self.persist();
                        self.emit_fixtures();
                    }
                    Err(e) => log::warn!("fixture create failed: {e}"),
                }
            }
            EngineCommand::UpdateFixture { id, patch } => {
                let result = self.registry.update(id, patch).map(|_| ());
                match result {
                    Ok(()) => {
                        self.persist();
                        self.emit_fixtures();
                    }
                    Err(e) => log::warn!("fixture update failed: {e}"),
                }
            }
            EngineCommand::DeleteFixture { id } => {
                // Channels the fixture was driving are left as-is.
                if self.registry.delete(id) {
                    self.persist();
                    self.emit_fixtures();
                } else {
                    log::warn!("fixture delete: unknown fixture {id}");
                }
            }
            EngineCommand::CreateFixtureFromProfile {
                name,
                profile_id,
                start_address,
                respond,
            } => {
                let result = self
                    .registry
                    .create_from_profile(name, &profile_id, start_address, &self.profiles)
                    .map(|f| (f.id, f.active_mode.clone()))
                    .map_err(EngineError::from);
                let result = match result {
                    Ok((id, active_mode)) => {
                        // A profile with a mode channel asserts its default
                        // mode on the bus right away.
                        if let Some(mode) = active_mode {
                            let has_mode_channel = self
                                .registry
                                .get(id)
                                .and_then(|f| f.profile.as_ref())
                                .map(|p| p.mode_channel.is_some())
                                .unwrap_or(false);
                            if has_mode_channel {
                                match self.registry.set_active_mode(id, &mode) {
                                    Ok(writes) => self.apply_writes(&writes),
                                    Err(e) => log::warn!("default mode apply failed: {e}"),
                                }
                            }
                        }
                        self.persist();
                        self.emit_fixtures();
                        Ok(id)
                    }
                    Err(e) => {
                        log::warn!("fixture create-from-profile failed: {e}");
                        Err(e)
                    }
                };
                if let Some(respond) = respond {
                    let _ = respond.send(result);
                }
            }
            EngineCommand::SetFixtureMode {
                fixture_id,
                mode_name,
                respond,
            } => {
                let result = self.set_fixture_mode(fixture_id, &mode_name);
                if let Err(e) = &result {
                    log::warn!("set mode failed: {e}");
                }
                if let Some(respond) = respond {
                    let _ = respond.send(result);
                }
            }
            EngineCommand::GetFullState { respond } => {
                let state = self.full_state();
                let _ = respond.send(state);
            }
            EngineCommand::GetProfiles { respond } => {
                let _ = respond.send(self.profiles.list());
            }
            EngineCommand::ListPresets { respond } => {
                let _ = respond.send(self.presets.summaries());
            }
            EngineCommand::ExportFixtures { respond } => {
                self.refresh_fixtures();
                let _ = respond.send(self.registry.export());
            }
            EngineCommand::ImportFixtures {
                document,
                strategy,
                respond,
            } => {
                let result = self.registry.import(document, strategy);
                self.persist();
                self.emit_fixtures();
                let _ = respond.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::builtin_profiles;

    struct TestRig {
        engine: Engine,
        handle: EngineHandle,
        cell: Arc<Mutex<Snapshot>>,
        _dir: tempfile::TempDir,
    }

    fn engine_with(profiles: ProfileLibrary) -> TestRig {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("store.json"));
        let (engine, handle, _rx, cell) = Engine::new(profiles, store, StoreData::default());
        TestRig {
            engine,
            handle,
            cell,
            _dir: dir,
        }
    }

    fn test_engine() -> TestRig {
        engine_with(ProfileLibrary::from_profiles(builtin_profiles()))
    }

    fn moving_head(engine: &mut Engine) -> Uuid {
        let (tx, mut rx) = oneshot::channel();
        engine.handle_command(EngineCommand::CreateFixtureFromProfile {
            name: "Head".into(),
            profile_id: "generic-moving-head".into(),
            start_address: 10,
            respond: Some(tx),
        });
        rx.try_recv().unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn channel_write_updates_watch_and_frame_cell() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        let handle = &rig.handle;
        engine.handle_command(EngineCommand::SetChannel {
            channel: 10,
            value: 200.0,
        });
        engine.flush_dmx();

        let state = handle.dmx.borrow().clone();
        assert_eq!(state.channels[9], 200);
        assert_eq!(state.master, 255);
        assert_eq!(rig.cell.lock()[9], 200);
    }

    #[tokio::test(start_paused = true)]
    async fn master_scales_frame_cell_but_not_watch_channels() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        let handle = &rig.handle;
        engine.handle_command(EngineCommand::SetChannel {
            channel: 1,
            value: 200.0,
        });
        engine.handle_command(EngineCommand::SetMaster { value: 128.0 });
        engine.flush_dmx();

        assert_eq!(handle.dmx.borrow().channels[0], 200, "watch carries raw");
        assert_eq!(handle.dmx.borrow().master, 128);
        assert_eq!(rig.cell.lock()[0], 100, "cell carries effective");
    }

    #[tokio::test(start_paused = true)]
    async fn default_mode_asserted_on_profile_creation() {
        let mut profiles = builtin_profiles();
        for (_, profile) in profiles.iter_mut() {
            if profile.fixture == "Generic Moving Head" {
                profile.modes[0].channel_value = 40;
            }
        }
        let mut rig = engine_with(ProfileLibrary::from_profiles(profiles));
        let engine = &mut rig.engine;

        let id = moving_head(engine);
        assert_eq!(
            engine.registry.get(id).unwrap().active_mode.as_deref(),
            Some("Wash")
        );
        // Mode channel is the second sorted key -> DMX 11.
        assert_eq!(engine.universe.raw()[10], 40);
    }

    #[tokio::test(start_paused = true)]
    async fn set_mode_applies_writes_and_hygiene() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        let id = moving_head(engine);

        // Park stale values on two dynamic channels: ch05/DMX 14 keeps a
        // stepped control in Effects, ch06/DMX 15 has no control there.
        engine.handle_command(EngineCommand::SetChannel {
            channel: 14,
            value: 50.0,
        });
        engine.handle_command(EngineCommand::SetChannel {
            channel: 15,
            value: 99.0,
        });

        let (tx, mut rx) = oneshot::channel();
        engine.handle_command(EngineCommand::SetFixtureMode {
            fixture_id: id,
            mode_name: "Effects".into(),
            respond: Some(tx),
        });
        rx.try_recv().unwrap().unwrap();

        let raw = engine.universe.raw();
        assert_eq!(raw[10], 64, "mode select at channelValue");
        assert_eq!(raw[16], 127, "default asserted (ch08 -> DMX 17)");
        assert_eq!(raw[13], 50, "controlled dynamic ch05 untouched");
        assert_eq!(raw[14], 0, "uncontrolled dynamic ch06 zeroed");
    }

    #[tokio::test(start_paused = true)]
    async fn preset_recall_restores_channels_and_modes() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        let handle = &rig.handle;
        let id = moving_head(engine);
        let mut events = handle.subscribe();

        // Shape a look in mode Effects, capture it.
        let (tx, mut rx) = oneshot::channel();
        engine.handle_command(EngineCommand::SetFixtureMode {
            fixture_id: id,
            mode_name: "Effects".into(),
            respond: Some(tx),
        });
        rx.try_recv().unwrap().unwrap();
        engine.handle_command(EngineCommand::SetChannel {
            channel: 1,
            value: 180.0,
        });
        engine.handle_command(EngineCommand::SavePreset {
            name: "Look".into(),
            fade_time: 0,
            color: "#f00".into(),
        });
        let preset_id = engine.presets.list()[0].id;
        assert_eq!(
            engine.presets.list()[0].fixture_modes.get(&id).unwrap(),
            "Effects"
        );

        // Disturb everything.
        let (tx, mut rx) = oneshot::channel();
        engine.handle_command(EngineCommand::SetFixtureMode {
            fixture_id: id,
            mode_name: "Wash".into(),
            respond: Some(tx),
        });
        rx.try_recv().unwrap().unwrap();
        engine.handle_command(EngineCommand::Blackout { fade_time: None });

        // Instant recall restores the look and the mode.
        let (tx, mut rx) = oneshot::channel();
        engine.handle_command(EngineCommand::RecallPreset {
            id: preset_id,
            fade_time: Some(0),
            respond: Some(tx),
        });
        rx.try_recv().unwrap().unwrap();

        let raw = engine.universe.raw();
        assert_eq!(raw[0], 180);
        assert_eq!(raw[10], 64, "mode select re-asserted");
        assert_eq!(raw[16], 127, "mode default re-asserted");
        assert_eq!(
            engine.registry.get(id).unwrap().active_mode.as_deref(),
            Some("Effects")
        );

        // A preset_activated event reached the bus.
        let mut saw_activation = false;
        while let Ok(event) = events.try_recv() {
            if matches!(&event, EngineEvent::PresetActivated { name, .. } if name == "Look") {
                saw_activation = true;
            }
        }
        assert!(saw_activation);
    }

    #[tokio::test(start_paused = true)]
    async fn recall_with_unknown_preset_fails() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        let (tx, mut rx) = oneshot::channel();
        engine.handle_command(EngineCommand::RecallPreset {
            id: Uuid::new_v4(),
            fade_time: None,
            respond: Some(tx),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(EngineError::Preset(PresetError::UnknownPreset(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn recall_with_fade_runs_on_engine_ticks() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        let mut channels = vec![0u8; DMX_CHANNELS];
        channels[0] = 200;
        let preset_id = engine
            .presets
            .create("fade".into(), channels, 100, "#fff".into(), BTreeMap::new())
            .id;

        engine.handle_command(EngineCommand::RecallPreset {
            id: preset_id,
            fade_time: None,
            respond: None,
        });
        assert_eq!(engine.universe.raw()[0], 0, "fade has not ticked yet");

        for _ in 0..4 {
            tokio::time::advance(TICK_PERIOD).await;
            engine
                .fades
                .tick(&mut engine.universe, tokio::time::Instant::now());
        }
        assert_eq!(engine.universe.raw()[0], 200);
    }

    #[tokio::test(start_paused = true)]
    async fn instant_blackout_cancels_active_fade() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        let mut channels = vec![0u8; DMX_CHANNELS];
        channels[0] = 200;
        let preset_id = engine
            .presets
            .create("fade".into(), channels, 10_000, "#fff".into(), BTreeMap::new())
            .id;
        engine.handle_command(EngineCommand::RecallPreset {
            id: preset_id,
            fade_time: None,
            respond: None,
        });
        assert!(engine.fades.is_active());

        engine.handle_command(EngineCommand::Blackout { fade_time: None });
        assert!(!engine.fades.is_active());
        assert!(engine.universe.raw().iter().all(|&c| c == 0));
    }

    #[tokio::test(start_paused = true)]
    async fn trigger_writes_full_and_zero() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        engine.handle_command(EngineCommand::Trigger {
            channel: 7,
            on: true,
        });
        assert_eq!(engine.universe.raw()[6], 255);
        engine.handle_command(EngineCommand::Trigger {
            channel: 7,
            on: false,
        });
        assert_eq!(engine.universe.raw()[6], 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_state_reflects_store_and_profiles() {
        let mut rig = test_engine();
        let engine = &mut rig.engine;
        moving_head(engine);
        let (tx, mut rx) = oneshot::channel();
        engine.handle_command(EngineCommand::GetFullState { respond: tx });
        let state = rx.try_recv().unwrap();
        assert_eq!(state.fixtures.len(), 1);
        assert!(!state.profiles.is_empty());
        assert!(!state.status.connected);
        assert_eq!(state.dmx.channels.len(), DMX_CHANNELS);
    }
}
