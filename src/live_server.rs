//! The live-client server: full-duplex newline-delimited JSON over TCP
//! for rich UIs.
//!
//! Each client gets the full state on connect, then deltas. Channel-state
//! traffic is coalesced: the engine's watch channel always holds the
//! latest `DmxState`, and a ~33 ms ticker forwards it only when it
//! changed, so a burst of mutations costs one broadcast per tick and the
//! final state is never lost. Status and discrete events bypass the
//! throttle.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::{Duration, MissedTickBehavior};

use crate::engine::{DmxState, EngineCommand, EngineEvent, EngineHandle};
use crate::protocol::{LiveCommand, LiveEvent};

const THROTTLE_PERIOD: Duration = Duration::from_millis(33);

pub async fn run(
    listener: TcpListener,
    handle: EngineHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::info!("live client connected from {peer}");
                    let handle = handle.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_client(stream, peer, handle, shutdown).await;
                        log::info!("live client {peer} disconnected");
                    });
                }
                Err(e) => log::warn!("live accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    log::info!("live-client server stopped");
}

async fn handle_client(
    stream: TcpStream,
    peer: SocketAddr,
    handle: EngineHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut events = handle.subscribe();
    let mut dmx = handle.dmx.clone();

    if send_initial_state(&handle, &mut writer).await.is_err() {
        return;
    }
    // The initial snapshot already covered the current channel state.
    dmx.borrow_and_update();

    let mut throttle = tokio::time::interval(THROTTLE_PERIOD);
    throttle.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    dispatch_line(&line, peer, &handle, &mut writer).await;
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("live client {peer} read error: {e}");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if forward_event(event, &mut writer).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("live client {peer} lagged {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = throttle.tick() => {
                if dmx.has_changed().unwrap_or(false) {
                    let state = dmx.borrow_and_update().clone();
                    if send_dmx_state(state, &mut writer).await.is_err() {
                        break;
                    }
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn send_initial_state(
    handle: &EngineHandle,
    writer: &mut OwnedWriteHalf,
) -> std::io::Result<()> {
    let (tx, rx) = oneshot::channel();
    if handle
        .commands
        .send(EngineCommand::GetFullState { respond: tx })
        .await
        .is_err()
    {
        return Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "engine gone",
        ));
    }
    let Ok(state) = rx.await else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "engine gone",
        ));
    };

    send_event(
        writer,
        &LiveEvent::DmxState {
            channels: state.dmx.channels,
            master: state.dmx.master,
        },
    )
    .await?;
    send_event(
        writer,
        &LiveEvent::DmxStatus {
            connected: state.status.connected,
            port: state.status.port,
        },
    )
    .await?;
    send_event(writer, &LiveEvent::PresetsList { presets: state.presets }).await?;
    send_event(
        writer,
        &LiveEvent::FixturesList {
            fixtures: state.fixtures,
        },
    )
    .await?;
    send_event(
        writer,
        &LiveEvent::FixturesProfiles {
            profiles: state.profiles,
        },
    )
    .await?;
    if !state.conflicts.is_empty() {
        send_event(
            writer,
            &LiveEvent::FixturesConflicts {
                conflicts: state.conflicts,
            },
        )
        .await?;
    }
    Ok(())
}

async fn send_event(writer: &mut OwnedWriteHalf, event: &LiveEvent) -> std::io::Result<()> {
    let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

async fn send_dmx_state(state: DmxState, writer: &mut OwnedWriteHalf) -> std::io::Result<()> {
    send_event(
        writer,
        &LiveEvent::DmxState {
            channels: state.channels,
            master: state.master,
        },
    )
    .await
}

async fn forward_event(event: EngineEvent, writer: &mut OwnedWriteHalf) -> std::io::Result<()> {
    match event {
        EngineEvent::TransmitterStatus { connected, port } => {
            send_event(writer, &LiveEvent::DmxStatus { connected, port }).await
        }
        EngineEvent::PresetActivated { id, name } => {
            send_event(writer, &LiveEvent::PresetActivated { id, name }).await
        }
        EngineEvent::PresetsChanged { presets } => {
            send_event(writer, &LiveEvent::PresetsList { presets }).await
        }
        EngineEvent::FixturesChanged {
            fixtures,
            conflicts,
        } => {
            send_event(writer, &LiveEvent::FixturesList { fixtures }).await?;
            if !conflicts.is_empty() {
                send_event(writer, &LiveEvent::FixturesConflicts { conflicts }).await?;
            }
            Ok(())
        }
    }
}

/// Parse and execute one inbound line. Unknown commands and handler
/// failures are logged; the client stays connected either way.
async fn dispatch_line(
    line: &str,
    peer: SocketAddr,
    handle: &EngineHandle,
    writer: &mut OwnedWriteHalf,
) {
    let command = match serde_json::from_str::<LiveCommand>(line) {
        Ok(command) => command,
        Err(e) => {
            log::warn!("live client {peer}: unknown command ignored ({e})");
            return;
        }
    };

    let sent = match command {
        LiveCommand::SetChannel { channel, value } => {
            handle
                .commands
                .send(EngineCommand::SetChannel { channel, value })
                .await
        }
        LiveCommand::SetChannels { values } => {
            let values = values
                .into_iter()
                .filter_map(|(key, value)| match key.parse::<usize>() {
                    Ok(channel) => Some((channel, value)),
                    Err(_) => {
                        log::warn!("live client {peer}: non-numeric channel key '{key}'");
                        None
                    }
                })
                .collect();
            handle
                .commands
                .send(EngineCommand::SetChannels { values })
                .await
        }
        LiveCommand::Master { value } => {
            handle
                .commands
                .send(EngineCommand::SetMaster { value })
                .await
        }
        LiveCommand::Blackout { fade_time } => {
            handle
                .commands
                .send(EngineCommand::Blackout { fade_time })
                .await
        }
        LiveCommand::PresetRecall { id, fade_time } => {
            handle
                .commands
                .send(EngineCommand::RecallPreset {
                    id,
                    fade_time,
                    respond: None,
                })
                .await
        }
        LiveCommand::PresetSave {
            name,
            fade_time,
            color,
        } => {
            handle
                .commands
                .send(EngineCommand::SavePreset {
                    name,
                    fade_time,
                    color,
                })
                .await
        }
        LiveCommand::PresetUpdate {
            id,
            name,
            channels,
            fade_time,
            color,
        } => {
            handle
                .commands
                .send(EngineCommand::UpdatePreset {
                    id,
                    patch: crate::presets::PresetPatch {
                        name,
                        channels,
                        fade_time,
                        color,
                        fixture_modes: None,
                    },
                })
                .await
        }
        LiveCommand::PresetDelete { id } => {
            handle.commands.send(EngineCommand::DeletePreset { id }).await
        }
        LiveCommand::FixtureCreate {
            name,
            kind,
            color_mode,
            channels,
            layout,
        } => {
            handle
                .commands
                .send(EngineCommand::CreateFixture {
                    name,
                    kind,
                    color_mode,
                    channels,
                    layout,
                })
                .await
        }
        LiveCommand::FixtureUpdate {
            id,
            name,
            kind,
            color_mode,
            channels,
            layout,
        } => {
            handle
                .commands
                .send(EngineCommand::UpdateFixture {
                    id,
                    patch: crate::fixtures::FixturePatch {
                        name,
                        kind,
                        color_mode,
                        channels,
                        layout,
                    },
                })
                .await
        }
        LiveCommand::FixtureDelete { id } => {
            handle
                .commands
                .send(EngineCommand::DeleteFixture { id })
                .await
        }
        LiveCommand::FixtureCreateFromProfile {
            name,
            profile_id,
            start_address,
        } => {
            handle
                .commands
                .send(EngineCommand::CreateFixtureFromProfile {
                    name,
                    profile_id,
                    start_address,
                    respond: None,
                })
                .await
        }
        LiveCommand::FixtureSetMode {
            fixture_id,
            mode_name,
        } => {
            handle
                .commands
                .send(EngineCommand::SetFixtureMode {
                    fixture_id,
                    mode_name,
                    respond: None,
                })
                .await
        }
        LiveCommand::TriggerStart { channel } => {
            handle
                .commands
                .send(EngineCommand::Trigger { channel, on: true })
                .await
        }
        LiveCommand::TriggerEnd { channel } => {
            handle
                .commands
                .send(EngineCommand::Trigger {
                    channel,
                    on: false,
                })
                .await
        }
        LiveCommand::GetProfiles => {
            let (tx, rx) = oneshot::channel();
            let sent = handle
                .commands
                .send(EngineCommand::GetProfiles { respond: tx })
                .await;
            if sent.is_ok() {
                if let Ok(profiles) = rx.await {
                    let _ = send_event(writer, &LiveEvent::FixturesProfiles { profiles }).await;
                }
            }
            sent
        }
        LiveCommand::Export => {
            let (tx, rx) = oneshot::channel();
            let sent = handle
                .commands
                .send(EngineCommand::ExportFixtures { respond: tx })
                .await;
            if sent.is_ok() {
                if let Ok(document) = rx.await {
                    let _ = send_event(writer, &LiveEvent::ExportResult { document }).await;
                }
            }
            sent
        }
        LiveCommand::Import { document, strategy } => {
            let (tx, rx) = oneshot::channel();
            let sent = handle
                .commands
                .send(EngineCommand::ImportFixtures {
                    document,
                    strategy,
                    respond: tx,
                })
                .await;
            if sent.is_ok() {
                if let Ok(result) = rx.await {
                    let _ = send_event(
                        writer,
                        &LiveEvent::ImportResult {
                            added: result.added,
                            skipped: result.skipped,
                            conflicts: result.conflicts,
                        },
                    )
                    .await;
                }
            }
            sent
        }
    };

    if sent.is_err() {
        log::error!("engine command queue closed");
    }
}
