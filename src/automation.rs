//! The automation server: a request/response JSON command channel for
//! external show controllers, plus unsolicited broadcast events.
//!
//! One JSON object per line. Every inbound frame gets a response whose
//! `action` echoes the request (or `"unknown"` when the frame does not
//! parse); transmitter status transitions, preset activations, and preset
//! list changes are pushed to every connected peer unprompted.

use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, watch};

use crate::engine::{EngineCommand, EngineEvent, EngineHandle};
use crate::presets::PresetSummary;
use crate::protocol::{frame_action, AutomationCommand, AutomationEvent, AutomationResponse, TriggerState};

pub async fn run(
    listener: TcpListener,
    handle: EngineHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    log::info!("automation client connected from {peer}");
                    let handle = handle.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        handle_client(stream, peer, handle, shutdown).await;
                        log::info!("automation client {peer} disconnected");
                    });
                }
                Err(e) => log::warn!("automation accept failed: {e}"),
            },
            _ = shutdown.changed() => break,
        }
    }
    log::info!("automation server stopped");
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

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = execute(&line, &handle).await;
                    if write_json(&mut writer, &response).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    log::debug!("automation client {peer} read error: {e}");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(event) = automation_event(event) {
                        if write_json(&mut writer, &event).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("automation client {peer} lagged {n} events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown.changed() => break,
        }
    }
}

async fn write_json<T: serde::Serialize>(
    writer: &mut OwnedWriteHalf,
    value: &T,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(value).map_err(std::io::Error::other)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await
}

fn automation_event(event: EngineEvent) -> Option<AutomationEvent> {
    match event {
        EngineEvent::TransmitterStatus { connected, .. } => {
            Some(AutomationEvent::DmxStatus { connected })
        }
        EngineEvent::PresetActivated { id, name } => {
            Some(AutomationEvent::PresetActivated { id, name })
        }
        EngineEvent::PresetsChanged { presets } => Some(AutomationEvent::PresetsUpdated {
            presets: presets.iter().map(PresetSummary::from).collect(),
        }),
        EngineEvent::FixturesChanged { .. } => None,
    }
}

async fn execute(line: &str, handle: &EngineHandle) -> AutomationResponse {
    let action = frame_action(line);
    let command = match serde_json::from_str::<AutomationCommand>(line) {
        Ok(command) => command,
        Err(e) => {
            log::warn!("automation frame rejected: {e}");
            return AutomationResponse::err(&action, format!("invalid {action} command: {e}"));
        }
    };

    match command {
        AutomationCommand::RecallPreset { id, fade_time } => {
            let (tx, rx) = oneshot::channel();
            let sent = handle
                .commands
                .send(EngineCommand::RecallPreset {
                    id,
                    fade_time,
                    respond: Some(tx),
                })
                .await;
            if sent.is_err() {
                return AutomationResponse::err(&action, "engine unavailable");
            }
            match rx.await {
                Ok(Ok((id, name))) => AutomationResponse::ok_with(
                    &action,
                    serde_json::json!({ "id": id, "name": name }),
                ),
                Ok(Err(e)) => AutomationResponse::err(&action, e.to_string()),
                Err(_) => AutomationResponse::err(&action, "engine unavailable"),
            }
        }
        AutomationCommand::Blackout { fade_time } => {
            match handle
                .commands
                .send(EngineCommand::Blackout { fade_time })
                .await
            {
                Ok(()) => AutomationResponse::ok(&action),
                Err(_) => AutomationResponse::err(&action, "engine unavailable"),
            }
        }
        AutomationCommand::SetChannel { channel, value } => {
            match handle
                .commands
                .send(EngineCommand::SetChannel { channel, value })
                .await
            {
                Ok(()) => AutomationResponse::ok(&action),
                Err(_) => AutomationResponse::err(&action, "engine unavailable"),
            }
        }
        AutomationCommand::MasterDimmer { value } => {
            match handle
                .commands
                .send(EngineCommand::SetMaster { value })
                .await
            {
                Ok(()) => AutomationResponse::ok(&action),
                Err(_) => AutomationResponse::err(&action, "engine unavailable"),
            }
        }
        AutomationCommand::SetMode {
            fixture_id,
            mode_name,
        } => {
            let (tx, rx) = oneshot::channel();
            let sent = handle
                .commands
                .send(EngineCommand::SetFixtureMode {
                    fixture_id,
                    mode_name,
                    respond: Some(tx),
                })
                .await;
            if sent.is_err() {
                return AutomationResponse::err(&action, "engine unavailable");
            }
            match rx.await {
                Ok(Ok(())) => AutomationResponse::ok(&action),
                Ok(Err(e)) => AutomationResponse::err(&action, e.to_string()),
                Err(_) => AutomationResponse::err(&action, "engine unavailable"),
            }
        }
        AutomationCommand::Trigger { channel, state } => {
            match handle
                .commands
                .send(EngineCommand::Trigger {
                    channel,
                    on: state == TriggerState::On,
                })
                .await
            {
                Ok(()) => AutomationResponse::ok(&action),
                Err(_) => AutomationResponse::err(&action, "engine unavailable"),
            }
        }
        AutomationCommand::GetState => {
            let (tx, rx) = oneshot::channel();
            let sent = handle
                .commands
                .send(EngineCommand::GetFullState { respond: tx })
                .await;
            if sent.is_err() {
                return AutomationResponse::err(&action, "engine unavailable");
            }
            match rx.await {
                Ok(state) => AutomationResponse::ok_with(
                    &action,
                    serde_json::json!({
                        "channels": state.dmx.channels,
                        "master": state.dmx.master,
                        "connected": state.status.connected,
                        "port": state.status.port,
                    }),
                ),
                Err(_) => AutomationResponse::err(&action, "engine unavailable"),
            }
        }
        AutomationCommand::ListPresets => {
            let (tx, rx) = oneshot::channel();
            let sent = handle
                .commands
                .send(EngineCommand::ListPresets { respond: tx })
                .await;
            if sent.is_err() {
                return AutomationResponse::err(&action, "engine unavailable");
            }
            match rx.await {
                Ok(presets) => match serde_json::to_value(presets) {
                    Ok(data) => AutomationResponse::ok_with(&action, data),
                    Err(e) => AutomationResponse::err(&action, e.to_string()),
                },
                Err(_) => AutomationResponse::err(&action, "engine unavailable"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Engine;
    use crate::profiles::{builtin_profiles, ProfileLibrary};
    use crate::store::{Store, StoreData};
    use tokio::io::Lines;
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::sync::mpsc::UnboundedSender;
    use tokio::time::Duration;

    struct TestClient {
        lines: Lines<BufReader<OwnedReadHalf>>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (read_half, writer) = stream.into_split();
            Self {
                lines: BufReader::new(read_half).lines(),
                writer,
            }
        }

        async fn send(&mut self, line: &str) {
            self.writer
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        async fn recv(&mut self) -> serde_json::Value {
            let line = tokio::time::timeout(Duration::from_secs(5), self.lines.next_line())
                .await
                .expect("timed out waiting for frame")
                .unwrap()
                .expect("connection closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn recv_until(&mut self, key: &str, value: &str) -> serde_json::Value {
            loop {
                let frame = self.recv().await;
                if frame[key] == value {
                    return frame;
                }
            }
        }
    }

    struct Stack {
        addr: SocketAddr,
        handle: EngineHandle,
        status_tx: UnboundedSender<crate::transmitter::TxStatus>,
        _dir: tempfile::TempDir,
        _shutdown: watch::Sender<bool>,
    }

    async fn spawn_stack() -> Stack {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("store.json"));
        let profiles = ProfileLibrary::from_profiles(builtin_profiles());
        let (engine, handle, command_rx, _cell) = Engine::new(profiles, store, StoreData::default());

        let (status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(engine.run(command_rx, status_rx));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(run(listener, handle.clone(), shutdown_rx));
        Stack {
            addr,
            handle,
            status_tx,
            _dir: dir,
            _shutdown: shutdown_tx,
        }
    }

    #[tokio::test]
    async fn set_channel_and_get_state_round_trip() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;

        client
            .send(r#"{"action":"set_channel","channel":10,"value":200}"#)
            .await;
        let response = client.recv().await;
        assert_eq!(response["status"], "ok");
        assert_eq!(response["action"], "set_channel");

        client.send(r#"{"action":"get_state"}"#).await;
        let response = client.recv_until("action", "get_state").await;
        assert_eq!(response["status"], "ok");
        assert_eq!(response["data"]["channels"][9], 200);
        assert_eq!(response["data"]["master"], 255);
        assert_eq!(response["data"]["connected"], false);
    }

    #[tokio::test]
    async fn missing_arguments_yield_error_with_echoed_action() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;

        client.send(r#"{"action":"set_channel","channel":3}"#).await;
        let response = client.recv().await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["action"], "set_channel");
        assert!(response["message"].as_str().unwrap().contains("value"));
    }

    #[tokio::test]
    async fn unparseable_frame_echoes_unknown() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;

        client.send("this is not json").await;
        let response = client.recv().await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["action"], "unknown");
    }

    #[tokio::test]
    async fn recall_of_unknown_preset_is_an_error() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;

        client
            .send(r#"{"action":"recall_preset","id":"6ec0bd7f-11c0-43da-975e-2a8ad9ebae0b"}"#)
            .await;
        let response = client.recv().await;
        assert_eq!(response["status"], "error");
        assert_eq!(response["action"], "recall_preset");
        assert!(response["message"]
            .as_str()
            .unwrap()
            .contains("unknown preset"));
    }

    #[tokio::test]
    async fn list_presets_returns_summaries() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;

        stack
            .handle
            .commands
            .send(EngineCommand::SavePreset {
                name: "Look".into(),
                fade_time: 250,
                color: "#0f0".into(),
            })
            .await
            .unwrap();

        client.send(r#"{"action":"list_presets"}"#).await;
        let response = client.recv_until("action", "list_presets").await;
        assert_eq!(response["status"], "ok");
        assert_eq!(response["data"][0]["name"], "Look");
        assert_eq!(response["data"][0]["fadeTime"], 250);
        assert_eq!(response["data"][0]["color"], "#0f0");
    }

    #[tokio::test]
    async fn transmitter_transitions_are_broadcast() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;

        // Round-trip once so the session (and its event subscription) is
        // live before the transition fires.
        client.send(r#"{"action":"get_state"}"#).await;
        client.recv_until("action", "get_state").await;

        stack
            .status_tx
            .send(crate::transmitter::TxStatus {
                connected: true,
                port: Some("/dev/ttyUSB0".into()),
            })
            .unwrap();

        let event = client.recv_until("event", "dmx_status").await;
        assert_eq!(event["connected"], true);
        assert!(event.get("port").is_none(), "automation event carries the flag only");
    }

    #[tokio::test]
    async fn preset_activation_from_engine_reaches_automation_clients() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;
        client.send(r#"{"action":"list_presets"}"#).await;
        client.recv_until("action", "list_presets").await;

        stack
            .handle
            .commands
            .send(EngineCommand::SavePreset {
                name: "Bridge".into(),
                fade_time: 0,
                color: "#00f".into(),
            })
            .await
            .unwrap();
        let updated = client.recv_until("event", "presets_updated").await;
        let id = updated["presets"][0]["id"].as_str().unwrap().to_string();

        // Recall as a live client would (no automation responder).
        stack
            .handle
            .commands
            .send(EngineCommand::RecallPreset {
                id: id.parse().unwrap(),
                fade_time: Some(0),
                respond: None,
            })
            .await
            .unwrap();

        let event = client.recv_until("event", "preset_activated").await;
        assert_eq!(event["name"], "Bridge");
        assert_eq!(event["id"], id.as_str());
    }

    #[tokio::test]
    async fn trigger_drives_channel_on_and_off() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;

        client
            .send(r#"{"action":"trigger","channel":4,"state":"on"}"#)
            .await;
        assert_eq!(client.recv().await["status"], "ok");
        client.send(r#"{"action":"get_state"}"#).await;
        let state = client.recv_until("action", "get_state").await;
        assert_eq!(state["data"]["channels"][3], 255);

        client
            .send(r#"{"action":"trigger","channel":4,"state":"off"}"#)
            .await;
        assert_eq!(client.recv().await["status"], "ok");
        client.send(r#"{"action":"get_state"}"#).await;
        let state = client.recv_until("action", "get_state").await;
        assert_eq!(state["data"]["channels"][3], 0);
    }

    #[tokio::test]
    async fn set_mode_error_taxonomy_reaches_the_wire() {
        let stack = spawn_stack().await;
        let mut client = TestClient::connect(stack.addr).await;

        client
            .send(r#"{"action":"set_mode","fixtureId":"6ec0bd7f-11c0-43da-975e-2a8ad9ebae0b","modeName":"Wash"}"#)
            .await;
        let response = client.recv().await;
        assert_eq!(response["status"], "error");
        assert!(response["message"]
            .as_str()
            .unwrap()
            .contains("unknown fixture"));
    }
}
