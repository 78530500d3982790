mod automation;
mod config;
mod engine;
mod fade;
mod fixtures;
mod live_server;
mod presets;
mod profiles;
mod protocol;
mod store;
mod transmitter;
mod universe;

use std::process::ExitCode;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::config::Config;
use crate::engine::Engine;
use crate::profiles::ProfileLibrary;
use crate::store::Store;
use crate::transmitter::{SerialProvider, Transmitter};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let config = Config::parse();

    let profiles = ProfileLibrary::load(&config.profile_dir);
    let store = Store::new(config.store_path.clone());
    let data = store.load();
    log::info!(
        "store loaded: {} fixtures, {} presets",
        data.fixtures.len(),
        data.presets.len()
    );

    let (engine, handle, command_rx, frame_cell) = Engine::new(profiles, store, data);

    // Failing to bind either port is the one fatal startup condition.
    let live_listener = match TcpListener::bind((config.bind.as_str(), config.ui_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("cannot bind live-client port {}: {e}", config.ui_port);
            return ExitCode::FAILURE;
        }
    };
    let automation_listener =
        match TcpListener::bind((config.bind.as_str(), config.automation_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                log::error!("cannot bind automation port {}: {e}", config.automation_port);
                return ExitCode::FAILURE;
            }
        };
    log::info!(
        "listening on {}:{} (live) and {}:{} (automation)",
        config.bind,
        config.ui_port,
        config.bind,
        config.automation_port
    );

    let (status_tx, status_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut transmitter = Transmitter::spawn(
        Box::new(SerialProvider {
            override_path: config.serial_port.clone(),
        }),
        frame_cell,
        status_tx,
    );

    let engine_task = tokio::spawn(engine.run(command_rx, status_rx));

    let (live_shutdown_tx, live_shutdown_rx) = watch::channel(false);
    let (automation_shutdown_tx, automation_shutdown_rx) = watch::channel(false);
    let live_task = tokio::spawn(live_server::run(
        live_listener,
        handle.clone(),
        live_shutdown_rx,
    ));
    let automation_task = tokio::spawn(automation::run(
        automation_listener,
        handle.clone(),
        automation_shutdown_rx,
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutdown requested"),
        Err(e) => log::error!("cannot listen for shutdown signal: {e}"),
    }

    // Shutdown order: automation server, live-client server, transmitter.
    let _ = automation_shutdown_tx.send(true);
    let _ = automation_task.await;
    let _ = live_shutdown_tx.send(true);
    let _ = live_task.await;
    transmitter.shutdown();

    drop(handle);
    let _ = engine_task.await;
    ExitCode::SUCCESS
}
