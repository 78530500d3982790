use std::path::PathBuf;

use clap::Parser;

/// Headless DMX512 lighting control daemon.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Address both servers bind to
    #[arg(long = "bind", default_value = "0.0.0.0")]
    pub bind: String,

    /// Live-client (rich UI) port
    #[arg(long = "ui-port", default_value_t = 9090)]
    pub ui_port: u16,

    /// Automation (show controller) port
    #[arg(long = "automation-port", default_value_t = 9091)]
    pub automation_port: u16,

    /// Serial device path, bypassing adapter discovery
    #[arg(long = "serial-port", value_name = "PATH")]
    pub serial_port: Option<String>,

    /// Directory of fixture profile documents
    #[arg(long = "profiles", default_value = "profiles", value_name = "DIR")]
    pub profile_dir: PathBuf,

    /// Fixture/preset store file
    #[arg(long = "store", default_value = "luxd-store.json", value_name = "FILE")]
    pub store_path: PathBuf,
}
