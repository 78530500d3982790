//! On-disk persistence for fixtures and presets.
//!
//! One JSON document, read at startup and rewritten after every mutation.
//! Writes go through a temp file + rename so a crash mid-write never
//! leaves a torn store. All writes happen on the engine task, so they are
//! serialized by construction.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::fixtures::Fixture;
use crate::presets::Preset;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreData {
    #[serde(default)]
    pub fixtures: Vec<Fixture>,
    #[serde(default)]
    pub presets: Vec<Preset>,
}

pub struct Store {
    path: PathBuf,
}

impl Store {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the store. A missing file is an empty store; a corrupt file is
    /// logged and treated as empty rather than blocking startup.
    pub fn load(&self) -> StoreData {
        match fs::read_to_string(&self.path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("store {} is corrupt ({e}), starting empty", self.path.display());
                    StoreData::default()
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => StoreData::default(),
            Err(e) => {
                log::error!("cannot read store {}: {e}", self.path.display());
                StoreData::default()
            }
        }
    }

    pub fn save(&self, data: &StoreData) -> io::Result<()> {
        let text = serde_json::to_string_pretty(data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let tmp = self.path.with_extension("json.tmp");
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&tmp, text)?;
        fs::rename(&tmp, &self.path)
    }
}
