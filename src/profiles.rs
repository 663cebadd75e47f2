//! Saved remote profiles.
//!
//! A profile binds a human-facing remote ("Living Room TV") to the node
//! and code set that drive it. Stored next to the connection settings as
//! TOML; the collection is small (a handful of remotes per household) so
//! every mutation rewrites the whole file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SettingsError;
use crate::model::DeviceType;
use crate::mqtt::session::short_id;
use crate::mqtt::topics;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteProfile {
    pub id: String,
    pub name: String,
    pub room: String,
    pub brand: String,
    pub device_type: DeviceType,
    /// Node that carries this remote's IR emitter.
    pub node_id: String,
    /// Index into the brand's known code sets, when one was picked.
    pub code_set_index: Option<u32>,
}

impl RemoteProfile {
    pub fn new(name: &str, room: &str, brand: &str, device_type: DeviceType) -> Self {
        Self {
            id: short_id(),
            name: name.to_string(),
            room: room.to_string(),
            brand: brand.to_string(),
            device_type,
            node_id: topics::DEFAULT_NODE_ID.to_string(),
            code_set_index: None,
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<RemoteProfile>,
}

pub struct ProfileStore {
    path: PathBuf,
    profiles: Vec<RemoteProfile>,
}

impl ProfileStore {
    pub fn open() -> Self {
        let path = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("irlink")
            .join("profiles.toml");
        Self::open_at(path)
    }

    pub fn open_at(path: PathBuf) -> Self {
        let profiles = match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str::<ProfileFile>(&contents) {
                Ok(file) => {
                    debug!("loaded {} profiles", file.profiles.len());
                    file.profiles
                }
                Err(e) => {
                    warn!("corrupt profile file, starting empty: {}", e);
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => {
                warn!("could not read profiles, starting empty: {}", e);
                Vec::new()
            }
        };
        Self { path, profiles }
    }

    pub fn list(&self) -> &[RemoteProfile] {
        &self.profiles
    }

    pub fn get(&self, id: &str) -> Option<&RemoteProfile> {
        self.profiles.iter().find(|p| p.id == id)
    }

    /// Inserts or replaces by id.
    pub fn save(&mut self, profile: RemoteProfile) -> Result<(), SettingsError> {
        match self.profiles.iter_mut().find(|p| p.id == profile.id) {
            Some(existing) => *existing = profile,
            None => self.profiles.push(profile),
        }
        self.persist()
    }

    pub fn remove(&mut self, id: &str) -> Result<(), SettingsError> {
        self.profiles.retain(|p| p.id != id);
        self.persist()
    }

    fn persist(&self) -> Result<(), SettingsError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = ProfileFile {
            profiles: self.profiles.clone(),
        };
        let contents = toml::to_string_pretty(&file)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("irlink-profiles-{}", short_id()))
            .join("profiles.toml")
    }

    #[test]
    fn profiles_round_trip_through_disk() {
        let path = temp_path();
        let mut store = ProfileStore::open_at(path.clone());
        assert!(store.list().is_empty());

        let profile = RemoteProfile::new("Living Room TV", "Living Room", "LG", DeviceType::Tv);
        let id = profile.id.clone();
        store.save(profile).unwrap();

        let reopened = ProfileStore::open_at(path.clone());
        assert_eq!(reopened.list().len(), 1);
        assert_eq!(reopened.get(&id).unwrap().brand, "LG");

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn save_replaces_by_id_and_remove_deletes() {
        let path = temp_path();
        let mut store = ProfileStore::open_at(path.clone());

        let mut profile = RemoteProfile::new("Bedroom AC", "Bedroom", "Daikin", DeviceType::Ac);
        let id = profile.id.clone();
        store.save(profile.clone()).unwrap();

        profile.code_set_index = Some(2);
        store.save(profile).unwrap();
        assert_eq!(store.list().len(), 1);
        assert_eq!(store.get(&id).unwrap().code_set_index, Some(2));

        store.remove(&id).unwrap();
        assert!(store.list().is_empty());

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
