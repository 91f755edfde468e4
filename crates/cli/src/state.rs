//! File-backed venue state for single-process deployments.
//!
//! The state file is the JSON snapshot of the in-memory store plus the
//! device registry and per-event policies. A missing file is a fresh venue.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use turnstile_core::{DeviceBinding, PolicySet, StaticDeviceRegistry, StaticPolicyEngine};
use turnstile_storage::{MemoryStorage, StorageSnapshot};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct VenueState {
    #[serde(default)]
    pub storage: StorageSnapshot,
    #[serde(default)]
    pub devices: Vec<DeviceBinding>,
    #[serde(default)]
    pub policies: BTreeMap<String, PolicySet>,
}

impl VenueState {
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents)
                .map_err(|e| format!("state file {}: {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(VenueState::default()),
            Err(e) => Err(format!("state file {}: {e}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), String> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| format!("serialize state: {e}"))?;
        std::fs::write(path, json).map_err(|e| format!("state file {}: {e}", path.display()))
    }

    pub fn open_storage(&self) -> Result<MemoryStorage, String> {
        MemoryStorage::from_snapshot(self.storage.clone()).map_err(|e| e.to_string())
    }

    pub fn registry(&self) -> StaticDeviceRegistry {
        let mut registry = StaticDeviceRegistry::new();
        for binding in &self.devices {
            registry = registry.with_binding(binding.clone());
        }
        registry
    }

    pub fn policy_engine(&self) -> StaticPolicyEngine {
        let mut engine = StaticPolicyEngine::new();
        for (event_id, rules) in &self.policies {
            engine = engine.with_rules(event_id, rules.clone());
        }
        engine
    }
}
