//! Device registry collaborator.
//!
//! Every scanning device is bound to exactly one tenant and venue at
//! registration time (registration itself is outside this crate). The binding
//! is what the isolation checks compare against -- the credential's claims
//! never stand alone.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::InfraError;

/// A device's registered tenant/venue binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceBinding {
    pub device_id: String,
    pub tenant_id: String,
    pub venue_id: String,
    /// Base64 Ed25519 verifying key for the device's offline log batches.
    pub batch_verifying_key: Option<String>,
}

/// Narrow query interface to the device registry collaborator.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn get_binding(&self, device_id: &str) -> Result<Option<DeviceBinding>, InfraError>;
}

/// Fixed binding table for tests, the CLI, and single-process deployments.
#[derive(Default)]
pub struct StaticDeviceRegistry {
    bindings: BTreeMap<String, DeviceBinding>,
}

impl StaticDeviceRegistry {
    pub fn new() -> Self {
        StaticDeviceRegistry::default()
    }

    pub fn with_binding(mut self, binding: DeviceBinding) -> Self {
        self.bindings.insert(binding.device_id.clone(), binding);
        self
    }
}

#[async_trait]
impl DeviceRegistry for StaticDeviceRegistry {
    async fn get_binding(&self, device_id: &str) -> Result<Option<DeviceBinding>, InfraError> {
        Ok(self.bindings.get(device_id).cloned())
    }
}
