//! Device discovery registry.
//!
//! An explicit registry object, created once at startup and passed by
//! reference to consumers. Backends plug in as [`PlatformProvider`]s;
//! device ids are numbered contiguously across providers in registration
//! order, so an id is stable for the registry's lifetime.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Registry-wide device identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device-{}", self.0)
    }
}

/// Capabilities of one discovered compute device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Registry-wide id, assigned at registration.
    pub id: DeviceId,
    /// Device name as reported by the platform.
    pub name: String,
    /// Vendor string.
    pub vendor: String,
    /// Number of parallel compute units.
    pub compute_units: u32,
    /// Maximum work-group size per launch.
    pub max_work_group_size: usize,
    /// Global memory in bytes.
    pub global_memory: u64,
}

/// One backend's device enumeration hook.
pub trait PlatformProvider: Send + Sync {
    /// Platform name.
    fn name(&self) -> &str;

    /// Devices exposed by this platform. Ids are provider-local and are
    /// renumbered by the registry.
    fn devices(&self) -> Vec<DeviceInfo>;
}

/// Explicit device registry.
#[derive(Default)]
pub struct DeviceRegistry {
    providers: Vec<Arc<dyn PlatformProvider>>,
    devices: Vec<DeviceInfo>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a platform, appending its devices with contiguous ids.
    pub fn register(&mut self, provider: Arc<dyn PlatformProvider>) {
        let base = self.devices.len() as u32;
        for (index, mut info) in provider.devices().into_iter().enumerate() {
            info.id = DeviceId(base + index as u32);
            self.devices.push(info);
        }
        tracing::info!(
            platform = provider.name(),
            devices = self.devices.len() as u32 - base,
            "registered platform"
        );
        self.providers.push(provider);
    }

    /// All discovered devices, in id order.
    pub fn devices(&self) -> &[DeviceInfo] {
        &self.devices
    }

    /// Look up one device by id.
    pub fn device(&self, id: DeviceId) -> Option<&DeviceInfo> {
        self.devices.get(id.0 as usize)
    }

    /// Number of discovered devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Number of registered platforms.
    pub fn platform_count(&self) -> usize {
        self.providers.len()
    }

    /// Whether no devices were discovered.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

impl fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("platforms", &self.providers.len())
            .field("devices", &self.devices.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubPlatform {
        name: String,
        count: u32,
    }

    impl PlatformProvider for StubPlatform {
        fn name(&self) -> &str {
            &self.name
        }

        fn devices(&self) -> Vec<DeviceInfo> {
            (0..self.count)
                .map(|i| DeviceInfo {
                    id: DeviceId(i),
                    name: format!("{} device {}", self.name, i),
                    vendor: "stub".to_string(),
                    compute_units: 4,
                    max_work_group_size: 256,
                    global_memory: 1 << 30,
                })
                .collect()
        }
    }

    #[test]
    fn test_contiguous_ids_across_platforms() {
        let mut registry = DeviceRegistry::new();
        registry.register(Arc::new(StubPlatform {
            name: "alpha".to_string(),
            count: 2,
        }));
        registry.register(Arc::new(StubPlatform {
            name: "beta".to_string(),
            count: 3,
        }));

        assert_eq!(registry.device_count(), 5);
        assert_eq!(registry.platform_count(), 2);
        let ids: Vec<u32> = registry.devices().iter().map(|d| d.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4]);
        assert_eq!(registry.device(DeviceId(2)).unwrap().name, "beta device 0");
    }

    #[test]
    fn test_lookup_missing_device() {
        let registry = DeviceRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.device(DeviceId(0)).is_none());
    }
}
