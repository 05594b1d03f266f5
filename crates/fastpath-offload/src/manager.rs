//! Device manager
//!
//! Owns every device and its host link. Construction either brings all
//! devices up or tears down the ones already started before returning the
//! error; dropping the manager closes links and joins every device thread.

use crate::error::{OffloadError, OffloadResult};
use crate::link::{DeviceLink, SharedLink};
use crate::stats::DeviceStatsSnapshot;
use crate::vdevice::VDevice;
use crate::worker::Kernel;
use fastpath_common::VDeviceConfig;
use parking_lot::Mutex;
use std::sync::Arc;

struct ManagedDevice {
    device: VDevice,
    link: Option<SharedLink>,
}

/// Running devices, keyed by device id
#[derive(Default)]
pub struct DeviceManager {
    devices: Vec<ManagedDevice>,
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.devices.iter().map(|d| d.device.device_id())).finish()
    }
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start every configured device with the same kernel
    pub fn launch_all(configs: &[VDeviceConfig], kernel: Arc<dyn Kernel>) -> OffloadResult<Self> {
        let mut manager = Self::new();
        for config in configs {
            manager.launch(config, kernel.clone())?;
        }
        Ok(manager)
    }

    /// Start one device and connect to it
    pub fn launch(&mut self, config: &VDeviceConfig, kernel: Arc<dyn Kernel>) -> OffloadResult<u32> {
        if self.find(config.device_id).is_some() {
            return Err(OffloadError::InvalidConfig(format!("device {} already running", config.device_id)));
        }
        let device = VDevice::launch(config, kernel)?;
        // On error `device` drops here, which joins its master thread
        let link = DeviceLink::connect(device.master_addr(), config)?;
        self.devices.push(ManagedDevice {
            device,
            link: Some(Arc::new(Mutex::new(link))),
        });
        Ok(config.device_id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn device_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.devices.iter().map(|d| d.device.device_id())
    }

    pub fn device(&self, device_id: u32) -> Option<&VDevice> {
        self.find(device_id).map(|d| &d.device)
    }

    /// Host link of a device, for the elements that offload to it
    pub fn link(&self, device_id: u32) -> Option<SharedLink> {
        self.find(device_id).and_then(|d| d.link.clone())
    }

    pub fn stats(&self, device_id: u32) -> Option<DeviceStatsSnapshot> {
        self.device(device_id).map(VDevice::stats)
    }

    /// Close every link, then stop and join every device
    pub fn shutdown(&mut self) {
        for managed in &mut self.devices {
            managed.link.take();
        }
        for mut managed in self.devices.drain(..) {
            managed.device.shutdown();
        }
    }

    fn find(&self, device_id: u32) -> Option<&ManagedDevice> {
        self.devices.iter().find(|d| d.device.device_id() == device_id)
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
