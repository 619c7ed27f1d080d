use crate::error::{KMeansError, Result};
use crate::runtime::{DeviceError, DeviceId, Runtime};
use tracing::{debug, info, warn};

/// The ordered set of devices participating in one run.
///
/// The position of a device inside the pool ("devi") is the index used by every
/// [`DistributedBuffer`](crate::DistributedBuffer) of the same run. The last device holds the
/// canonical copy of the results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePool {
    devices: Vec<DeviceId>,
}

impl DevicePool {
    /// Build a pool from an already validated list of devices.
    /// An empty list is [`KMeansError::NoSuchDevice`], every pool has a canonical device.
    pub fn from_devices(devices: Vec<DeviceId>) -> Result<Self> {
        if devices.is_empty() {
            return Err(KMeansError::NoSuchDevice);
        }
        Ok(Self { devices })
    }

    /// Expand `device_mask` into a pool of usable devices and enable peer access between them.
    ///
    /// ## Arguments
    /// - **device_mask**: Bitmask of requested devices, bit `i` selects device `i`. `0` selects all
    ///   installed devices.
    /// - **designated**: Device the caller's buffers live on (zero-copy mode). It takes part in
    ///   peer-access setup, but is only a compute participant if the mask selects it.
    ///
    /// Devices that cannot be selected are dropped with a warning, as are all peer-access problems.
    /// Only an empty result is an error.
    pub fn setup<R: Runtime>(runtime: &R, device_mask: u32, designated: Option<DeviceId>) -> Result<Self> {
        let mut mask = device_mask;
        if mask == 0 {
            let count = runtime.device_count().map_err(|e| KMeansError::runtime(e.to_string()))?;
            if count == 0 {
                return Err(KMeansError::NoSuchDevice);
            }
            mask = if count >= 32 { u32::MAX } else { (1u32 << count) - 1 };
        }

        let mut devices = Vec::new();
        for dev in (0..32).filter(|d| mask & (1u32 << d) != 0) {
            match runtime.set_device(dev) {
                Ok(()) => devices.push(dev),
                Err(e) => warn!("failed to validate device {}: {}", dev, e),
            }
        }

        let extra = designated.filter(|d| !devices.contains(d));
        if let Some(dev) = extra {
            devices.push(dev);
        }
        if devices.len() > 1 {
            enable_peer_access(runtime, &devices);
        }
        if extra.is_some() {
            devices.pop();
        }

        if devices.is_empty() {
            return Err(KMeansError::NoSuchDevice);
        }
        info!("using devices {:?}", devices);
        Ok(Self { devices })
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn ids(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn get(&self, devi: usize) -> DeviceId {
        self.devices[devi]
    }

    /// The device holding the canonical centroids and assignments.
    pub fn canonical(&self) -> DeviceId {
        self.devices[self.devices.len() - 1]
    }

    /// Position of `device` inside the pool.
    pub fn position(&self, device: DeviceId) -> Option<usize> {
        self.devices.iter().position(|&d| d == device)
    }

    /// Select every device in turn and hand it to `op`, which enqueues work on it.
    ///
    /// `op` receives the pool index and the device id. The host does not wait for the enqueued
    /// work, so devices execute concurrently once their commands are issued.
    pub fn for_each<R, F>(&self, runtime: &R, mut op: F) -> Result<()>
    where
        R: Runtime,
        F: FnMut(usize, DeviceId) -> Result<()>,
    {
        for (devi, &dev) in self.devices.iter().enumerate() {
            runtime.set_device(dev).map_err(|e| select_failed(dev, e))?;
            op(devi, dev)?;
        }
        Ok(())
    }

    /// Block until the streams of all devices drained.
    pub fn synchronize_all<R: Runtime>(&self, runtime: &R) -> Result<()> {
        self.for_each(runtime, |_, dev| {
            runtime.synchronize().map_err(|e| KMeansError::runtime(format!("failed to synchronize device {}: {}", dev, e)))
        })
    }

    pub fn log_memory_stats<R: Runtime>(&self, runtime: &R) -> Result<()> {
        self.for_each(runtime, |_, dev| {
            let mem = runtime.memory_info().map_err(|e| KMeansError::runtime(e.to_string()))?;
            let used = mem.total - mem.free;
            info!(
                "device #{} memory: used {} bytes ({:.1}%), free {} bytes, total {} bytes",
                dev, used, used as f64 * 100.0 / mem.total as f64, mem.free, mem.total
            );
            Ok(())
        })
    }
}

pub(crate) fn select_failed(dev: DeviceId, e: DeviceError) -> KMeansError {
    KMeansError::runtime(format!("failed to select device {}: {}", dev, e))
}

fn enable_peer_access<R: Runtime>(runtime: &R, devices: &[DeviceId]) {
    for &dev1 in devices {
        for &dev2 in devices.iter().filter(|&&d| d < dev1) {
            match runtime.can_access_peer(dev1, dev2) {
                Ok(true) => {}
                Ok(false) => warn!("p2p {} <-> {} is impossible", dev1, dev2),
                Err(e) => warn!("failed to query p2p {} <-> {}: {}", dev1, dev2, e),
            }
        }
    }
    for &dev in devices {
        if let Err(e) = runtime.set_device(dev) {
            warn!("failed to select device {} for p2p setup: {}", dev, e);
            continue;
        }
        for &odev in devices.iter().filter(|&&d| d != dev) {
            match runtime.enable_peer_access(odev) {
                Ok(()) => debug!("enabled p2p {} -> {}", dev, odev),
                Err(DeviceError::PeerAccessAlreadyEnabled) => info!("p2p is already enabled on device #{}", dev),
                Err(e) => warn!("failed to enable p2p on device #{}: {}", dev, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostRuntime;

    #[test]
    fn zero_mask_selects_all_installed() {
        let runtime = HostRuntime::new(3);
        let pool = DevicePool::setup(&runtime, 0, None).unwrap();
        assert_eq!(pool.ids(), &[0, 1, 2]);
        assert_eq!(pool.canonical(), 2);
        assert!(runtime.peer_access_enabled(0, 2));
        assert!(runtime.peer_access_enabled(2, 1));
    }

    #[test]
    fn mask_selects_subset() {
        let runtime = HostRuntime::new(4);
        let pool = DevicePool::setup(&runtime, 0b1010, None).unwrap();
        assert_eq!(pool.ids(), &[1, 3]);
        assert_eq!(pool.position(3), Some(1));
        assert_eq!(pool.position(0), None);
    }

    #[test]
    fn unselectable_devices_are_dropped() {
        let runtime = HostRuntime::new(3).with_unavailable_device(1);
        let pool = DevicePool::setup(&runtime, 0, None).unwrap();
        assert_eq!(pool.ids(), &[0, 2]);

        // bits beyond the installed devices are dropped as well
        let pool = DevicePool::setup(&runtime, 0b1001, None).unwrap();
        assert_eq!(pool.ids(), &[0]);
    }

    #[test]
    fn no_valid_device() {
        let runtime = HostRuntime::new(2).with_unavailable_device(0);
        assert_eq!(DevicePool::setup(&runtime, 0b1, None), Err(KMeansError::NoSuchDevice));
        assert_eq!(DevicePool::setup(&runtime, 0b100, None), Err(KMeansError::NoSuchDevice));
        assert_eq!(DevicePool::setup(&HostRuntime::new(0), 0, None), Err(KMeansError::NoSuchDevice));
        assert_eq!(DevicePool::from_devices(Vec::new()), Err(KMeansError::NoSuchDevice));
    }

    #[test]
    fn designated_device_joins_p2p_setup_only() {
        let runtime = HostRuntime::new(3);
        let pool = DevicePool::setup(&runtime, 0b011, Some(2)).unwrap();
        assert_eq!(pool.ids(), &[0, 1]);
        assert!(runtime.peer_access_enabled(2, 0));
        assert!(runtime.peer_access_enabled(1, 2));

        let pool = DevicePool::setup(&runtime, 0b011, Some(1)).unwrap();
        assert_eq!(pool.ids(), &[0, 1]);
    }

    #[test]
    fn p2p_failures_are_not_fatal() {
        let runtime = HostRuntime::new(2).with_peer_capability(0, 1, false);
        let pool = DevicePool::setup(&runtime, 0, None).unwrap();
        assert_eq!(pool.ids(), &[0, 1]);
        assert!(!runtime.peer_access_enabled(0, 1));

        // second setup finds access already enabled on capable pairs
        let runtime = HostRuntime::new(2);
        DevicePool::setup(&runtime, 0, None).unwrap();
        assert_eq!(DevicePool::setup(&runtime, 0, None).unwrap().len(), 2);
    }

    #[test]
    fn for_each_selects_devices_in_order() {
        let runtime = HostRuntime::new(3);
        let pool = DevicePool::from_devices(vec![2, 0]).unwrap();
        let mut seen = Vec::new();
        pool.for_each(&runtime, |devi, dev| {
            seen.push((devi, dev));
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![(0, 2), (1, 0)]);
        pool.synchronize_all(&runtime).unwrap();
        pool.log_memory_stats(&runtime).unwrap();
    }
}
