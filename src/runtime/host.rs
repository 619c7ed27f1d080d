use super::{ComputeCapability, DeviceError, DeviceId, MemoryInfo, Runtime};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashSet};

const BASE_ADDRESS: u64 = 0x7f00_0000_0000;
const ALLOCATION_GRANULARITY: u64 = 256;

struct HostDevice {
    capability: ComputeCapability,
    unavailable: bool,
    memory_limit: usize,
    used: usize,
    peers_enabled: HashSet<DeviceId>,
}

struct Allocation {
    device: DeviceId,
    data: Vec<u8>,
}

struct HostState {
    current: Option<DeviceId>,
    devices: Vec<HostDevice>,
    peer_capable: Vec<Vec<bool>>,
    allocations: BTreeMap<u64, Allocation>,
    next_addr: u64,
    htod_bytes: usize,
    dtoh_bytes: usize,
}

impl HostState {
    fn current(&self) -> Result<DeviceId, DeviceError> {
        self.current.ok_or(DeviceError::NoCurrentDevice)
    }

    fn check_device(&self, device: DeviceId) -> Result<&HostDevice, DeviceError> {
        self.devices.get(device as usize).ok_or(DeviceError::InvalidDevice(device))
    }

    /// Resolve `addr..addr+len` to (allocation base, offset, owning device).
    fn resolve(&self, addr: u64, len: usize) -> Result<(u64, usize, DeviceId), DeviceError> {
        let (&base, alloc) = self.allocations.range(..=addr).next_back().ok_or(DeviceError::InvalidAddress(addr))?;
        let offset = (addr - base) as usize;
        if offset + len > alloc.data.len() {
            return Err(DeviceError::InvalidAddress(addr));
        }
        Ok((base, offset, alloc.device))
    }

    fn read(&self, addr: u64, len: usize) -> Result<Vec<u8>, DeviceError> {
        let (base, offset, _) = self.resolve(addr, len)?;
        Ok(self.allocations[&base].data[offset..offset + len].to_vec())
    }

    fn write(&mut self, addr: u64, src: &[u8]) -> Result<(), DeviceError> {
        let (base, offset, _) = self.resolve(addr, src.len())?;
        let alloc = self.allocations.get_mut(&base).ok_or(DeviceError::InvalidAddress(addr))?;
        alloc.data[offset..offset + src.len()].copy_from_slice(src);
        Ok(())
    }

    fn on_device(&self, addr: u64, len: usize, device: DeviceId) -> Result<(), DeviceError> {
        match self.resolve(addr, len)? {
            (_, _, owner) if owner == device => Ok(()),
            _ => Err(DeviceError::InvalidAddress(addr)),
        }
    }

    fn peers_enabled(&self, a: DeviceId, b: DeviceId) -> bool {
        a == b
            || self.devices[a as usize].peers_enabled.contains(&b)
            || self.devices[b as usize].peers_enabled.contains(&a)
    }

    fn peer_copy(
        &mut self, dst: u64, dst_device: DeviceId, src: u64, src_device: DeviceId, bytes: usize,
    ) -> Result<(), DeviceError> {
        self.check_device(dst_device)?;
        self.check_device(src_device)?;
        self.on_device(dst, bytes, dst_device)?;
        self.on_device(src, bytes, src_device)?;
        if !self.peers_enabled(dst_device, src_device) {
            return Err(DeviceError::PeerAccessNotEnabled(src_device, dst_device));
        }
        let data = self.read(src, bytes)?;
        self.write(dst, &data)
    }
}

/// Simulated multi-device runtime whose device memory lives in host memory.
///
/// Copies complete eagerly, so the asynchronous variants behave like already-drained streams.
/// The simulation is strict where real hardware would be: stream copies must target memory of
/// the current device, and peer copies require peer access to have been enabled beforehand.
///
/// ## Example
/// ```rust
/// use kmeans_gpu::{HostRuntime, ComputeCapability};
///
/// let runtime = HostRuntime::new(2)
///     .with_capability(1, ComputeCapability::new(5, 2))
///     .with_peer_capability(0, 1, false);
/// ```
pub struct HostRuntime {
    state: RefCell<HostState>,
}

impl HostRuntime {
    /// Create a runtime with `device_count` devices of architecture 7.0, 1 GiB each, which can all
    /// access each other.
    pub fn new(device_count: u32) -> Self {
        let devices = (0..device_count)
            .map(|_| HostDevice {
                capability: ComputeCapability::new(7, 0),
                unavailable: false,
                memory_limit: 1 << 30,
                used: 0,
                peers_enabled: HashSet::new(),
            })
            .collect();
        let n = device_count as usize;
        Self {
            state: RefCell::new(HostState {
                current: None,
                devices,
                peer_capable: vec![vec![true; n]; n],
                allocations: BTreeMap::new(),
                next_addr: BASE_ADDRESS,
                htod_bytes: 0,
                dtoh_bytes: 0,
            }),
        }
    }

    pub fn with_capability(self, device: DeviceId, capability: ComputeCapability) -> Self {
        if let Some(d) = self.state.borrow_mut().devices.get_mut(device as usize) {
            d.capability = capability;
        }
        self
    }

    /// Mark `device` as installed but impossible to select.
    pub fn with_unavailable_device(self, device: DeviceId) -> Self {
        if let Some(d) = self.state.borrow_mut().devices.get_mut(device as usize) {
            d.unavailable = true;
        }
        self
    }

    pub fn with_memory_limit(self, device: DeviceId, bytes: usize) -> Self {
        if let Some(d) = self.state.borrow_mut().devices.get_mut(device as usize) {
            d.memory_limit = bytes;
        }
        self
    }

    /// Set whether `a` and `b` are able to access each other's memory.
    pub fn with_peer_capability(self, a: DeviceId, b: DeviceId, capable: bool) -> Self {
        {
            let mut state = self.state.borrow_mut();
            let n = state.devices.len();
            if (a as usize) < n && (b as usize) < n {
                state.peer_capable[a as usize][b as usize] = capable;
                state.peer_capable[b as usize][a as usize] = capable;
            }
        }
        self
    }

    /// Amount of live allocations, over all devices.
    pub fn allocation_count(&self) -> usize {
        self.state.borrow().allocations.len()
    }

    /// Total bytes copied from host to device so far.
    pub fn host_to_device_bytes(&self) -> usize {
        self.state.borrow().htod_bytes
    }

    /// Total bytes copied from device to host so far.
    pub fn device_to_host_bytes(&self) -> usize {
        self.state.borrow().dtoh_bytes
    }

    pub fn peer_access_enabled(&self, device: DeviceId, peer: DeviceId) -> bool {
        self.state
            .borrow()
            .devices
            .get(device as usize)
            .map_or(false, |d| d.peers_enabled.contains(&peer))
    }
}

impl Runtime for HostRuntime {
    fn device_count(&self) -> Result<u32, DeviceError> {
        Ok(self.state.borrow().devices.len() as u32)
    }

    fn set_device(&self, device: DeviceId) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        if state.check_device(device)?.unavailable {
            return Err(DeviceError::DeviceUnavailable(device));
        }
        state.current = Some(device);
        Ok(())
    }

    fn compute_capability(&self, device: DeviceId) -> Result<ComputeCapability, DeviceError> {
        Ok(self.state.borrow().check_device(device)?.capability)
    }

    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool, DeviceError> {
        let state = self.state.borrow();
        state.check_device(device)?;
        state.check_device(peer)?;
        Ok(device != peer && state.peer_capable[device as usize][peer as usize])
    }

    fn enable_peer_access(&self, peer: DeviceId) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let device = state.current()?;
        state.check_device(peer)?;
        if device == peer {
            return Err(DeviceError::InvalidDevice(peer));
        }
        if !state.peer_capable[device as usize][peer as usize] {
            return Err(DeviceError::PeerAccessUnsupported { device, peer });
        }
        if !state.devices[device as usize].peers_enabled.insert(peer) {
            return Err(DeviceError::PeerAccessAlreadyEnabled);
        }
        Ok(())
    }

    fn memory_info(&self) -> Result<MemoryInfo, DeviceError> {
        let state = self.state.borrow();
        let device = &state.devices[state.current()? as usize];
        Ok(MemoryInfo { free: device.memory_limit.saturating_sub(device.used), total: device.memory_limit })
    }

    fn malloc(&self, bytes: usize) -> Result<u64, DeviceError> {
        if bytes == 0 {
            return Err(DeviceError::InvalidValue);
        }
        let mut state = self.state.borrow_mut();
        let device = state.current()?;
        {
            let d = &mut state.devices[device as usize];
            if d.used + bytes > d.memory_limit {
                return Err(DeviceError::OutOfMemory);
            }
            d.used += bytes;
        }
        let addr = state.next_addr;
        let span = (bytes as u64).div_ceil(ALLOCATION_GRANULARITY) + 1;
        state.next_addr += span * ALLOCATION_GRANULARITY;
        state.allocations.insert(addr, Allocation { device, data: vec![0u8; bytes] });
        Ok(addr)
    }

    fn free(&self, addr: u64) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let alloc = state.allocations.remove(&addr).ok_or(DeviceError::InvalidAddress(addr))?;
        state.devices[alloc.device as usize].used -= alloc.data.len();
        Ok(())
    }

    fn memcpy_htod_async(&self, dst: u64, src: &[u8]) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let device = state.current()?;
        state.on_device(dst, src.len(), device)?;
        state.write(dst, src)?;
        state.htod_bytes += src.len();
        Ok(())
    }

    fn memcpy_dtoh(&self, dst: &mut [u8], src: u64) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let data = state.read(src, dst.len())?;
        dst.copy_from_slice(&data);
        state.dtoh_bytes += dst.len();
        Ok(())
    }

    fn memcpy_dtod_async(&self, dst: u64, src: u64, bytes: usize) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        let device = state.current()?;
        state.on_device(dst, bytes, device)?;
        state.on_device(src, bytes, device)?;
        let data = state.read(src, bytes)?;
        state.write(dst, &data)
    }

    fn memcpy_peer_async(
        &self, dst: u64, dst_device: DeviceId, src: u64, src_device: DeviceId, bytes: usize,
    ) -> Result<(), DeviceError> {
        let mut state = self.state.borrow_mut();
        state.current()?;
        state.peer_copy(dst, dst_device, src, src_device, bytes)
    }

    fn memcpy_peer(
        &self, dst: u64, dst_device: DeviceId, src: u64, src_device: DeviceId, bytes: usize,
    ) -> Result<(), DeviceError> {
        self.state.borrow_mut().peer_copy(dst, dst_device, src, src_device, bytes)
    }

    fn synchronize(&self) -> Result<(), DeviceError> {
        self.state.borrow().current().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::DevicePtr;

    #[test]
    fn allocation_and_copies() {
        let runtime = HostRuntime::new(2);
        assert_eq!(runtime.alloc::<f32>(4), Err(DeviceError::NoCurrentDevice));

        runtime.set_device(0).unwrap();
        let a: DevicePtr<f32> = runtime.alloc(4).unwrap();
        let b: DevicePtr<f32> = runtime.alloc(4).unwrap();
        assert_ne!(a, b);
        runtime.copy_from_host_async(a, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        runtime.copy_on_device_async(b.offset(2), a, 2).unwrap();
        runtime.synchronize().unwrap();

        let mut host = [0.0f32; 4];
        runtime.copy_to_host(&mut host, b).unwrap();
        assert_eq!(host, [0.0, 0.0, 1.0, 2.0]);
        assert_eq!(runtime.host_to_device_bytes(), 16);
        assert_eq!(runtime.device_to_host_bytes(), 16);

        // out of bounds
        assert_eq!(runtime.copy_on_device_async(b.offset(3), a, 2), Err(DeviceError::InvalidAddress(b.offset(3).as_raw())));
        runtime.free(a.as_raw()).unwrap();
        runtime.free(b.as_raw()).unwrap();
        assert_eq!(runtime.allocation_count(), 0);
    }

    #[test]
    fn stream_copies_stay_on_current_device() {
        let runtime = HostRuntime::new(2);
        runtime.set_device(1).unwrap();
        let remote: DevicePtr<u32> = runtime.alloc(2).unwrap();
        runtime.set_device(0).unwrap();
        assert!(runtime.copy_from_host_async(remote, &[1, 2]).is_err());
    }

    #[test]
    fn device_selection() {
        let runtime = HostRuntime::new(2).with_unavailable_device(1);
        assert_eq!(runtime.set_device(0), Ok(()));
        assert_eq!(runtime.set_device(1), Err(DeviceError::DeviceUnavailable(1)));
        assert_eq!(runtime.set_device(2), Err(DeviceError::InvalidDevice(2)));
    }

    #[test]
    fn peer_copies_require_enabled_access() {
        let runtime = HostRuntime::new(3).with_peer_capability(0, 2, false);
        runtime.set_device(0).unwrap();
        let src: DevicePtr<u32> = runtime.alloc(2).unwrap();
        runtime.copy_from_host_async(src, &[7, 9]).unwrap();
        runtime.set_device(1).unwrap();
        let dst: DevicePtr<u32> = runtime.alloc(2).unwrap();

        assert_eq!(runtime.copy_peer(dst, 1, src, 0, 2), Err(DeviceError::PeerAccessNotEnabled(0, 1)));
        runtime.enable_peer_access(0).unwrap();
        assert_eq!(runtime.enable_peer_access(0), Err(DeviceError::PeerAccessAlreadyEnabled));
        runtime.copy_peer(dst, 1, src, 0, 2).unwrap();
        let mut host = [0u32; 2];
        runtime.copy_to_host(&mut host, dst).unwrap();
        assert_eq!(host, [7, 9]);

        runtime.set_device(2).unwrap();
        assert_eq!(runtime.can_access_peer(2, 0), Ok(false));
        assert_eq!(runtime.enable_peer_access(0), Err(DeviceError::PeerAccessUnsupported { device: 2, peer: 0 }));
    }

    #[test]
    fn memory_limit() {
        let runtime = HostRuntime::new(1).with_memory_limit(0, 64);
        runtime.set_device(0).unwrap();
        let p: DevicePtr<f32> = runtime.alloc(8).unwrap();
        assert_eq!(runtime.memory_info().unwrap(), MemoryInfo { free: 32, total: 64 });
        assert_eq!(runtime.alloc::<f32>(9), Err(DeviceError::OutOfMemory));
        runtime.free(p.as_raw()).unwrap();
        assert_eq!(runtime.memory_info().unwrap().free, 64);
    }
}
