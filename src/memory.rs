use crate::devices::DevicePool;
use crate::error::{KMeansError, Result};
use crate::runtime::{DeviceId, DevicePtr, DeviceRepr, Runtime};
use tracing::{error, trace};

/// One device's entry of a [`DistributedBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSlot<T> {
    /// Allocated by the run, freed together with the buffer.
    Owned(DevicePtr<T>),
    /// Aliases memory owned by someone else (the caller, or another buffer). Never freed here.
    Borrowed(DevicePtr<T>),
}
impl<T> DeviceSlot<T> {
    pub fn ptr(&self) -> DevicePtr<T> {
        match *self {
            DeviceSlot::Owned(p) | DeviceSlot::Borrowed(p) => p,
        }
    }
    pub fn is_owned(&self) -> bool {
        matches!(self, DeviceSlot::Owned(_))
    }
}

/// Where the initial content of a distributed buffer comes from.
#[derive(Debug, Clone, Copy)]
pub enum Origin<'a, T> {
    /// Host memory, uploaded to every device.
    Host(&'a [T]),
    /// Memory on `device`, peer-copied to every other device of the pool.
    Device { device: DeviceId, ptr: DevicePtr<T> },
}

/// A logical array replicated over all devices of a [`DevicePool`].
///
/// Entry `i` always lives on `pool.get(i)`. Each entry is independently owned or borrowed,
/// see [`DeviceSlot`]; dropping the buffer frees exactly the owned entries.
pub struct DistributedBuffer<'r, R: Runtime, T: DeviceRepr> {
    runtime: &'r R,
    devices: Vec<DeviceId>,
    slots: Vec<DeviceSlot<T>>,
    len: usize,
}

impl<'r, R: Runtime, T: DeviceRepr> DistributedBuffer<'r, R, T> {
    /// Allocate `len` elements on every device of `pool`.
    pub fn allocate(runtime: &'r R, pool: &DevicePool, len: usize) -> Result<Self> {
        Self::allocate_or_borrow(runtime, pool, len, None)
    }

    /// Allocate `len` elements on every device of `pool`, except on `borrowed.0` where the
    /// caller-supplied pointer `borrowed.1` is used as is.
    pub fn allocate_or_borrow(
        runtime: &'r R, pool: &DevicePool, len: usize, borrowed: Option<(DeviceId, DevicePtr<T>)>,
    ) -> Result<Self> {
        let mut buffer = Self { runtime, devices: pool.ids().to_vec(), slots: Vec::with_capacity(pool.len()), len };
        pool.for_each(runtime, |_, dev| {
            let slot = match borrowed {
                Some((bdev, ptr)) if bdev == dev => DeviceSlot::Borrowed(ptr),
                _ => DeviceSlot::Owned(runtime.alloc::<T>(len).map_err(KMeansError::MemoryAllocation)?),
            };
            trace!("device #{}: {:?}", dev, slot);
            // pushed right away so that a later failure still frees it
            buffer.slots.push(slot);
            Ok(())
        })?;
        Ok(buffer)
    }

    /// Reinterpret this buffer as `len` elements of `U` on every device.
    ///
    /// The view never owns its memory. It must not be used after `self` was dropped.
    pub fn alias<U: DeviceRepr>(&self, len: usize) -> Result<DistributedBuffer<'r, R, U>> {
        let needed = len * std::mem::size_of::<U>();
        let capacity = self.len * std::mem::size_of::<T>();
        if needed > capacity {
            return Err(KMeansError::runtime(format!("alias of {} bytes exceeds buffer capacity of {} bytes", needed, capacity)));
        }
        Ok(DistributedBuffer {
            runtime: self.runtime,
            devices: self.devices.clone(),
            slots: self.slots.iter().map(|s| DeviceSlot::Borrowed(s.ptr().cast())).collect(),
            len,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of devices the buffer spans.
    pub fn device_count(&self) -> usize {
        self.slots.len()
    }

    pub fn ptr(&self, devi: usize) -> DevicePtr<T> {
        self.slots[devi].ptr()
    }

    pub fn slot(&self, devi: usize) -> DeviceSlot<T> {
        self.slots[devi]
    }

    pub fn device(&self, devi: usize) -> DeviceId {
        self.devices[devi]
    }

    /// Iterate over `(device, pointer)` pairs in pool order.
    pub fn iter(&self) -> impl Iterator<Item = (DeviceId, DevicePtr<T>)> + '_ {
        self.devices.iter().cloned().zip(self.slots.iter().map(DeviceSlot::ptr))
    }

    /// Fill the first `count` elements on every device from `origin`.
    ///
    /// Host origins are uploaded to each device's stream; device origins are peer-copied to all
    /// other devices (the origin device already holds the data).
    pub fn distribute(&self, pool: &DevicePool, origin: Origin<'_, T>, count: usize) -> Result<()> {
        let runtime = self.runtime;
        match origin {
            Origin::Host(src) => pool.for_each(runtime, |devi, _| {
                runtime.copy_from_host_async(self.ptr(devi), &src[..count]).map_err(KMeansError::MemoryCopy)
            }),
            Origin::Device { device, ptr } => pool.for_each(runtime, |devi, dev| {
                if dev == device {
                    return Ok(());
                }
                runtime.copy_peer_async(self.ptr(devi), dev, ptr, device, count).map_err(KMeansError::MemoryCopy)
            }),
        }
    }

    /// On every device, copy `count` elements from `src` at `src_offset` into this buffer at
    /// `dst_offset`. Both buffers must span the same pool.
    pub fn copy_from_async(
        &self, pool: &DevicePool, dst_offset: usize, src: &DistributedBuffer<'_, R, T>, src_offset: usize, count: usize,
    ) -> Result<()> {
        let runtime = self.runtime;
        pool.for_each(runtime, |devi, _| {
            runtime
                .copy_on_device_async(self.ptr(devi).offset(dst_offset), src.ptr(devi).offset(src_offset), count)
                .map_err(KMeansError::MemoryCopy)
        })
    }

    /// Blocking copy of the first `dst.len()` elements on pool position `devi` into `dst`.
    pub fn download(&self, devi: usize, dst: &mut [T]) -> Result<()> {
        self.runtime.copy_to_host(dst, self.ptr(devi)).map_err(KMeansError::MemoryCopy)
    }
}

impl<'r, R: Runtime, T: DeviceRepr> Drop for DistributedBuffer<'r, R, T> {
    fn drop(&mut self) {
        for (&dev, slot) in self.devices.iter().zip(self.slots.iter()) {
            if let DeviceSlot::Owned(ptr) = slot {
                let freed = self.runtime.set_device(dev).and_then(|_| self.runtime.free(ptr.as_raw()));
                if let Err(e) = freed {
                    error!("failed to free {:?} on device #{}: {}", ptr, dev, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::HostRuntime;

    #[test]
    fn owned_slots_are_freed_borrowed_are_not() {
        let runtime = HostRuntime::new(2);
        runtime.set_device(1).unwrap();
        let caller: DevicePtr<f32> = runtime.alloc(6).unwrap();

        let pool = DevicePool::from_devices(vec![0, 1]).unwrap();
        {
            let buffer = DistributedBuffer::allocate_or_borrow(&runtime, &pool, 6, Some((1, caller))).unwrap();
            assert!(buffer.slot(0).is_owned());
            assert_eq!(buffer.slot(1), DeviceSlot::Borrowed(caller));
            assert_eq!(buffer.device_count(), 2);
            assert_eq!(runtime.allocation_count(), 2);

            let view = buffer.alias::<u32>(6).unwrap();
            assert_eq!(view.ptr(0).as_raw(), buffer.ptr(0).as_raw());
            assert!(!view.slot(0).is_owned());
            assert!(buffer.alias::<u32>(7).is_err());
        }
        assert_eq!(runtime.allocation_count(), 1);
    }

    #[test]
    fn allocation_failure() {
        let runtime = HostRuntime::new(2).with_memory_limit(1, 16);
        let pool = DevicePool::from_devices(vec![0, 1]).unwrap();
        let res = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 8);
        assert!(matches!(res, Err(KMeansError::MemoryAllocation(_))));
        // the slot allocated on device 0 has been released again
        assert_eq!(runtime.allocation_count(), 0);
    }

    #[test]
    fn distribute_from_host() {
        let runtime = HostRuntime::new(2);
        let pool = DevicePool::from_devices(vec![0, 1]).unwrap();
        let buffer = DistributedBuffer::<_, u32>::allocate(&runtime, &pool, 3).unwrap();
        buffer.distribute(&pool, Origin::Host(&[1, 2, 3][..]), 3).unwrap();
        for devi in 0..2 {
            let mut host = [0u32; 3];
            buffer.download(devi, &mut host).unwrap();
            assert_eq!(host, [1, 2, 3]);
        }
    }

    #[test]
    fn distribute_from_peer_skips_origin() {
        let runtime = HostRuntime::new(3);
        let pool = DevicePool::setup(&runtime, 0b111, None).unwrap();
        runtime.set_device(1).unwrap();
        let caller: DevicePtr<f32> = runtime.alloc(2).unwrap();
        runtime.copy_from_host_async(caller, &[4.0, 5.0]).unwrap();
        let uploaded = runtime.host_to_device_bytes();

        let buffer = DistributedBuffer::allocate_or_borrow(&runtime, &pool, 2, Some((1, caller))).unwrap();
        buffer.distribute(&pool, Origin::Device { device: 1, ptr: caller }, 2).unwrap();
        assert_eq!(runtime.host_to_device_bytes(), uploaded);
        for devi in 0..3 {
            let mut host = [0.0f32; 2];
            buffer.download(devi, &mut host).unwrap();
            assert_eq!(host, [4.0, 5.0]);
        }
    }

    #[test]
    fn peer_copy_without_access_fails() {
        let runtime = HostRuntime::new(2).with_peer_capability(0, 1, false);
        let pool = DevicePool::setup(&runtime, 0b01, Some(1)).unwrap();
        runtime.set_device(1).unwrap();
        let caller: DevicePtr<f32> = runtime.alloc(2).unwrap();
        let buffer = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 2).unwrap();
        let res = buffer.distribute(&pool, Origin::Device { device: 1, ptr: caller }, 2);
        assert!(matches!(res, Err(KMeansError::MemoryCopy(_))));
    }

    #[test]
    fn copy_rows_between_buffers() {
        let runtime = HostRuntime::new(2);
        let pool = DevicePool::from_devices(vec![0, 1]).unwrap();
        let samples = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 6).unwrap();
        samples.distribute(&pool, Origin::Host(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0][..]), 6).unwrap();
        let centroids = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 4).unwrap();
        centroids.copy_from_async(&pool, 2, &samples, 4, 2).unwrap();
        let ids: Vec<_> = centroids.iter().map(|(dev, _)| dev).collect();
        assert_eq!(ids, vec![0, 1]);
        for devi in 0..2 {
            let mut host = [9.0f32; 4];
            centroids.download(devi, &mut host).unwrap();
            assert_eq!(host, [0.0, 0.0, 4.0, 5.0]);
        }
    }
}
