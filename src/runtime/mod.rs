//! Accelerator runtime primitives the orchestration layer is written against.
//!
//! The [`Runtime`] trait mirrors the shape of a typical accelerator runtime API: a "current
//! device" that every allocation, copy and synchronization is issued against, one asynchronous
//! command stream per device, and explicit peer access between devices. Addresses are plain
//! integers, exactly like a device pointer; [`DevicePtr`] adds the element type on top.
//!
//! [`HostRuntime`] is a simulated implementation backed by host memory.

mod host;

pub use host::HostRuntime;

use bytemuck::Pod;
use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Opaque handle of one accelerator.
pub type DeviceId = u32;

/// Element types that can live in device memory.
pub trait DeviceRepr: Pod + Send + Sync + fmt::Debug {}
impl DeviceRepr for f32 {}
impl DeviceRepr for u32 {}

/// Failure reported by a [`Runtime`] primitive.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("invalid device ordinal {0}")]
    InvalidDevice(DeviceId),
    #[error("device {0} is unavailable")]
    DeviceUnavailable(DeviceId),
    #[error("no device selected as current")]
    NoCurrentDevice,
    #[error("out of device memory")]
    OutOfMemory,
    #[error("invalid value")]
    InvalidValue,
    #[error("invalid device address {0:#x}")]
    InvalidAddress(u64),
    #[error("peer access {device} -> {peer} is not supported")]
    PeerAccessUnsupported { device: DeviceId, peer: DeviceId },
    #[error("peer access is already enabled")]
    PeerAccessAlreadyEnabled,
    #[error("peer access between {0} and {1} has not been enabled")]
    PeerAccessNotEnabled(DeviceId, DeviceId),
}

/// Compute capability (architecture version) of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ComputeCapability {
    pub major: u32,
    pub minor: u32,
}
impl ComputeCapability {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Packed half-precision pairs (fp16x2) need at least architecture 6.0.
    pub fn supports_fp16x2(&self) -> bool {
        self.major >= 6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryInfo {
    pub free: usize,
    pub total: usize,
}

/// Typed device address.
pub struct DevicePtr<T> {
    addr: u64,
    _p: PhantomData<fn() -> T>,
}
impl<T> Clone for DevicePtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for DevicePtr<T> {}
impl<T> PartialEq for DevicePtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr
    }
}
impl<T> Eq for DevicePtr<T> {}
impl<T> fmt::Debug for DevicePtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DevicePtr({:#x})", self.addr)
    }
}
impl<T> DevicePtr<T> {
    pub const fn null() -> Self {
        Self::from_raw(0)
    }
    pub const fn from_raw(addr: u64) -> Self {
        Self { addr, _p: PhantomData }
    }
    pub fn as_raw(&self) -> u64 {
        self.addr
    }
    pub fn is_null(&self) -> bool {
        self.addr == 0
    }
    /// Pointer to the element `count` elements behind this one.
    pub fn offset(self, count: usize) -> Self {
        Self::from_raw(self.addr + (count * std::mem::size_of::<T>()) as u64)
    }
    pub fn cast<U>(self) -> DevicePtr<U> {
        DevicePtr::from_raw(self.addr)
    }
}

/// Accelerator runtime primitives.
///
/// All methods take `&self`: the runtime is driven from a single host thread and keeps its
/// current-device state internally. Copies suffixed with `_async` are enqueued on the current
/// device's stream and only guaranteed to have landed after [`Runtime::synchronize`].
pub trait Runtime {
    fn device_count(&self) -> Result<u32, DeviceError>;
    /// Select `device` as the target of all following operations.
    fn set_device(&self, device: DeviceId) -> Result<(), DeviceError>;
    fn compute_capability(&self, device: DeviceId) -> Result<ComputeCapability, DeviceError>;
    fn can_access_peer(&self, device: DeviceId, peer: DeviceId) -> Result<bool, DeviceError>;
    /// Allow the current device to access `peer`'s memory.
    fn enable_peer_access(&self, peer: DeviceId) -> Result<(), DeviceError>;
    /// Memory statistics of the current device.
    fn memory_info(&self) -> Result<MemoryInfo, DeviceError>;

    /// Allocate `bytes` zeroed bytes on the current device.
    fn malloc(&self, bytes: usize) -> Result<u64, DeviceError>;
    fn free(&self, addr: u64) -> Result<(), DeviceError>;

    fn memcpy_htod_async(&self, dst: u64, src: &[u8]) -> Result<(), DeviceError>;
    /// Blocking device -> host copy.
    fn memcpy_dtoh(&self, dst: &mut [u8], src: u64) -> Result<(), DeviceError>;
    /// Copy within the current device's memory.
    fn memcpy_dtod_async(&self, dst: u64, src: u64, bytes: usize) -> Result<(), DeviceError>;
    fn memcpy_peer_async(
        &self, dst: u64, dst_device: DeviceId, src: u64, src_device: DeviceId, bytes: usize,
    ) -> Result<(), DeviceError>;
    /// Blocking variant of [`Runtime::memcpy_peer_async`].
    fn memcpy_peer(
        &self, dst: u64, dst_device: DeviceId, src: u64, src_device: DeviceId, bytes: usize,
    ) -> Result<(), DeviceError>;
    /// Wait until the current device's stream drained.
    fn synchronize(&self) -> Result<(), DeviceError>;

    fn alloc<T: DeviceRepr>(&self, count: usize) -> Result<DevicePtr<T>, DeviceError>
    where
        Self: Sized,
    {
        self.malloc(count * std::mem::size_of::<T>()).map(DevicePtr::from_raw)
    }

    fn copy_from_host_async<T: DeviceRepr>(&self, dst: DevicePtr<T>, src: &[T]) -> Result<(), DeviceError>
    where
        Self: Sized,
    {
        self.memcpy_htod_async(dst.as_raw(), bytemuck::cast_slice(src))
    }

    fn copy_to_host<T: DeviceRepr>(&self, dst: &mut [T], src: DevicePtr<T>) -> Result<(), DeviceError>
    where
        Self: Sized,
    {
        self.memcpy_dtoh(bytemuck::cast_slice_mut(dst), src.as_raw())
    }

    fn copy_on_device_async<T: DeviceRepr>(
        &self, dst: DevicePtr<T>, src: DevicePtr<T>, count: usize,
    ) -> Result<(), DeviceError>
    where
        Self: Sized,
    {
        self.memcpy_dtod_async(dst.as_raw(), src.as_raw(), count * std::mem::size_of::<T>())
    }

    fn copy_peer_async<T: DeviceRepr>(
        &self, dst: DevicePtr<T>, dst_device: DeviceId, src: DevicePtr<T>, src_device: DeviceId, count: usize,
    ) -> Result<(), DeviceError>
    where
        Self: Sized,
    {
        self.memcpy_peer_async(dst.as_raw(), dst_device, src.as_raw(), src_device, count * std::mem::size_of::<T>())
    }

    fn copy_peer<T: DeviceRepr>(
        &self, dst: DevicePtr<T>, dst_device: DeviceId, src: DevicePtr<T>, src_device: DeviceId, count: usize,
    ) -> Result<(), DeviceError>
    where
        Self: Sized,
    {
        self.memcpy_peer(dst.as_raw(), dst_device, src.as_raw(), src_device, count * std::mem::size_of::<T>())
    }
}
