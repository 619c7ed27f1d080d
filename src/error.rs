use crate::runtime::DeviceError;
use thiserror::Error;

/// Errors that abort a k-means run.
///
/// Every variant maps to one of the [`ResultCode`]s returned by [`ResultCode::of`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KMeansError {
    /// Malformed caller input, detected before any device work starts.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),
    /// No usable device remained after filtering, or a device id was out of range.
    #[error("no such device")]
    NoSuchDevice,
    /// A host <-> device or device <-> device copy failed.
    #[error("memory copy failed: {0}")]
    MemoryCopy(#[source] DeviceError),
    /// A device allocation failed.
    #[error("memory allocation failed: {0}")]
    MemoryAllocation(#[source] DeviceError),
    /// Kernel setup / execution failure or an internal consistency violation.
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl KMeansError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        KMeansError::InvalidArguments(msg.into())
    }

    pub(crate) fn runtime(msg: impl Into<String>) -> Self {
        KMeansError::Runtime(msg.into())
    }

    pub fn code(&self) -> ResultCode {
        match self {
            KMeansError::InvalidArguments(_) => ResultCode::InvalidArguments,
            KMeansError::NoSuchDevice => ResultCode::NoSuchDevice,
            KMeansError::MemoryCopy(_) => ResultCode::MemoryCopyError,
            KMeansError::MemoryAllocation(_) => ResultCode::MemoryAllocationError,
            KMeansError::Runtime(_) => ResultCode::RuntimeError,
        }
    }
}

pub type Result<T> = std::result::Result<T, KMeansError>;

/// Flat status code of a run, for callers that only want to branch on the outcome.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResultCode {
    Success = 0,
    InvalidArguments = 1,
    NoSuchDevice = 2,
    MemoryAllocationError = 3,
    RuntimeError = 4,
    MemoryCopyError = 5,
}

impl ResultCode {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ResultCode::Success,
            Err(e) => e.code(),
        }
    }
}
