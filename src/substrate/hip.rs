//! HIP substrate adapter: `hipMalloc`/`hipFree` behind [`SubstrateAllocator`].
//!
//! The arena sits on top of this in production; the adapter can also be used
//! on its own as a plain, non-caching device allocator.

use std::ffi::CStr;
use std::ptr;

use super::ffi;
use super::{DevicePtr, SubstrateAllocator, SubstrateError};

/// Render a HIP status code through `hipGetErrorString`.
fn error_string(code: i32) -> String {
    // SAFETY: hipGetErrorString returns a pointer to a static,
    // NUL-terminated string for every status code.
    let s = unsafe { CStr::from_ptr(ffi::hipGetErrorString(code)) };
    s.to_string_lossy().into_owned()
}

/// Substrate adapter bound to one HIP device.
#[derive(Debug)]
pub struct HipSubstrate {
    device: i32,
}

impl HipSubstrate {
    /// Bind to device 0.
    pub fn new() -> Result<Self, SubstrateError> {
        Self::with_device(0)
    }

    /// Bind to a specific device ordinal.
    pub fn with_device(device: i32) -> Result<Self, SubstrateError> {
        let code = unsafe { ffi::hipInit(0) };
        if code != ffi::HIP_SUCCESS {
            return Err(SubstrateError::DeviceUnavailable(format!(
                "hipInit failed with code {}: {}",
                code,
                error_string(code)
            )));
        }

        let mut count: i32 = 0;
        let code = unsafe { ffi::hipGetDeviceCount(&mut count) };
        if code != ffi::HIP_SUCCESS {
            return Err(SubstrateError::DeviceUnavailable(format!(
                "hipGetDeviceCount failed with code {}: {}",
                code,
                error_string(code)
            )));
        }
        if device < 0 || device >= count {
            return Err(SubstrateError::DeviceUnavailable(format!(
                "device {} out of range ({} devices present)",
                device, count
            )));
        }

        let code = unsafe { ffi::hipSetDevice(device) };
        if code != ffi::HIP_SUCCESS {
            return Err(SubstrateError::DeviceUnavailable(format!(
                "hipSetDevice({}) failed with code {}: {}",
                device,
                code,
                error_string(code)
            )));
        }

        tracing::debug!(device, "HIP substrate bound");
        Ok(HipSubstrate { device })
    }

    /// The device ordinal this substrate allocates on.
    pub fn device(&self) -> i32 {
        self.device
    }

    /// Free and total device memory in bytes, via `hipMemGetInfo`.
    pub fn mem_info(&self) -> Result<(usize, usize), SubstrateError> {
        let mut free: usize = 0;
        let mut total: usize = 0;
        let code = unsafe { ffi::hipMemGetInfo(&mut free, &mut total) };
        if code != ffi::HIP_SUCCESS {
            return Err(SubstrateError::QueryFailed(format!(
                "hipMemGetInfo failed with code {}: {}",
                code,
                error_string(code)
            )));
        }
        Ok((free, total))
    }
}

impl SubstrateAllocator for HipSubstrate {
    fn raw_alloc(&mut self, size: usize) -> Result<DevicePtr, SubstrateError> {
        let mut raw: *mut std::ffi::c_void = ptr::null_mut();

        tracing::trace!(size, "hipMalloc");
        let code = unsafe { ffi::hipMalloc(&mut raw, size) };
        if code != ffi::HIP_SUCCESS {
            tracing::error!(size, code, "hipMalloc failed");
            return Err(SubstrateError::AllocationFailed {
                size,
                reason: format!("hipMalloc failed with code {}: {}", code, error_string(code)),
            });
        }

        // Some driver versions report success and still hand back null.
        if raw.is_null() {
            tracing::error!(size, "hipMalloc returned null pointer");
            return Err(SubstrateError::AllocationFailed {
                size,
                reason: "hipMalloc returned null pointer".to_string(),
            });
        }

        tracing::debug!(size, addr = raw as usize, "device block allocated");
        Ok(DevicePtr::from_raw(raw))
    }

    fn raw_free(&mut self, ptr: DevicePtr) {
        let code = unsafe { ffi::hipFree(ptr.as_raw()) };
        if code != ffi::HIP_SUCCESS {
            // Not recoverable by the caller; log and continue.
            tracing::error!(
                addr = ptr.addr(),
                code,
                error = %error_string(code),
                "hipFree failed"
            );
        } else {
            tracing::debug!(addr = ptr.addr(), "device block freed");
        }
    }
}
