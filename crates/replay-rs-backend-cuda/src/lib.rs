//! CUDA backend for `replay-rs`.
//!
//! The driver library is loaded at runtime, so the crate builds and its tests run on machines
//! without a GPU; [`CudaBackend::is_available`] reports whether a device can be used. All work
//! is issued on one non-blocking stream, which is also the stream graphs are captured from.

mod capture;
mod device;

use std::fmt;
use std::sync::Arc;

use replay_rs::backend::spec::{
    check_span, BackendError, BackendResult, DeviceBackend, DeviceBuffer,
};
use replay_rs::tensor::DType;

pub use capture::CudaGraphCapture;

use device::{CudaDriver, DeviceAllocation};

/// A device allocation with a fixed element type.
pub struct CudaBuffer {
    allocation: DeviceAllocation,
    dtype: DType,
    capacity: usize,
}

impl DeviceBuffer for CudaBuffer {
    fn device_ptr(&self) -> u64 {
        self.allocation.device_ptr()
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn byte_len(&self) -> usize {
        self.allocation.bytes()
    }
}

impl fmt::Debug for CudaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaBuffer")
            .field("dtype", &self.dtype)
            .field("capacity", &self.capacity)
            .field("allocation", &self.allocation)
            .finish()
    }
}

/// CUDA backend (GPU-only contract).
pub struct CudaBackend {
    driver: Arc<CudaDriver>,
}

impl CudaBackend {
    pub fn new() -> BackendResult<Self> {
        Ok(Self {
            driver: device::driver()?,
        })
    }

    pub fn is_available() -> bool {
        device::is_available()
    }

    /// Whether the backend stream is recording a graph.
    pub fn is_capturing(&self) -> BackendResult<bool> {
        self.driver.is_capturing()
    }

    pub(crate) fn driver(&self) -> &Arc<CudaDriver> {
        &self.driver
    }

    fn byte_span(dtype: DType, offset: usize, elements: usize) -> (u64, usize) {
        let width = dtype.size_in_bytes();
        ((offset * width) as u64, elements * width)
    }
}

impl DeviceBackend for CudaBackend {
    type Buffer = CudaBuffer;

    fn backend_name(&self) -> &str {
        "cuda"
    }

    fn allocate(&self, dtype: DType, elements: usize) -> BackendResult<Arc<CudaBuffer>> {
        let bytes = elements
            .checked_mul(dtype.size_in_bytes())
            .ok_or_else(|| BackendError::execution("allocation size overflows usize"))?;
        Ok(Arc::new(CudaBuffer {
            allocation: self.driver.alloc_zeroed(bytes)?,
            dtype,
            capacity: elements,
        }))
    }

    fn upload(&self, dtype: DType, bytes: &[u8]) -> BackendResult<Arc<CudaBuffer>> {
        let width = dtype.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(BackendError::execution(format!(
                "upload of {} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        Ok(Arc::new(CudaBuffer {
            allocation: self.driver.alloc_and_upload(bytes)?,
            dtype,
            capacity: bytes.len() / width,
        }))
    }

    fn download(
        &self,
        buffer: &CudaBuffer,
        offset: usize,
        elements: usize,
    ) -> BackendResult<Vec<u8>> {
        check_span(buffer, offset, elements)?;
        let (start, bytes) = Self::byte_span(buffer.dtype, offset, elements);
        self.driver.download(buffer.device_ptr() + start, bytes)
    }

    fn copy_span(
        &self,
        dst: &Arc<CudaBuffer>,
        dst_offset: usize,
        src: &Arc<CudaBuffer>,
        src_offset: usize,
        elements: usize,
    ) -> BackendResult<()> {
        if dst.dtype != src.dtype {
            return Err(BackendError::execution(format!(
                "copy from {} buffer into {} buffer",
                src.dtype, dst.dtype
            )));
        }
        check_span(dst.as_ref(), dst_offset, elements)?;
        check_span(src.as_ref(), src_offset, elements)?;
        let (dst_start, bytes) = Self::byte_span(dst.dtype, dst_offset, elements);
        let (src_start, _) = Self::byte_span(src.dtype, src_offset, elements);
        self.driver.copy_device_to_device(
            dst.device_ptr() + dst_start,
            src.device_ptr() + src_start,
            bytes,
        )
    }

    fn synchronize(&self) -> BackendResult<()> {
        self.driver.synchronize()
    }
}
