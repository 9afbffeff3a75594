//! Minimal host-memory backend for unit tests inside this crate.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::backend::spec::{check_span, BackendError, BackendResult, DeviceBackend, DeviceBuffer};
use crate::tensor::DType;

/// Misbehaviour the next `allocate` call builds into its buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AllocFault {
    /// Reports a different address on every read.
    DriftingAddress,
    /// Reports half the requested capacity.
    ShortCapacity,
    /// Holds `I32` for float requests and `F32` otherwise.
    WrongDtype,
}

#[derive(Debug)]
pub(crate) struct HostBuffer {
    dtype: DType,
    capacity: usize,
    ptr: AtomicU64,
    drifts: bool,
    bytes: Mutex<Box<[u8]>>,
}

impl DeviceBuffer for HostBuffer {
    fn device_ptr(&self) -> u64 {
        if self.drifts {
            self.ptr.fetch_add(1, Ordering::Relaxed)
        } else {
            self.ptr.load(Ordering::Relaxed)
        }
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

#[derive(Debug, Default)]
pub(crate) struct HostBackend {
    pub(crate) allocations: AtomicUsize,
    pub(crate) copies: AtomicUsize,
    fault: Mutex<Option<AllocFault>>,
}

impl HostBackend {
    /// Arms `fault` for the next allocation only.
    pub(crate) fn inject(&self, fault: AllocFault) {
        *self.fault.lock().expect("fault mutex poisoned") = Some(fault);
    }

    fn buffer_from(dtype: DType, capacity: usize, bytes: Box<[u8]>) -> HostBuffer {
        let ptr = bytes.as_ptr() as u64;
        HostBuffer {
            dtype,
            capacity,
            ptr: AtomicU64::new(ptr),
            drifts: false,
            bytes: Mutex::new(bytes),
        }
    }
}

impl DeviceBackend for HostBackend {
    type Buffer = HostBuffer;

    fn backend_name(&self) -> &str {
        "host-test"
    }

    fn allocate(&self, dtype: DType, elements: usize) -> BackendResult<Arc<HostBuffer>> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        let fault = self.fault.lock().expect("fault mutex poisoned").take();
        let dtype = match (fault, dtype) {
            (Some(AllocFault::WrongDtype), DType::F32) => DType::I32,
            (Some(AllocFault::WrongDtype), _) => DType::F32,
            _ => dtype,
        };
        // Never hand out a zero-sized allocation: its address would not be unique.
        let bytes = vec![0u8; elements.max(1) * dtype.size_in_bytes()].into_boxed_slice();
        let mut buffer = Self::buffer_from(dtype, elements, bytes);
        match fault {
            Some(AllocFault::DriftingAddress) => buffer.drifts = true,
            Some(AllocFault::ShortCapacity) => buffer.capacity = elements / 2,
            _ => {}
        }
        Ok(Arc::new(buffer))
    }

    fn upload(&self, dtype: DType, bytes: &[u8]) -> BackendResult<Arc<HostBuffer>> {
        if bytes.len() % dtype.size_in_bytes() != 0 {
            return Err(BackendError::execution("upload is not a whole number of elements"));
        }
        let capacity = bytes.len() / dtype.size_in_bytes();
        let mut storage = bytes.to_vec();
        storage.resize(bytes.len().max(dtype.size_in_bytes()), 0);
        Ok(Arc::new(Self::buffer_from(
            dtype,
            capacity,
            storage.into_boxed_slice(),
        )))
    }

    fn download(
        &self,
        buffer: &HostBuffer,
        offset: usize,
        elements: usize,
    ) -> BackendResult<Vec<u8>> {
        check_span(buffer, offset, elements)?;
        let width = buffer.dtype.size_in_bytes();
        let bytes = buffer.bytes.lock().expect("host buffer mutex poisoned");
        Ok(bytes[offset * width..(offset + elements) * width].to_vec())
    }

    fn copy_span(
        &self,
        dst: &Arc<HostBuffer>,
        dst_offset: usize,
        src: &Arc<HostBuffer>,
        src_offset: usize,
        elements: usize,
    ) -> BackendResult<()> {
        check_span(dst.as_ref(), dst_offset, elements)?;
        check_span(src.as_ref(), src_offset, elements)?;
        self.copies.fetch_add(1, Ordering::Relaxed);
        let width = dst.dtype.size_in_bytes();
        let data = self.download(src, src_offset, elements)?;
        let mut bytes = dst.bytes.lock().expect("host buffer mutex poisoned");
        bytes[dst_offset * width..(dst_offset + elements) * width].copy_from_slice(&data);
        Ok(())
    }
}
