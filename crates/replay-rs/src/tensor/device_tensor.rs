//! Strided views over backend buffers.

use std::fmt;
use std::mem::size_of;
use std::sync::Arc;

use crate::backend::spec::{BackendError, BackendResult, DeviceBackend, DeviceBuffer};

use super::dtype::{DType, Element};
use super::shape::{logical_offsets, storage_extent, Shape, Strides};

/// A logical tensor: a shape and element strides laid over a device buffer at some offset.
///
/// The buffer is shared; cloning a tensor clones the view, never the storage.
pub struct DeviceTensor<B: DeviceBackend> {
    buffer: Arc<B::Buffer>,
    shape: Shape,
    strides: Strides,
    storage_offset: usize,
}

impl<B: DeviceBackend> DeviceTensor<B> {
    /// Builds a view, checking that it addresses only elements inside `buffer`.
    pub fn new(
        buffer: Arc<B::Buffer>,
        shape: Shape,
        strides: Strides,
        storage_offset: usize,
    ) -> BackendResult<Self> {
        if shape.rank() != strides.rank() {
            return Err(BackendError::execution(format!(
                "stride rank {} does not match shape rank {}",
                strides.rank(),
                shape.rank()
            )));
        }
        let extent = storage_extent(&shape, &strides);
        let end = storage_offset
            .checked_add(extent)
            .ok_or_else(|| BackendError::execution("tensor view end overflows usize"))?;
        if end > buffer.capacity() {
            return Err(BackendError::execution(format!(
                "view of shape {:?} strides {:?} at offset {} needs {} elements, storage holds {}",
                shape.dims(),
                strides.as_slice(),
                storage_offset,
                end,
                buffer.capacity()
            )));
        }
        Ok(Self {
            buffer,
            shape,
            strides,
            storage_offset,
        })
    }

    /// Row-major view over the start of `buffer`.
    pub fn contiguous(buffer: Arc<B::Buffer>, shape: Shape) -> BackendResult<Self> {
        let strides = Strides::contiguous(&shape);
        Self::new(buffer, shape, strides, 0)
    }

    /// Uploads `data` and returns a row-major tensor of `shape` over it.
    pub fn from_slice<T: Element>(backend: &B, shape: Shape, data: &[T]) -> BackendResult<Self> {
        if data.len() != shape.num_elements() {
            return Err(BackendError::execution(format!(
                "tensor data length ({}) does not match shape {:?}",
                data.len(),
                shape.dims()
            )));
        }
        let buffer = backend.upload(T::DTYPE, bytemuck::cast_slice(data))?;
        Self::contiguous(buffer, shape)
    }

    /// Uploads a whole storage and lays an arbitrary strided view over it.
    pub fn from_storage<T: Element>(
        backend: &B,
        storage: &[T],
        shape: Shape,
        strides: Strides,
        storage_offset: usize,
    ) -> BackendResult<Self> {
        let buffer = backend.upload(T::DTYPE, bytemuck::cast_slice(storage))?;
        Self::new(buffer, shape, strides, storage_offset)
    }

    pub fn buffer(&self) -> &Arc<B::Buffer> {
        &self.buffer
    }

    pub fn dtype(&self) -> DType {
        self.buffer.dtype()
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &Strides {
        &self.strides
    }

    pub fn storage_offset(&self) -> usize {
        self.storage_offset
    }

    /// Raw storage length in elements: the capacity of the underlying buffer.
    pub fn storage_len(&self) -> usize {
        self.buffer.capacity()
    }

    /// Elements the view touches, measured from its storage offset.
    pub fn extent(&self) -> usize {
        storage_extent(&self.shape, &self.strides)
    }

    /// Base address of the underlying buffer.
    pub fn device_ptr(&self) -> u64 {
        self.buffer.device_ptr()
    }

    /// Reads the logical values of the view in row-major order.
    pub fn to_vec<T: Element>(&self, backend: &B) -> BackendResult<Vec<T>> {
        if T::DTYPE != self.dtype() {
            return Err(BackendError::execution(format!(
                "cannot read {} tensor as {}",
                self.dtype(),
                T::DTYPE
            )));
        }
        let extent = self.extent();
        let bytes = backend.download(&self.buffer, self.storage_offset, extent)?;
        let storage: Vec<T> = bytes
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect();
        Ok(logical_offsets(&self.shape, &self.strides)
            .into_iter()
            .map(|offset| storage[offset])
            .collect())
    }
}

impl<B: DeviceBackend> Clone for DeviceTensor<B> {
    fn clone(&self) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            shape: self.shape.clone(),
            strides: self.strides.clone(),
            storage_offset: self.storage_offset,
        }
    }
}

impl<B: DeviceBackend> fmt::Debug for DeviceTensor<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceTensor")
            .field("dtype", &self.dtype())
            .field("shape", &self.shape.dims())
            .field("strides", &self.strides.as_slice())
            .field("storage_offset", &self.storage_offset)
            .field("ptr", &format_args!("{:#x}", self.device_ptr()))
            .finish()
    }
}
