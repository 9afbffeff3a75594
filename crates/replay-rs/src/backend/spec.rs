use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::tensor::DType;

/// Backend error surfaced to higher layers.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend execution failure: {message}")]
    Execution { message: String },

    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },

    /// A pooled buffer moved while an input was copied into it. The captured graph would
    /// silently read stale memory, so the call is aborted.
    #[error(
        "bound input {position} changed address during binding: expected {expected:#x}, got {actual:#x}"
    )]
    AddressInstability {
        position: usize,
        expected: u64,
        actual: u64,
    },

    #[error(
        "input {position} needs {required} elements of storage but its buffer holds {capacity}"
    )]
    CapacityExceeded {
        position: usize,
        required: usize,
        capacity: usize,
    },

    #[error("input signature mismatch: expected {expected}, got {actual}")]
    SignatureMismatch { expected: String, actual: String },

    #[error("input {position} is symbolic and carries no data to bind")]
    SymbolicInput { position: usize },

    #[error("graph capture failed: {message}")]
    Capture { message: String },
}

impl BackendError {
    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }

    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn capture(message: impl Into<String>) -> Self {
        BackendError::Capture {
            message: message.into(),
        }
    }

    pub fn signature(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        BackendError::SignatureMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// A device allocation with a fixed element type, a fixed capacity and a stable base address.
///
/// Implementations must never move the allocation: `device_ptr` returns the same value for the
/// whole lifetime of the buffer.
pub trait DeviceBuffer: fmt::Debug + Send + Sync + 'static {
    /// Base address of the allocation in the device address space.
    fn device_ptr(&self) -> u64;

    fn dtype(&self) -> DType;

    /// Capacity in elements of [`DeviceBuffer::dtype`].
    fn capacity(&self) -> usize;

    fn byte_len(&self) -> usize {
        self.capacity() * self.dtype().size_in_bytes()
    }
}

/// Device allocation and transfer primitives used by the binder and the wrapped models.
pub trait DeviceBackend: Send + Sync + 'static {
    type Buffer: DeviceBuffer;

    /// Returns a human-readable backend identifier (e.g., `"cpu"`, `"cuda"`).
    fn backend_name(&self) -> &str;

    /// Allocates a zero-initialised buffer of `elements` elements.
    fn allocate(&self, dtype: DType, elements: usize) -> BackendResult<Arc<Self::Buffer>>;

    /// Allocates a buffer sized to `bytes` and fills it with them.
    fn upload(&self, dtype: DType, bytes: &[u8]) -> BackendResult<Arc<Self::Buffer>>;

    /// Reads `elements` elements starting at element `offset` back to host memory.
    fn download(
        &self,
        buffer: &Self::Buffer,
        offset: usize,
        elements: usize,
    ) -> BackendResult<Vec<u8>>;

    /// Copies `elements` contiguous elements from `src[src_offset..]` into `dst[dst_offset..]`.
    ///
    /// Both buffers must share a dtype. Backends that support capture record this copy when it
    /// is issued while a capture is in progress, keeping both buffers alive with the recording.
    fn copy_span(
        &self,
        dst: &Arc<Self::Buffer>,
        dst_offset: usize,
        src: &Arc<Self::Buffer>,
        src_offset: usize,
        elements: usize,
    ) -> BackendResult<()>;

    /// Blocks until every operation issued so far has completed.
    fn synchronize(&self) -> BackendResult<()> {
        Ok(())
    }
}

/// Validates that `[offset, offset + elements)` lies inside `buffer`.
pub fn check_span<T: DeviceBuffer + ?Sized>(
    buffer: &T,
    offset: usize,
    elements: usize,
) -> BackendResult<()> {
    let end = offset
        .checked_add(elements)
        .ok_or_else(|| BackendError::execution("span end overflows usize"))?;
    if end > buffer.capacity() {
        return Err(BackendError::execution(format!(
            "span [{offset}, {end}) exceeds buffer capacity {} at {:#x}",
            buffer.capacity(),
            buffer.device_ptr()
        )));
    }
    Ok(())
}
