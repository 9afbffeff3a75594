use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use replay_rs::backend::spec::{
    check_span, BackendError, BackendResult, DeviceBackend, DeviceBuffer,
};
use replay_rs::tensor::{DType, DeviceTensor};
use tracing::trace;

/// Host allocation with a fixed base address.
///
/// The bytes live in a boxed slice that is never reallocated, so the address handed out at
/// allocation time stays valid until the buffer is dropped.
pub struct CpuBuffer {
    dtype: DType,
    capacity: usize,
    ptr: u64,
    data: Mutex<Box<[u8]>>,
}

impl CpuBuffer {
    fn new(dtype: DType, capacity: usize, data: Box<[u8]>) -> Arc<Self> {
        Arc::new(Self {
            dtype,
            capacity,
            ptr: data.as_ptr() as u64,
            data: Mutex::new(data),
        })
    }

    fn data(&self) -> MutexGuard<'_, Box<[u8]>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read(&self, offset: usize, elements: usize) -> Vec<u8> {
        let width = self.dtype.size_in_bytes();
        self.data()[offset * width..(offset + elements) * width].to_vec()
    }

    fn write(&self, offset: usize, bytes: &[u8]) {
        let start = offset * self.dtype.size_in_bytes();
        self.data()[start..start + bytes.len()].copy_from_slice(bytes);
    }
}

impl DeviceBuffer for CpuBuffer {
    fn device_ptr(&self) -> u64 {
        self.ptr
    }

    fn dtype(&self) -> DType {
        self.dtype
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for CpuBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuBuffer")
            .field("dtype", &self.dtype)
            .field("capacity", &self.capacity)
            .field("ptr", &format_args!("{:#x}", self.ptr))
            .finish()
    }
}

/// Elementwise `f32` kernels understood by [`CpuBackend::map_f32`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnaryF32 {
    Scale(f32),
    Offset(f32),
    Relu,
}

impl UnaryF32 {
    fn apply(self, x: f32) -> f32 {
        match self {
            UnaryF32::Scale(factor) => x * factor,
            UnaryF32::Offset(delta) => x + delta,
            UnaryF32::Relu => x.max(0.0),
        }
    }
}

/// A device-side operation: executed immediately, or recorded while a capture is open.
#[derive(Debug, Clone)]
pub(crate) enum CpuOp {
    Copy {
        dst: Arc<CpuBuffer>,
        dst_offset: usize,
        src: Arc<CpuBuffer>,
        src_offset: usize,
        elements: usize,
    },
    MapF32 {
        dst: Arc<CpuBuffer>,
        dst_offset: usize,
        src: Arc<CpuBuffer>,
        src_offset: usize,
        elements: usize,
        kernel: UnaryF32,
    },
}

impl CpuOp {
    fn execute(&self) {
        match self {
            CpuOp::Copy {
                dst,
                dst_offset,
                src,
                src_offset,
                elements,
            } => {
                let bytes = src.read(*src_offset, *elements);
                dst.write(*dst_offset, &bytes);
            }
            CpuOp::MapF32 {
                dst,
                dst_offset,
                src,
                src_offset,
                elements,
                kernel,
            } => {
                let mapped: Vec<u8> = src
                    .read(*src_offset, *elements)
                    .chunks_exact(4)
                    .flat_map(|chunk| {
                        let x = f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                        kernel.apply(x).to_ne_bytes()
                    })
                    .collect();
                dst.write(*dst_offset, &mapped);
            }
        }
    }
}

/// Reference backend over host memory.
///
/// Work is issued to a single in-order queue that executes synchronously. Between
/// [`CpuBackend::begin_capture`] and [`CpuBackend::end_capture`] the queue records instead of
/// executing: every operation submitted to the backend joins the recording, whichever caller
/// issued it.
#[derive(Default)]
pub struct CpuBackend {
    tape: Mutex<Option<Vec<CpuOp>>>,
    allocations: AtomicUsize,
    executed: AtomicUsize,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers handed out by `allocate` and `upload` so far.
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Operations executed so far, counting replayed ones.
    pub fn executed_ops(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    pub fn is_capturing(&self) -> bool {
        self.tape().is_some()
    }

    /// Writes `kernel(src)` into `dst` elementwise.
    ///
    /// Both tensors must be `f32` with equal shapes and strides; the kernel runs over the
    /// storage span the views cover.
    pub fn map_f32(
        &self,
        dst: &DeviceTensor<Self>,
        src: &DeviceTensor<Self>,
        kernel: UnaryF32,
    ) -> BackendResult<()> {
        if dst.dtype() != DType::F32 || src.dtype() != DType::F32 {
            return Err(BackendError::execution(format!(
                "map_f32 expects f32 tensors, got {} -> {}",
                src.dtype(),
                dst.dtype()
            )));
        }
        if dst.shape() != src.shape() || dst.strides() != src.strides() {
            return Err(BackendError::execution(format!(
                "map_f32 layout mismatch: {:?}/{:?} -> {:?}/{:?}",
                src.shape().dims(),
                src.strides().as_slice(),
                dst.shape().dims(),
                dst.strides().as_slice()
            )));
        }
        let elements = src.extent();
        check_span(src.buffer().as_ref(), src.storage_offset(), elements)?;
        check_span(dst.buffer().as_ref(), dst.storage_offset(), elements)?;
        self.submit(CpuOp::MapF32 {
            dst: Arc::clone(dst.buffer()),
            dst_offset: dst.storage_offset(),
            src: Arc::clone(src.buffer()),
            src_offset: src.storage_offset(),
            elements,
            kernel,
        });
        Ok(())
    }

    pub(crate) fn begin_capture(&self) -> BackendResult<()> {
        let mut tape = self.tape();
        if tape.is_some() {
            return Err(BackendError::capture("a capture is already in progress"));
        }
        *tape = Some(Vec::new());
        Ok(())
    }

    pub(crate) fn end_capture(&self) -> BackendResult<Vec<CpuOp>> {
        self.tape()
            .take()
            .ok_or_else(|| BackendError::capture("no capture in progress"))
    }

    /// Executes a recorded tape in order.
    pub(crate) fn launch(&self, ops: &[CpuOp]) -> BackendResult<()> {
        self.ensure_not_capturing("launch")?;
        for op in ops {
            op.execute();
        }
        self.executed.fetch_add(ops.len(), Ordering::Relaxed);
        Ok(())
    }

    fn submit(&self, op: CpuOp) {
        let mut tape = self.tape();
        if let Some(recorded) = tape.as_mut() {
            recorded.push(op);
            trace!(ops = recorded.len(), "recorded op");
            return;
        }
        drop(tape);
        op.execute();
        self.executed.fetch_add(1, Ordering::Relaxed);
    }

    fn tape(&self) -> MutexGuard<'_, Option<Vec<CpuOp>>> {
        self.tape.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_not_capturing(&self, op: &'static str) -> BackendResult<()> {
        if self.is_capturing() {
            return Err(BackendError::unimplemented(
                op,
                "host synchronisation is not allowed while a capture is in progress",
            ));
        }
        Ok(())
    }
}

impl DeviceBackend for CpuBackend {
    type Buffer = CpuBuffer;

    fn backend_name(&self) -> &str {
        "cpu"
    }

    fn allocate(&self, dtype: DType, elements: usize) -> BackendResult<Arc<CpuBuffer>> {
        let bytes = elements
            .max(1)
            .checked_mul(dtype.size_in_bytes())
            .ok_or_else(|| BackendError::execution("allocation size overflows usize"))?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(CpuBuffer::new(
            dtype,
            elements,
            vec![0u8; bytes].into_boxed_slice(),
        ))
    }

    fn upload(&self, dtype: DType, bytes: &[u8]) -> BackendResult<Arc<CpuBuffer>> {
        self.ensure_not_capturing("upload")?;
        let width = dtype.size_in_bytes();
        if bytes.len() % width != 0 {
            return Err(BackendError::execution(format!(
                "upload of {} bytes is not a whole number of {dtype} elements",
                bytes.len()
            )));
        }
        let mut data = bytes.to_vec();
        // Keep a distinct address for empty uploads.
        data.resize(bytes.len().max(width), 0);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(CpuBuffer::new(
            dtype,
            bytes.len() / width,
            data.into_boxed_slice(),
        ))
    }

    fn download(
        &self,
        buffer: &CpuBuffer,
        offset: usize,
        elements: usize,
    ) -> BackendResult<Vec<u8>> {
        self.ensure_not_capturing("download")?;
        check_span(buffer, offset, elements)?;
        Ok(buffer.read(offset, elements))
    }

    fn copy_span(
        &self,
        dst: &Arc<CpuBuffer>,
        dst_offset: usize,
        src: &Arc<CpuBuffer>,
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
        self.submit(CpuOp::Copy {
            dst: Arc::clone(dst),
            dst_offset,
            src: Arc::clone(src),
            src_offset,
            elements,
        });
        Ok(())
    }
}
