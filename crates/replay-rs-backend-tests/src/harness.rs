//! Shared fixtures for the conformance suite.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use replay_rs::backend::spec::{BackendError, BackendResult, DeviceBackend, DeviceBuffer};
use replay_rs::capture::{GraphCapture, Model, ReplayFn};
use replay_rs::tensor::{DType, DeviceTensor, Shape};
use replay_rs::{BufferPool, ReplayConfig, SharedRng, WrapperContext};

/// Element capacity of every output buffer a [`MirrorModel`] owns.
pub const MIRROR_CAPACITY: usize = 1024;

/// Decorates a backend's capture primitive with a counter and a one-shot failure switch.
pub struct CountingCapture<B: DeviceBackend> {
    inner: Arc<dyn GraphCapture<B>>,
    captures: AtomicUsize,
    fail_next: AtomicBool,
}

impl<B: DeviceBackend> CountingCapture<B> {
    pub fn new(inner: Arc<dyn GraphCapture<B>>) -> Self {
        Self {
            inner,
            captures: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Makes the next capture fail before it reaches the backend.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl<B: DeviceBackend> GraphCapture<B> for CountingCapture<B> {
    fn capture(
        &self,
        model: Arc<dyn Model<B>>,
        inputs: &[DeviceTensor<B>],
        static_indices: &[usize],
    ) -> BackendResult<Box<dyn ReplayFn<B>>> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(BackendError::capture("injected capture failure"));
        }
        let replay = self.inner.capture(model, inputs, static_indices)?;
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(replay)
    }
}

/// Copies input `i` into its own output buffer and returns views over those buffers.
///
/// The output buffers are allocated up front, so the model issues only device copies while
/// it is being captured.
pub struct MirrorModel<B: DeviceBackend> {
    backend: Arc<B>,
    outputs: Vec<Arc<B::Buffer>>,
    forwards: AtomicUsize,
    rng: Option<Arc<SharedRng>>,
}

impl<B: DeviceBackend> MirrorModel<B> {
    pub fn new(backend: &Arc<B>, arity: usize) -> Self {
        let outputs = (0..arity)
            .map(|_| {
                backend
                    .allocate(DType::F32, MIRROR_CAPACITY)
                    .expect("allocate mirror output")
            })
            .collect();
        Self {
            backend: Arc::clone(backend),
            outputs,
            forwards: AtomicUsize::new(0),
            rng: None,
        }
    }

    /// Draws one value from `rng` on every forward, the way a dropout layer would.
    pub fn with_rng(mut self, rng: Arc<SharedRng>) -> Self {
        self.rng = Some(rng);
        self
    }

    /// Times the host code of `forward` has run.
    pub fn forwards(&self) -> usize {
        self.forwards.load(Ordering::SeqCst)
    }
}

impl<B: DeviceBackend> Model<B> for MirrorModel<B> {
    fn forward(&self, inputs: &[DeviceTensor<B>]) -> BackendResult<Vec<DeviceTensor<B>>> {
        self.forwards.fetch_add(1, Ordering::SeqCst);
        if let Some(rng) = &self.rng {
            rng.next_u64();
        }
        if inputs.len() != self.outputs.len() {
            return Err(BackendError::execution(format!(
                "mirror model expects {} inputs, got {}",
                self.outputs.len(),
                inputs.len()
            )));
        }
        inputs
            .iter()
            .zip(&self.outputs)
            .map(|(input, buffer)| {
                let view = DeviceTensor::new(
                    Arc::clone(buffer),
                    input.shape().clone(),
                    input.strides().clone(),
                    0,
                )?;
                self.backend.copy_span(
                    view.buffer(),
                    0,
                    input.buffer(),
                    input.storage_offset(),
                    input.extent(),
                )?;
                Ok(view)
            })
            .collect()
    }
}

/// One pool, one counted capture primitive and a deterministic config over a backend.
pub struct Harness<B: DeviceBackend> {
    pub backend: Arc<B>,
    pub pool: Arc<BufferPool<B>>,
    pub capture: Arc<CountingCapture<B>>,
}

impl<B: DeviceBackend> Harness<B> {
    pub fn new<C>(backend: &Arc<B>, capture: Arc<C>) -> Self
    where
        C: GraphCapture<B> + 'static,
    {
        let inner: Arc<dyn GraphCapture<B>> = capture;
        Self {
            backend: Arc::clone(backend),
            pool: Arc::new(BufferPool::new(Arc::clone(backend))),
            capture: Arc::new(CountingCapture::new(inner)),
        }
    }

    /// Context with default configuration, independent of the process environment.
    pub fn context(&self) -> WrapperContext<B> {
        let capture: Arc<dyn GraphCapture<B>> = self.capture.clone();
        WrapperContext::new(Arc::clone(&self.pool), capture).with_config(ReplayConfig::default())
    }

    pub fn tensor(&self, values: &[f32]) -> DeviceTensor<B> {
        DeviceTensor::from_slice(self.backend.as_ref(), Shape::new([values.len()]), values)
            .expect("upload tensor")
    }

    /// A rank-1 tensor of `len` seeded random values.
    pub fn random_tensor(&self, len: usize, seed: u64) -> DeviceTensor<B> {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<f32> = (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect();
        self.tensor(&values)
    }

    pub fn read(&self, tensor: &DeviceTensor<B>) -> Vec<f32> {
        tensor
            .to_vec::<f32>(self.backend.as_ref())
            .expect("read back tensor")
    }
}

/// Base addresses of `tensors`, in order.
pub fn addresses<B: DeviceBackend>(tensors: &[DeviceTensor<B>]) -> Vec<u64> {
    tensors.iter().map(DeviceTensor::device_ptr).collect()
}

/// Fails with a readable message when a buffer is smaller than `elements`.
pub fn assert_capacity<T: DeviceBuffer + ?Sized>(buffer: &T, elements: usize) {
    assert!(
        buffer.capacity() >= elements,
        "buffer at {:#x} holds {} elements, expected at least {elements}",
        buffer.device_ptr(),
        buffer.capacity()
    );
}
