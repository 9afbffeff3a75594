//! Capture-once, replay-many wrapper around a model.
//!
//! Construction looks at the example inputs. When all of them carry data the wrapper binds
//! them, warms the model up and captures it right away (eager). When any of them is symbolic
//! the same sequence runs on the first call instead (deferred), with the warm-up's random
//! draws rolled back. Every call binds its inputs into the pooled buffers the graph was
//! captured against and replays.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, info_span};

use crate::backend::spec::{BackendError, BackendResult, DeviceBackend};
use crate::binder::{bind_inputs, concrete_inputs};
use crate::capture::{GraphCapture, Model, ReplayFn};
use crate::config::ReplayConfig;
use crate::pool::{BufferPool, InputSignature, PoolKey};
use crate::rng::{preserve_rng_state, NoRngState, RngStatePreserver};
use crate::tensor::{DeviceTensor, GraphInput};

/// Collaborators shared by every wrapper of one service.
pub struct WrapperContext<B: DeviceBackend> {
    pub pool: Arc<BufferPool<B>>,
    pub capture: Arc<dyn GraphCapture<B>>,
    pub rng: Arc<dyn RngStatePreserver>,
    pub config: ReplayConfig,
}

impl<B: DeviceBackend> WrapperContext<B> {
    /// Context with no generator state to preserve and configuration read from the environment.
    pub fn new(pool: Arc<BufferPool<B>>, capture: Arc<dyn GraphCapture<B>>) -> Self {
        Self {
            pool,
            capture,
            rng: Arc::new(NoRngState),
            config: ReplayConfig::from_env(),
        }
    }

    pub fn with_rng(mut self, rng: Arc<dyn RngStatePreserver>) -> Self {
        self.rng = rng;
        self
    }

    pub fn with_config(mut self, config: ReplayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        self.pool.backend()
    }
}

impl<B: DeviceBackend> Clone for WrapperContext<B> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            capture: Arc::clone(&self.capture),
            rng: Arc::clone(&self.rng),
            config: self.config,
        }
    }
}

/// Which construction path a wrapper took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperMode {
    /// Captured during construction.
    Eager,
    /// Captures on the first call.
    Deferred,
}

/// Externally visible capture progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    NotCaptured,
    Capturing,
    Captured,
}

enum CaptureState<B: DeviceBackend> {
    NotCaptured,
    Capturing,
    Captured {
        replay: Box<dyn ReplayFn<B>>,
        signature: InputSignature,
    },
}

/// A model bound to pooled inputs and a captured graph.
///
/// `call` takes `&mut self`, so one wrapper is driven by one caller at a time. Wrappers that
/// share a pool are serialised on the pool lock for the whole call. A model must not call a
/// wrapper sharing its pool from inside `forward`.
pub struct GraphWrapper<B: DeviceBackend> {
    context: WrapperContext<B>,
    model: Arc<dyn Model<B>>,
    mode: WrapperMode,
    examples: Vec<GraphInput<B>>,
    state: CaptureState<B>,
}

impl<B: DeviceBackend> GraphWrapper<B> {
    pub fn new(
        context: WrapperContext<B>,
        model: Arc<dyn Model<B>>,
        example_inputs: Vec<GraphInput<B>>,
    ) -> BackendResult<Self> {
        let mode = if example_inputs.iter().any(GraphInput::is_symbolic) {
            WrapperMode::Deferred
        } else {
            WrapperMode::Eager
        };
        let mut wrapper = Self {
            context,
            model,
            mode,
            examples: example_inputs,
            state: CaptureState::NotCaptured,
        };

        if mode == WrapperMode::Eager {
            let inputs = concrete_inputs(&wrapper.examples)?;
            let pool = Arc::clone(&wrapper.context.pool);
            let mut guard = pool.lock();
            let bound = bind_inputs(&mut guard, &inputs)?;
            let pending = PendingCapture::begin(&mut wrapper.state);
            let replay = warm_up_and_capture(
                &wrapper.context,
                &wrapper.model,
                wrapper.mode,
                &bound.tensors,
            )?;
            pending.finish(replay, bound.signature);
        }
        debug!(mode = ?wrapper.mode, inputs = wrapper.examples.len(), "graph wrapper ready");
        Ok(wrapper)
    }

    /// Binds `inputs` into the pooled buffers and replays the captured graph over them,
    /// capturing first when this is the first call of a deferred wrapper.
    pub fn call(&mut self, inputs: &[DeviceTensor<B>]) -> BackendResult<Vec<DeviceTensor<B>>> {
        self.check_inputs(inputs)?;

        let pool = Arc::clone(&self.context.pool);
        let mut guard = pool.lock();
        let bound = bind_inputs(&mut guard, inputs)?;

        if matches!(self.state, CaptureState::NotCaptured) {
            let rng = Arc::clone(&self.context.rng);
            let pending = PendingCapture::begin(&mut self.state);
            // The capture run executes the model's host code too, so it shares the scope.
            let replay = preserve_rng_state(rng.as_ref(), || {
                warm_up_and_capture(&self.context, &self.model, self.mode, &bound.tensors)
            })?;
            pending.finish(replay, bound.signature.clone());
        }

        match &mut self.state {
            CaptureState::Captured { replay, .. } => replay.replay(&bound.tensors),
            CaptureState::NotCaptured | CaptureState::Capturing => Err(BackendError::execution(
                "graph wrapper has no captured graph to replay",
            )),
        }
    }

    /// Consumes the wrapper into a plain callable.
    pub fn into_callable(
        mut self,
    ) -> impl FnMut(&[DeviceTensor<B>]) -> BackendResult<Vec<DeviceTensor<B>>> {
        move |inputs| self.call(inputs)
    }

    pub fn mode(&self) -> WrapperMode {
        self.mode
    }

    pub fn state(&self) -> CallState {
        match self.state {
            CaptureState::NotCaptured => CallState::NotCaptured,
            CaptureState::Capturing => CallState::Capturing,
            CaptureState::Captured { .. } => CallState::Captured,
        }
    }

    /// Signature the graph was captured with.
    pub fn signature(&self) -> Option<&InputSignature> {
        match &self.state {
            CaptureState::Captured { signature, .. } => Some(signature),
            CaptureState::NotCaptured | CaptureState::Capturing => None,
        }
    }

    pub fn context(&self) -> &WrapperContext<B> {
        &self.context
    }

    fn check_inputs(&self, inputs: &[DeviceTensor<B>]) -> BackendResult<()> {
        if inputs.len() != self.examples.len() {
            return Err(BackendError::signature(
                format!("{} inputs", self.examples.len()),
                format!("{} inputs", inputs.len()),
            ));
        }
        for (position, (example, input)) in self.examples.iter().zip(inputs).enumerate() {
            if example.dtype() != input.dtype() || example.shape().rank() != input.shape().rank()
            {
                return Err(BackendError::signature(
                    format!(
                        "input {position} as {} of rank {}",
                        example.dtype(),
                        example.shape().rank()
                    ),
                    format!("{} of rank {}", input.dtype(), input.shape().rank()),
                ));
            }
        }

        if let CaptureState::Captured { signature, .. } = &self.state {
            if self.context.config.strict_signature {
                let actual = InputSignature::new(inputs.iter().map(PoolKey::for_tensor).collect());
                if &actual != signature {
                    return Err(BackendError::signature(signature, actual));
                }
            }
        }
        Ok(())
    }
}

/// Marks a capture in progress. Unless finished, the state falls back to `NotCaptured` when
/// the guard drops, whether the capture returned an error or unwound.
struct PendingCapture<'a, B: DeviceBackend> {
    state: &'a mut CaptureState<B>,
}

impl<'a, B: DeviceBackend> PendingCapture<'a, B> {
    fn begin(state: &'a mut CaptureState<B>) -> Self {
        *state = CaptureState::Capturing;
        Self { state }
    }

    fn finish(self, replay: Box<dyn ReplayFn<B>>, signature: InputSignature) {
        *self.state = CaptureState::Captured { replay, signature };
    }
}

impl<B: DeviceBackend> Drop for PendingCapture<'_, B> {
    fn drop(&mut self) {
        if matches!(*self.state, CaptureState::Capturing) {
            *self.state = CaptureState::NotCaptured;
        }
    }
}

fn warm_up_and_capture<B: DeviceBackend>(
    context: &WrapperContext<B>,
    model: &Arc<dyn Model<B>>,
    mode: WrapperMode,
    bound: &[DeviceTensor<B>],
) -> BackendResult<Box<dyn ReplayFn<B>>> {
    let _span = info_span!(
        "capture_graph",
        backend = context.backend().backend_name(),
        mode = ?mode,
        inputs = bound.len()
    )
    .entered();

    // Outputs are dropped; the runs exist for their side effects on device state.
    for run in 0..context.config.warmup_runs {
        model.forward(bound)?;
        debug!(run, "warm-up run finished");
    }
    context.backend().synchronize()?;

    let static_indices: Vec<usize> = (0..bound.len()).collect();
    let replay = context
        .capture
        .capture(Arc::clone(model), bound, &static_indices)?;
    debug!(static_inputs = static_indices.len(), "graph captured");
    Ok(replay)
}

impl<B: DeviceBackend> fmt::Debug for GraphWrapper<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphWrapper")
            .field("backend", &self.context.backend().backend_name())
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("signature", &self.signature())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::capture::StaticInputs;
    use crate::pool::SizeClass;
    use crate::rng::SharedRng;
    use crate::tensor::{DType, Shape, SymbolicInput};
    use crate::testing::HostBackend;

    /// Replays by re-running the model after checking static addresses.
    #[derive(Default)]
    struct RerunCapture {
        captures: AtomicUsize,
        fail_next: Mutex<bool>,
    }

    struct RerunReplay<B: DeviceBackend> {
        model: Arc<dyn Model<B>>,
        statics: StaticInputs,
    }

    impl<B: DeviceBackend> ReplayFn<B> for RerunReplay<B> {
        fn replay(&mut self, inputs: &[DeviceTensor<B>]) -> BackendResult<Vec<DeviceTensor<B>>> {
            self.statics.verify(inputs)?;
            self.model.forward(inputs)
        }
    }

    impl GraphCapture<HostBackend> for RerunCapture {
        fn capture(
            &self,
            model: Arc<dyn Model<HostBackend>>,
            inputs: &[DeviceTensor<HostBackend>],
            static_indices: &[usize],
        ) -> BackendResult<Box<dyn ReplayFn<HostBackend>>> {
            if std::mem::take(&mut *self.fail_next.lock().expect("capture mutex poisoned")) {
                return Err(BackendError::capture("unsupported operation inside graph"));
            }
            self.captures.fetch_add(1, Ordering::Relaxed);
            let statics = StaticInputs::record(inputs, static_indices)?;
            Ok(Box::new(RerunReplay { model, statics }))
        }
    }

    struct Fixture {
        backend: Arc<HostBackend>,
        capture: Arc<RerunCapture>,
        context: WrapperContext<HostBackend>,
        forwards: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let backend = Arc::new(HostBackend::default());
        let pool = Arc::new(BufferPool::new(Arc::clone(&backend)));
        let capture = Arc::new(RerunCapture::default());
        let context = WrapperContext::new(pool, capture.clone() as Arc<dyn GraphCapture<_>>)
            .with_config(ReplayConfig::default());
        Fixture {
            backend,
            capture,
            context,
            forwards: Arc::new(AtomicUsize::new(0)),
        }
    }

    type Outputs = BackendResult<Vec<DeviceTensor<HostBackend>>>;

    fn identity_model(forwards: &Arc<AtomicUsize>) -> Arc<dyn Model<HostBackend>> {
        let forwards = Arc::clone(forwards);
        Arc::new(move |inputs: &[DeviceTensor<HostBackend>]| -> Outputs {
            forwards.fetch_add(1, Ordering::Relaxed);
            Ok(inputs.to_vec())
        })
    }

    fn tensor(backend: &HostBackend, values: &[f32]) -> DeviceTensor<HostBackend> {
        DeviceTensor::from_slice(backend, Shape::new([values.len()]), values).expect("upload")
    }

    #[test]
    fn eager_wrapper_captures_during_construction() -> anyhow::Result<()> {
        let fx = fixture();
        let example = tensor(&fx.backend, &[1.0, 2.0, 3.0]);
        let mut wrapper = GraphWrapper::new(
            fx.context.clone(),
            identity_model(&fx.forwards),
            vec![example.into()],
        )?;
        assert_eq!(wrapper.mode(), WrapperMode::Eager);
        assert_eq!(wrapper.state(), CallState::Captured);
        assert_eq!(fx.capture.captures.load(Ordering::Relaxed), 1);
        assert_eq!(fx.forwards.load(Ordering::Relaxed), 1);

        let out = wrapper.call(&[tensor(&fx.backend, &[4.0, 5.0, 6.0])])?;
        assert_eq!(out[0].to_vec::<f32>(&fx.backend)?, vec![4.0, 5.0, 6.0]);
        assert_eq!(fx.capture.captures.load(Ordering::Relaxed), 1);
        Ok(())
    }

    #[test]
    fn deferred_wrapper_captures_once_on_first_call() -> anyhow::Result<()> {
        let fx = fixture();
        let mut wrapper = GraphWrapper::new(
            fx.context.clone(),
            identity_model(&fx.forwards),
            vec![SymbolicInput::new(DType::F32, Shape::new([2])).into()],
        )?;
        assert_eq!(wrapper.mode(), WrapperMode::Deferred);
        assert_eq!(wrapper.state(), CallState::NotCaptured);
        assert!(wrapper.signature().is_none());

        wrapper.call(&[tensor(&fx.backend, &[1.0, 2.0])])?;
        wrapper.call(&[tensor(&fx.backend, &[3.0, 4.0])])?;
        wrapper.call(&[tensor(&fx.backend, &[5.0, 6.0])])?;
        assert_eq!(wrapper.state(), CallState::Captured);
        assert_eq!(fx.capture.captures.load(Ordering::Relaxed), 1);
        // One warm-up plus one replay per call.
        assert_eq!(fx.forwards.load(Ordering::Relaxed), 4);
        Ok(())
    }

    #[test]
    fn warmup_runs_follow_config() -> anyhow::Result<()> {
        let fx = fixture();
        let context = fx
            .context
            .clone()
            .with_config(ReplayConfig::default().with_warmup_runs(3));
        GraphWrapper::new(
            context,
            identity_model(&fx.forwards),
            vec![tensor(&fx.backend, &[1.0]).into()],
        )?;
        assert_eq!(fx.forwards.load(Ordering::Relaxed), 3);
        Ok(())
    }

    #[test]
    fn changed_signature_is_rejected_before_binding() -> anyhow::Result<()> {
        let fx = fixture();
        let mut wrapper = GraphWrapper::new(
            fx.context.clone(),
            identity_model(&fx.forwards),
            vec![tensor(&fx.backend, &[1.0, 2.0]).into()],
        )?;
        let before = fx.context.pool.stats();
        let err = wrapper
            .call(&[tensor(&fx.backend, &[1.0, 2.0, 3.0])])
            .expect_err("size class changed");
        assert!(matches!(err, BackendError::SignatureMismatch { .. }));
        assert_eq!(fx.context.pool.stats(), before);

        let err = wrapper.call(&[]).expect_err("arity changed");
        assert!(matches!(err, BackendError::SignatureMismatch { .. }));
        Ok(())
    }

    #[test]
    fn symbolic_example_constrains_dtype_and_rank() -> anyhow::Result<()> {
        let fx = fixture();
        let mut wrapper = GraphWrapper::new(
            fx.context.clone(),
            identity_model(&fx.forwards),
            vec![SymbolicInput::new(DType::I32, Shape::new([2])).into()],
        )?;
        let err = wrapper
            .call(&[tensor(&fx.backend, &[1.0, 2.0])])
            .expect_err("dtype differs");
        assert!(matches!(err, BackendError::SignatureMismatch { .. }));
        assert_eq!(wrapper.state(), CallState::NotCaptured);
        Ok(())
    }

    #[test]
    fn capture_failure_propagates_and_leaves_wrapper_uncaptured() -> anyhow::Result<()> {
        let fx = fixture();
        let mut wrapper = GraphWrapper::new(
            fx.context.clone(),
            identity_model(&fx.forwards),
            vec![SymbolicInput::new(DType::F32, Shape::new([1])).into()],
        )?;
        *fx.capture.fail_next.lock().expect("capture mutex poisoned") = true;

        let err = wrapper
            .call(&[tensor(&fx.backend, &[1.0])])
            .expect_err("capture fails");
        assert!(matches!(err, BackendError::Capture { .. }));
        assert_eq!(wrapper.state(), CallState::NotCaptured);
        assert_eq!(fx.capture.captures.load(Ordering::Relaxed), 0);

        wrapper.call(&[tensor(&fx.backend, &[2.0])])?;
        assert_eq!(wrapper.state(), CallState::Captured);
        Ok(())
    }

    #[test]
    fn panic_during_capture_leaves_wrapper_uncaptured() -> anyhow::Result<()> {
        let fx = fixture();
        let panic_next = Arc::new(AtomicBool::new(true));
        let model_panics = Arc::clone(&panic_next);
        let model: Arc<dyn Model<HostBackend>> =
            Arc::new(move |inputs: &[DeviceTensor<HostBackend>]| -> Outputs {
                if model_panics.swap(false, Ordering::Relaxed) {
                    panic!("kernel launch aborted");
                }
                Ok(inputs.to_vec())
            });
        let mut wrapper = GraphWrapper::new(
            fx.context.clone(),
            model,
            vec![SymbolicInput::new(DType::F32, Shape::new([2])).into()],
        )?;
        let input = tensor(&fx.backend, &[1.0, 2.0]);

        let unwound = panic::catch_unwind(AssertUnwindSafe(|| {
            wrapper.call(std::slice::from_ref(&input))
        }));
        assert!(unwound.is_err());
        assert_eq!(wrapper.state(), CallState::NotCaptured);
        assert_eq!(fx.capture.captures.load(Ordering::Relaxed), 0);

        let out = wrapper.call(std::slice::from_ref(&input))?;
        assert_eq!(wrapper.state(), CallState::Captured);
        assert_eq!(out[0].to_vec::<f32>(&fx.backend)?, vec![1.0, 2.0]);
        Ok(())
    }

    #[test]
    fn lenient_signature_hands_moved_addresses_to_the_replay() -> anyhow::Result<()> {
        let fx = fixture();
        let context = fx
            .context
            .clone()
            .with_config(ReplayConfig::default().with_strict_signature(false));
        let mut wrapper = GraphWrapper::new(
            context,
            identity_model(&fx.forwards),
            vec![tensor(&fx.backend, &[1.0, 2.0]).into()],
        )?;
        let small = PoolKey::new(SizeClass::for_storage_len(2), DType::F32);
        let large = PoolKey::new(SizeClass::for_storage_len(3), DType::F32);
        assert_eq!(fx.context.pool.stats().allocations, 1);

        // The binder accepts the new class; the replay refuses the moved address.
        let err = wrapper
            .call(&[tensor(&fx.backend, &[1.0, 2.0, 3.0])])
            .expect_err("static input moved");
        assert!(matches!(err, BackendError::Capture { .. }), "{err}");
        assert_eq!(fx.context.pool.buffer_count(small), 1);
        assert_eq!(fx.context.pool.buffer_count(large), 1);
        assert_eq!(fx.context.pool.stats().allocations, 2);
        assert_eq!(wrapper.state(), CallState::Captured);

        let out = wrapper.call(&[tensor(&fx.backend, &[5.0, 6.0])])?;
        assert_eq!(out[0].to_vec::<f32>(&fx.backend)?, vec![5.0, 6.0]);
        Ok(())
    }

    #[test]
    fn deferred_warmup_does_not_consume_caller_randomness() -> anyhow::Result<()> {
        let fx = fixture();
        let rng = Arc::new(SharedRng::seed_from_u64(42));
        let reference = SharedRng::seed_from_u64(42);
        let model_rng = Arc::clone(&rng);
        let model: Arc<dyn Model<HostBackend>> =
            Arc::new(move |inputs: &[DeviceTensor<HostBackend>]| -> Outputs {
                model_rng.next_u64();
                Ok(inputs.to_vec())
            });
        let context = fx.context.clone().with_rng(rng.clone());
        let mut wrapper = GraphWrapper::new(
            context,
            model,
            vec![SymbolicInput::new(DType::F32, Shape::new([1])).into()],
        )?;

        wrapper.call(&[tensor(&fx.backend, &[1.0])])?;
        // The rerun replay draws once; warm-up and capture draw nothing visible.
        reference.next_u64();
        assert_eq!(rng.next_u64(), reference.next_u64());
        Ok(())
    }

    #[test]
    fn callable_form_replays() -> anyhow::Result<()> {
        let fx = fixture();
        let wrapper = GraphWrapper::new(
            fx.context.clone(),
            identity_model(&fx.forwards),
            vec![tensor(&fx.backend, &[0.0, 0.0]).into()],
        )?;
        let mut run = wrapper.into_callable();
        let out = run(&[tensor(&fx.backend, &[7.0, 8.0])])?;
        assert_eq!(out[0].to_vec::<f32>(&fx.backend)?, vec![7.0, 8.0]);
        Ok(())
    }
}
