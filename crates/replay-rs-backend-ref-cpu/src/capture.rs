use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use replay_rs::backend::spec::BackendResult;
use replay_rs::capture::{GraphCapture, Model, ReplayFn, StaticInputs};
use replay_rs::tensor::DeviceTensor;
use tracing::{debug, warn};

use crate::cpu::{CpuBackend, CpuOp};

/// Stream-capture emulation for [`CpuBackend`].
///
/// The model runs once with the backend recording; the host code of the model does not run
/// again on replay, only the recorded operations do.
pub struct CpuGraphCapture {
    backend: Arc<CpuBackend>,
    captures: AtomicUsize,
}

impl CpuGraphCapture {
    pub fn new(backend: Arc<CpuBackend>) -> Self {
        Self {
            backend,
            captures: AtomicUsize::new(0),
        }
    }

    /// Successful captures so far.
    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::Relaxed)
    }
}

/// Ends an open capture when the model unwinds before it is finished.
struct CaptureScope<'a> {
    backend: &'a CpuBackend,
    open: bool,
}

impl<'a> CaptureScope<'a> {
    fn begin(backend: &'a CpuBackend) -> BackendResult<Self> {
        backend.begin_capture()?;
        Ok(Self {
            backend,
            open: true,
        })
    }

    fn finish(mut self) -> BackendResult<Vec<CpuOp>> {
        self.open = false;
        self.backend.end_capture()
    }
}

impl Drop for CaptureScope<'_> {
    fn drop(&mut self) {
        if self.open {
            warn!("discarding unfinished cpu capture");
            let _ = self.backend.end_capture();
        }
    }
}

impl GraphCapture<CpuBackend> for CpuGraphCapture {
    fn capture(
        &self,
        model: Arc<dyn Model<CpuBackend>>,
        inputs: &[DeviceTensor<CpuBackend>],
        static_indices: &[usize],
    ) -> BackendResult<Box<dyn ReplayFn<CpuBackend>>> {
        let statics = StaticInputs::record(inputs, static_indices)?;

        let scope = CaptureScope::begin(&self.backend)?;
        let outputs = model.forward(inputs);
        let tape = scope.finish()?;
        let outputs = outputs?;

        self.captures.fetch_add(1, Ordering::Relaxed);
        debug!(
            ops = tape.len(),
            static_inputs = statics.addresses().len(),
            outputs = outputs.len(),
            "captured cpu graph"
        );
        Ok(Box::new(CpuGraph {
            backend: Arc::clone(&self.backend),
            tape,
            statics,
            _inputs: inputs.to_vec(),
            outputs,
        }))
    }
}

struct CpuGraph {
    backend: Arc<CpuBackend>,
    tape: Vec<CpuOp>,
    statics: StaticInputs,
    // Keeps the capture-time input buffers alive for as long as the tape refers to them.
    _inputs: Vec<DeviceTensor<CpuBackend>>,
    outputs: Vec<DeviceTensor<CpuBackend>>,
}

impl ReplayFn<CpuBackend> for CpuGraph {
    fn replay(
        &mut self,
        inputs: &[DeviceTensor<CpuBackend>],
    ) -> BackendResult<Vec<DeviceTensor<CpuBackend>>> {
        self.statics.verify(inputs)?;
        self.backend.launch(&self.tape)?;
        Ok(self.outputs.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replay_rs::backend::spec::{BackendError, DeviceBackend};
    use replay_rs::tensor::{DType, Shape};

    use crate::cpu::UnaryF32;

    type Outputs = BackendResult<Vec<DeviceTensor<CpuBackend>>>;

    fn tensor(backend: &CpuBackend, values: &[f32]) -> DeviceTensor<CpuBackend> {
        DeviceTensor::from_slice(backend, Shape::new([values.len()]), values).expect("upload")
    }

    /// `out = 2 * x`, writing into one output buffer owned by the model.
    fn doubling_model(backend: &Arc<CpuBackend>, len: usize) -> Arc<dyn Model<CpuBackend>> {
        let out = DeviceTensor::<CpuBackend>::contiguous(
            backend.allocate(DType::F32, len).expect("allocate"),
            Shape::new([len]),
        )
        .expect("output view");
        let backend = Arc::clone(backend);
        Arc::new(move |inputs: &[DeviceTensor<CpuBackend>]| -> Outputs {
            backend.map_f32(&out, &inputs[0], UnaryF32::Scale(2.0))?;
            Ok(vec![out.clone()])
        })
    }

    #[test]
    fn replay_reads_the_static_buffers_in_place() -> anyhow::Result<()> {
        let backend = Arc::new(CpuBackend::new());
        let capture = CpuGraphCapture::new(Arc::clone(&backend));
        let static_input = tensor(&backend, &[1.0, 2.0, 3.0]);

        let mut replay = capture.capture(
            doubling_model(&backend, 3),
            std::slice::from_ref(&static_input),
            &[0],
        )?;
        assert_eq!(capture.captures(), 1);

        let out = replay.replay(std::slice::from_ref(&static_input))?;
        assert_eq!(out[0].to_vec::<f32>(&backend)?, vec![2.0, 4.0, 6.0]);

        let fresh = tensor(&backend, &[5.0, 6.0, 7.0]);
        backend.copy_span(static_input.buffer(), 0, fresh.buffer(), 0, 3)?;
        let out = replay.replay(std::slice::from_ref(&static_input))?;
        assert_eq!(out[0].to_vec::<f32>(&backend)?, vec![10.0, 12.0, 14.0]);
        Ok(())
    }

    #[test]
    fn replay_rejects_moved_static_inputs() -> anyhow::Result<()> {
        let backend = Arc::new(CpuBackend::new());
        let capture = CpuGraphCapture::new(Arc::clone(&backend));
        let static_input = tensor(&backend, &[1.0]);
        let mut replay = capture.capture(
            doubling_model(&backend, 1),
            std::slice::from_ref(&static_input),
            &[0],
        )?;

        let elsewhere = tensor(&backend, &[1.0]);
        let executed = backend.executed_ops();
        assert!(matches!(
            replay.replay(&[elsewhere]),
            Err(BackendError::Capture { .. })
        ));
        assert_eq!(backend.executed_ops(), executed);
        Ok(())
    }

    #[test]
    fn model_failure_closes_the_capture() -> anyhow::Result<()> {
        let backend = Arc::new(CpuBackend::new());
        let capture = CpuGraphCapture::new(Arc::clone(&backend));
        let failing: Arc<dyn Model<CpuBackend>> =
            Arc::new(|_: &[DeviceTensor<CpuBackend>]| -> Outputs {
                Err(BackendError::execution("kernel failed"))
            });

        let input = tensor(&backend, &[1.0]);
        assert!(capture.capture(failing, &[input], &[0]).is_err());
        assert!(!backend.is_capturing());
        assert_eq!(capture.captures(), 0);
        Ok(())
    }

    #[test]
    fn model_panic_closes_the_capture() {
        let backend = Arc::new(CpuBackend::new());
        let capture = CpuGraphCapture::new(Arc::clone(&backend));
        let panicking: Arc<dyn Model<CpuBackend>> =
            Arc::new(|_: &[DeviceTensor<CpuBackend>]| -> Outputs { panic!("model bug") });
        let input = tensor(&backend, &[1.0]);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = capture.capture(panicking, &[input], &[0]);
        }));
        assert!(result.is_err());
        assert!(!backend.is_capturing());
    }
}
