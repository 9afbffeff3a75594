use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use replay_rs::backend::spec::BackendResult;
use replay_rs::capture::{GraphCapture, Model, ReplayFn, StaticInputs};
use replay_rs::tensor::DeviceTensor;
use tracing::{debug, warn};

use crate::device::{CudaDriver, GraphExec};
use crate::CudaBackend;

/// Stream capture into a CUDA graph.
///
/// The model is run once with the backend stream recording. Every replay launches the
/// instantiated graph on the same stream and hands back the tensors the model returned at
/// capture time, which the graph rewrites in place.
pub struct CudaGraphCapture {
    backend: Arc<CudaBackend>,
    captures: AtomicUsize,
}

impl CudaGraphCapture {
    pub fn new(backend: Arc<CudaBackend>) -> Self {
        Self {
            backend,
            captures: AtomicUsize::new(0),
        }
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::Relaxed)
    }
}

/// Closes the stream capture if the model unwinds out of it.
struct StreamCapture<'a> {
    driver: &'a Arc<CudaDriver>,
    open: bool,
}

impl<'a> StreamCapture<'a> {
    fn begin(driver: &'a Arc<CudaDriver>) -> BackendResult<Self> {
        driver.begin_capture()?;
        Ok(Self { driver, open: true })
    }

    fn finish(mut self) -> BackendResult<GraphExec> {
        self.open = false;
        self.driver.end_capture()
    }
}

impl Drop for StreamCapture<'_> {
    fn drop(&mut self) {
        if self.open {
            warn!("discarding unfinished cuda stream capture");
            let _ = self.driver.end_capture();
        }
    }
}

impl GraphCapture<CudaBackend> for CudaGraphCapture {
    fn capture(
        &self,
        model: Arc<dyn Model<CudaBackend>>,
        inputs: &[DeviceTensor<CudaBackend>],
        static_indices: &[usize],
    ) -> BackendResult<Box<dyn ReplayFn<CudaBackend>>> {
        let statics = StaticInputs::record(inputs, static_indices)?;

        let capture = StreamCapture::begin(self.backend.driver())?;
        let outputs = model.forward(inputs);
        // The stream must leave capture mode even when the model failed.
        let graph = capture.finish();
        let outputs = outputs?;
        let graph = graph?;

        self.captures.fetch_add(1, Ordering::Relaxed);
        debug!(
            static_inputs = statics.addresses().len(),
            outputs = outputs.len(),
            "captured cuda graph"
        );
        Ok(Box::new(CudaGraph {
            backend: Arc::clone(&self.backend),
            graph,
            statics,
            _inputs: inputs.to_vec(),
            outputs,
        }))
    }
}

struct CudaGraph {
    backend: Arc<CudaBackend>,
    graph: GraphExec,
    statics: StaticInputs,
    // The graph reads these buffers by address; they must outlive it.
    _inputs: Vec<DeviceTensor<CudaBackend>>,
    outputs: Vec<DeviceTensor<CudaBackend>>,
}

impl ReplayFn<CudaBackend> for CudaGraph {
    fn replay(
        &mut self,
        inputs: &[DeviceTensor<CudaBackend>],
    ) -> BackendResult<Vec<DeviceTensor<CudaBackend>>> {
        self.statics.verify(inputs)?;
        self.backend.driver().launch_graph(&self.graph)?;
        Ok(self.outputs.clone())
    }
}
