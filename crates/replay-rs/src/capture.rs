//! Contracts for the wrapped computation and the capture/replay primitive.

use std::sync::Arc;

use crate::backend::spec::{BackendError, BackendResult, DeviceBackend};
use crate::tensor::DeviceTensor;

/// A computation over device tensors. The wrapper runs it for warm-up and hands it to the
/// capture primitive; it is never inspected.
pub trait Model<B: DeviceBackend>: Send + Sync {
    fn forward(&self, inputs: &[DeviceTensor<B>]) -> BackendResult<Vec<DeviceTensor<B>>>;
}

impl<B, F> Model<B> for F
where
    B: DeviceBackend,
    F: Fn(&[DeviceTensor<B>]) -> BackendResult<Vec<DeviceTensor<B>>> + Send + Sync,
{
    fn forward(&self, inputs: &[DeviceTensor<B>]) -> BackendResult<Vec<DeviceTensor<B>>> {
        self(inputs)
    }
}

/// Re-executes a recorded graph.
///
/// Inputs at static positions must sit at the addresses they had at capture time; their
/// contents are read in place.
pub trait ReplayFn<B: DeviceBackend>: Send {
    fn replay(&mut self, inputs: &[DeviceTensor<B>]) -> BackendResult<Vec<DeviceTensor<B>>>;
}

/// Records one execution of a model for later replay.
pub trait GraphCapture<B: DeviceBackend>: Send + Sync {
    fn capture(
        &self,
        model: Arc<dyn Model<B>>,
        inputs: &[DeviceTensor<B>],
        static_indices: &[usize],
    ) -> BackendResult<Box<dyn ReplayFn<B>>>;
}

/// Capture-time addresses of the static inputs, checked again on every replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticInputs {
    arity: usize,
    addresses: Vec<(usize, u64)>,
}

impl StaticInputs {
    pub fn record<B: DeviceBackend>(
        inputs: &[DeviceTensor<B>],
        static_indices: &[usize],
    ) -> BackendResult<Self> {
        let addresses = static_indices
            .iter()
            .map(|&index| {
                inputs
                    .get(index)
                    .map(|tensor| (index, tensor.device_ptr()))
                    .ok_or_else(|| {
                        BackendError::capture(format!(
                            "static index {index} is out of range for {} inputs",
                            inputs.len()
                        ))
                    })
            })
            .collect::<BackendResult<Vec<_>>>()?;
        Ok(Self {
            arity: inputs.len(),
            addresses,
        })
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn addresses(&self) -> &[(usize, u64)] {
        &self.addresses
    }

    pub fn verify<B: DeviceBackend>(&self, inputs: &[DeviceTensor<B>]) -> BackendResult<()> {
        if inputs.len() != self.arity {
            return Err(BackendError::capture(format!(
                "replay expects {} inputs, got {}",
                self.arity,
                inputs.len()
            )));
        }
        for &(index, expected) in &self.addresses {
            let actual = inputs[index].device_ptr();
            if actual != expected {
                return Err(BackendError::capture(format!(
                    "static input {index} moved from {expected:#x} to {actual:#x} since capture"
                )));
            }
        }
        Ok(())
    }
}
