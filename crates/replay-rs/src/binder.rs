//! Copies call inputs into pooled, address-stable buffers.

use tracing::trace;

use crate::backend::spec::{BackendError, BackendResult, DeviceBackend, DeviceBuffer};
use crate::pool::{InputSignature, PoolGuard, PoolKey};
use crate::tensor::{DeviceTensor, GraphInput};

/// Pool-backed copies of one call's inputs, in input order.
#[derive(Debug)]
pub struct BoundInputs<B: DeviceBackend> {
    pub tensors: Vec<DeviceTensor<B>>,
    pub signature: InputSignature,
}

/// Binds `inputs` into buffers drawn from the pool behind `guard`.
///
/// Each bound tensor has the shape and strides of its input, starts at offset 0 of a pooled
/// buffer and holds a copy of the input's values. Inputs with equal keys receive distinct
/// buffers in registration order, so an unchanged [`InputSignature`] always lands on the same
/// addresses.
pub fn bind_inputs<B: DeviceBackend>(
    guard: &mut PoolGuard<'_, B>,
    inputs: &[DeviceTensor<B>],
) -> BackendResult<BoundInputs<B>> {
    let mut snapshot = guard.acquire_borrow_snapshot();
    let mut tensors = Vec::with_capacity(inputs.len());
    let mut keys = Vec::with_capacity(inputs.len());

    for (position, input) in inputs.iter().enumerate() {
        let key = PoolKey::for_tensor(input);
        let buffer = guard.resolve(&mut snapshot, key)?;
        if buffer.dtype() != input.dtype() {
            return Err(BackendError::execution(format!(
                "pooled buffer for input {position} holds {} but the input is {}",
                buffer.dtype(),
                input.dtype()
            )));
        }
        let extent = input.extent();
        if extent > buffer.capacity() {
            return Err(BackendError::CapacityExceeded {
                position,
                required: extent,
                capacity: buffer.capacity(),
            });
        }

        // The view starts at offset 0: an offset would move the address the graph records.
        let before = buffer.device_ptr();
        let view = DeviceTensor::new(buffer, input.shape().clone(), input.strides().clone(), 0)?;
        // Same shape and strides on both sides, so the storage span carries every element.
        guard.backend().copy_span(
            view.buffer(),
            0,
            input.buffer(),
            input.storage_offset(),
            extent,
        )?;
        let after = view.device_ptr();
        if after != before {
            return Err(BackendError::AddressInstability {
                position,
                expected: before,
                actual: after,
            });
        }

        trace!(
            position,
            key = %key,
            src = input.device_ptr(),
            dst = after,
            extent,
            "bound input"
        );
        tensors.push(view);
        keys.push(key);
    }

    Ok(BoundInputs {
        tensors,
        signature: InputSignature::new(keys),
    })
}

/// Extracts the concrete tensors from `inputs`, failing on the first symbolic entry.
pub fn concrete_inputs<B: DeviceBackend>(
    inputs: &[GraphInput<B>],
) -> BackendResult<Vec<DeviceTensor<B>>> {
    inputs
        .iter()
        .enumerate()
        .map(|(position, input)| match input {
            GraphInput::Concrete(tensor) => Ok(tensor.clone()),
            GraphInput::Symbolic(_) => Err(BackendError::SymbolicInput { position }),
        })
        .collect()
}
