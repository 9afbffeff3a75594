//! Address-stable input pooling and capture/replay wrappers for accelerator graphs.
//!
//! A captured graph bakes the device addresses of its inputs into the recording. Call sites
//! hand over tensors at whatever address they happen to live, so every call copies its inputs
//! into pooled buffers whose addresses never change, then replays the recording over them.
//! [`GraphWrapper`] drives that sequence; [`BufferPool`] and [`bind_inputs`] provide the
//! address-stable storage.

pub mod backend;
pub mod binder;
pub mod capture;
pub mod config;
mod env;
pub mod pool;
pub mod rng;
pub mod tensor;
#[cfg(test)]
mod testing;
pub mod wrapper;

pub use backend::spec::{BackendError, BackendResult, DeviceBackend, DeviceBuffer};
pub use binder::{bind_inputs, BoundInputs};
pub use capture::{GraphCapture, Model, ReplayFn, StaticInputs};
pub use config::ReplayConfig;
pub use pool::{
    BufferPool, InputSignature, PoolGuard, PoolKey, PoolSnapshot, PoolStats, SizeClass,
};
pub use rng::{preserve_rng_state, NoRngState, RngSnapshot, RngStatePreserver, SharedRng};
pub use tensor::{DType, DeviceTensor, Element, GraphInput, Shape, Strides, SymbolicInput};
pub use wrapper::{CallState, GraphWrapper, WrapperContext, WrapperMode};
