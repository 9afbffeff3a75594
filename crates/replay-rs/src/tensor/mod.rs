//! Core tensor abstractions shared across backends.
//!
//! Tensors here are views: a [`Shape`], [`Strides`] and a storage offset over a backend
//! buffer. Binding copies the storage span of a view into a pooled buffer and re-creates the
//! same view over it.

mod device_tensor;
pub mod dtype;
mod input;
pub mod shape;

pub use device_tensor::DeviceTensor;
pub use dtype::{DType, Element};
pub use input::{GraphInput, SymbolicInput};
pub use shape::{storage_extent, Shape, Strides};
