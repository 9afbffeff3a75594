use super::device_tensor::DeviceTensor;
use super::dtype::DType;
use super::shape::Shape;
use crate::backend::spec::DeviceBackend;

/// An input known only by dtype and shape; no data exists yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolicInput {
    pub dtype: DType,
    pub shape: Shape,
}

impl SymbolicInput {
    pub fn new(dtype: DType, shape: Shape) -> Self {
        Self { dtype, shape }
    }
}

/// Example input handed to [`crate::GraphWrapper::new`].
///
/// A single `Symbolic` entry defers capture until the first call with real data.
#[derive(Debug)]
pub enum GraphInput<B: DeviceBackend> {
    Concrete(DeviceTensor<B>),
    Symbolic(SymbolicInput),
}

impl<B: DeviceBackend> GraphInput<B> {
    pub fn is_symbolic(&self) -> bool {
        matches!(self, GraphInput::Symbolic(_))
    }

    pub fn dtype(&self) -> DType {
        match self {
            GraphInput::Concrete(tensor) => tensor.dtype(),
            GraphInput::Symbolic(symbolic) => symbolic.dtype,
        }
    }

    pub fn shape(&self) -> &Shape {
        match self {
            GraphInput::Concrete(tensor) => tensor.shape(),
            GraphInput::Symbolic(symbolic) => &symbolic.shape,
        }
    }
}

impl<B: DeviceBackend> Clone for GraphInput<B> {
    fn clone(&self) -> Self {
        match self {
            GraphInput::Concrete(tensor) => GraphInput::Concrete(tensor.clone()),
            GraphInput::Symbolic(symbolic) => GraphInput::Symbolic(symbolic.clone()),
        }
    }
}

impl<B: DeviceBackend> From<DeviceTensor<B>> for GraphInput<B> {
    fn from(tensor: DeviceTensor<B>) -> Self {
        GraphInput::Concrete(tensor)
    }
}

impl<B: DeviceBackend> From<SymbolicInput> for GraphInput<B> {
    fn from(symbolic: SymbolicInput) -> Self {
        GraphInput::Symbolic(symbolic)
    }
}
