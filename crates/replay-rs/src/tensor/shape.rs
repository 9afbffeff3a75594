//! Shapes, element strides and the storage extent they imply.

/// Stores the logical dimensions of a tensor. A rank-0 shape describes a scalar.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new<D: Into<Vec<usize>>>(dims: D) -> Self {
        Shape { dims: dims.into() }
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Computes the total number of elements implied by the shape.
    pub fn num_elements(&self) -> usize {
        self.dims.iter().product()
    }
}

/// Per-axis element strides. Strides are non-negative; a zero stride broadcasts an axis.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Strides {
    strides: Vec<usize>,
}

impl Strides {
    pub fn new<S: Into<Vec<usize>>>(strides: S) -> Self {
        Strides {
            strides: strides.into(),
        }
    }

    /// Row-major strides for `shape`.
    pub fn contiguous(shape: &Shape) -> Self {
        let mut strides = vec![0; shape.rank()];
        let mut acc = 1usize;
        for (axis, dim) in shape.dims().iter().enumerate().rev() {
            strides[axis] = acc;
            acc *= (*dim).max(1);
        }
        Strides { strides }
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.strides
    }

    pub fn rank(&self) -> usize {
        self.strides.len()
    }
}

/// Number of elements a `(shape, strides)` layout addresses when it starts at offset 0.
///
/// Empty shapes touch nothing; otherwise the extent is one past the furthest element.
pub fn storage_extent(shape: &Shape, strides: &Strides) -> usize {
    if shape.dims().iter().any(|&dim| dim == 0) {
        return 0;
    }
    1 + shape
        .dims()
        .iter()
        .zip(strides.as_slice())
        .map(|(dim, stride)| (dim - 1) * stride)
        .sum::<usize>()
}

/// Element offsets of every logical index in row-major order.
pub(crate) fn logical_offsets(shape: &Shape, strides: &Strides) -> Vec<usize> {
    let total = shape.num_elements();
    let mut offsets = Vec::with_capacity(total);
    if total == 0 {
        return offsets;
    }
    let dims = shape.dims();
    let mut index = vec![0usize; dims.len()];
    for _ in 0..total {
        offsets.push(
            index
                .iter()
                .zip(strides.as_slice())
                .map(|(i, s)| i * s)
                .sum(),
        );
        for axis in (0..dims.len()).rev() {
            index[axis] += 1;
            if index[axis] < dims[axis] {
                break;
            }
            index[axis] = 0;
        }
    }
    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contiguous_strides_are_row_major() {
        let shape = Shape::new([2, 3, 4]);
        assert_eq!(Strides::contiguous(&shape).as_slice(), &[12, 4, 1]);
    }

    #[test]
    fn extent_of_transposed_layout_covers_storage() {
        let shape = Shape::new([3, 2]);
        let strides = Strides::new([1, 3]);
        assert_eq!(storage_extent(&shape, &strides), 6);
        assert_eq!(logical_offsets(&shape, &strides), vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn extent_handles_broadcast_and_empty_shapes() {
        let broadcast = Shape::new([4, 3]);
        assert_eq!(storage_extent(&broadcast, &Strides::new([0, 1])), 3);
        let empty = Shape::new([0, 5]);
        assert_eq!(storage_extent(&empty, &Strides::contiguous(&empty)), 0);
        let scalar = Shape::new(Vec::new());
        assert_eq!(storage_extent(&scalar, &Strides::contiguous(&scalar)), 1);
    }
}
