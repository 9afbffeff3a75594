//! Pool and binder properties every backend must satisfy.

use std::sync::Arc;

use replay_rs::backend::spec::DeviceBackend;
use replay_rs::capture::GraphCapture;
use replay_rs::pool::{PoolKey, SizeClass};
use replay_rs::tensor::{DType, DeviceTensor, Shape, Strides};
use replay_rs::bind_inputs;

use crate::harness::{addresses, assert_capacity, Harness};

/// Two binds with identical signatures land on identical addresses.
pub fn address_stability_across_identical_signatures<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let first = [h.random_tensor(100, 1), h.random_tensor(300, 2), h.random_tensor(7, 3)];
    let second = [h.random_tensor(128, 4), h.random_tensor(257, 5), h.random_tensor(5, 6)];

    let a = bind_inputs(&mut h.pool.lock(), &first).expect("first bind");
    let b = bind_inputs(&mut h.pool.lock(), &second).expect("second bind");

    assert_eq!(a.signature, b.signature);
    assert_eq!(addresses(&a.tensors), addresses(&b.tensors));
    assert_eq!(h.pool.stats().allocations, 3);
}

/// Bound views differ in address from their inputs but agree on values, shape and strides.
pub fn bound_views_preserve_values_shape_and_strides<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let storage: Vec<f32> = (0..24).map(|i| i as f32 * 0.5).collect();
    // A transposed 4x3 view starting at element 6 of its storage.
    let transposed = DeviceTensor::from_storage(
        backend.as_ref(),
        &storage,
        Shape::new([4, 3]),
        Strides::new([1, 4]),
        6,
    )
    .expect("upload strided input");
    let plain = h.random_tensor(33, 7);
    let inputs = [transposed, plain];

    let bound = bind_inputs(&mut h.pool.lock(), &inputs).expect("bind");
    for (view, input) in bound.tensors.iter().zip(&inputs) {
        assert_ne!(view.device_ptr(), input.device_ptr());
        assert_eq!(view.shape(), input.shape());
        assert_eq!(view.strides(), input.strides());
        assert_eq!(view.storage_offset(), 0);
        assert_capacity(view.buffer().as_ref(), input.extent());
        assert_eq!(h.read(view), h.read(input));
    }
}

/// A call needing more buffers than registered grows the pool by exactly the deficit.
pub fn pool_grows_by_exact_deficit<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let key = PoolKey::new(SizeClass::for_storage_len(16), DType::F32);

    bind_inputs(&mut h.pool.lock(), &[h.random_tensor(16, 1)]).expect("bind one");
    assert_eq!(h.pool.buffer_count(key), 1);

    let three = [h.random_tensor(9, 2), h.random_tensor(16, 3), h.random_tensor(12, 4)];
    bind_inputs(&mut h.pool.lock(), &three).expect("bind three");
    assert_eq!(h.pool.buffer_count(key), 3);

    bind_inputs(&mut h.pool.lock(), &three[..2]).expect("bind two");
    assert_eq!(h.pool.buffer_count(key), 3);

    let stats = h.pool.stats();
    assert_eq!(stats.allocations, 3);
    assert_eq!(stats.reuse_hits, 3);
    assert_eq!(stats.buffers, 3);
    assert_eq!(stats.bytes, 3 * 16 * DType::F32.size_in_bytes());
}

/// Buffers sharing a key are handed out in registration order on every call.
pub fn fifo_reuse_order<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let pair = [h.random_tensor(4, 1), h.random_tensor(3, 2)];
    let registered = addresses(&bind_inputs(&mut h.pool.lock(), &pair).expect("bind pair").tensors);
    assert_ne!(registered[0], registered[1]);

    for _ in 0..2 {
        let single = bind_inputs(&mut h.pool.lock(), &[h.random_tensor(4, 3)]).expect("bind one");
        assert_eq!(addresses(&single.tensors), vec![registered[0]]);
    }
    let again = bind_inputs(&mut h.pool.lock(), &pair).expect("bind pair again");
    assert_eq!(addresses(&again.tensors), registered);
}

/// Element type is part of the key: equal size classes of different dtypes never share.
pub fn dtype_separates_buffers<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let floats = h.random_tensor(8, 1);
    let ints = DeviceTensor::from_slice(backend.as_ref(), Shape::new([8]), &[1i32; 8])
        .expect("upload ints");

    let bound = bind_inputs(&mut h.pool.lock(), &[floats, ints]).expect("bind");
    assert_ne!(bound.tensors[0].device_ptr(), bound.tensors[1].device_ptr());
    assert_eq!(bound.tensors[1].dtype(), DType::I32);
    assert_eq!(
        bound.tensors[1]
            .to_vec::<i32>(backend.as_ref())
            .expect("read ints"),
        vec![1; 8]
    );
    assert_eq!(h.pool.keys().len(), 2);
}
