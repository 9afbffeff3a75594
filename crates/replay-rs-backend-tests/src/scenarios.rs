//! End-to-end wrapper scenarios: eager and deferred capture over a real capture primitive.

use std::sync::Arc;

use replay_rs::backend::spec::{BackendError, DeviceBackend};
use replay_rs::capture::{GraphCapture, Model};
use replay_rs::pool::{PoolKey, SizeClass};
use replay_rs::tensor::{DType, GraphInput, Shape, SymbolicInput};
use replay_rs::{bind_inputs, CallState, GraphWrapper, ReplayConfig, SharedRng, WrapperMode};

use crate::harness::{addresses, Harness, MirrorModel};

fn symbolic<B: DeviceBackend>(len: usize) -> GraphInput<B> {
    SymbolicInput::new(DType::F32, Shape::new([len])).into()
}

/// Inputs of 100 and 300 f32 take classes 128 and 512; a later call with 120 and 400
/// elements binds to the same two buffers and replays without a new capture.
pub fn eager_two_inputs_rebind_to_same_addresses<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let model = Arc::new(MirrorModel::new(backend, 2));
    let examples = vec![h.random_tensor(100, 1).into(), h.random_tensor(300, 2).into()];
    let mut wrapper = GraphWrapper::new(h.context(), model as Arc<dyn Model<B>>, examples)
        .expect("eager wrapper");
    assert_eq!(wrapper.mode(), WrapperMode::Eager);
    assert_eq!(h.capture.captures(), 1);

    let signature = wrapper.signature().cloned().expect("captured signature");
    assert_eq!(
        signature.keys(),
        &[
            PoolKey::new(SizeClass::for_storage_len(100), DType::F32),
            PoolKey::new(SizeClass::for_storage_len(300), DType::F32),
        ]
    );
    assert_eq!(signature.keys()[0].size_class.elements(), 128);
    assert_eq!(signature.keys()[1].size_class.elements(), 512);

    wrapper
        .call(&[h.random_tensor(120, 3), h.random_tensor(400, 4)])
        .expect("replay with same classes");
    assert_eq!(h.capture.captures(), 1);
    assert_eq!(h.pool.stats().allocations, 2);

    // The replay succeeding means the static addresses held; the binder alone shows the same.
    let first = [h.random_tensor(100, 5), h.random_tensor(300, 6)];
    let second = [h.random_tensor(120, 7), h.random_tensor(400, 8)];
    let first = bind_inputs(&mut h.pool.lock(), &first).expect("bind first");
    let second = bind_inputs(&mut h.pool.lock(), &second).expect("bind second");
    assert_eq!(addresses(&first.tensors), addresses(&second.tensors));
    assert_eq!(h.pool.stats().allocations, 2);
}

/// A pool holding one (128, f32) buffer grows to exactly two for a call that needs two.
pub fn pool_grows_from_one_to_two<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let key = PoolKey::new(SizeClass::for_storage_len(128), DType::F32);

    let single = GraphWrapper::new(
        h.context(),
        Arc::new(MirrorModel::new(backend, 1)) as Arc<dyn Model<B>>,
        vec![h.random_tensor(128, 1).into()],
    )
    .expect("single-input wrapper");
    assert_eq!(h.pool.buffer_count(key), 1);
    drop(single);

    let mut pair = GraphWrapper::new(
        h.context(),
        Arc::new(MirrorModel::new(backend, 2)) as Arc<dyn Model<B>>,
        vec![h.random_tensor(100, 2).into(), h.random_tensor(128, 3).into()],
    )
    .expect("two-input wrapper");
    assert_eq!(h.pool.buffer_count(key), 2);

    pair.call(&[h.random_tensor(97, 4), h.random_tensor(65, 5)])
        .expect("replay");
    assert_eq!(h.pool.buffer_count(key), 2);
    assert_eq!(h.pool.stats().allocations, 2);
}

/// The first concrete call of a deferred wrapper warms up and captures once; the caller's
/// generator is left where it was, and later calls only replay.
pub fn deferred_capture_runs_once_and_preserves_rng<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let rng = Arc::new(SharedRng::seed_from_u64(7));
    let model = Arc::new(MirrorModel::new(backend, 1).with_rng(Arc::clone(&rng)));
    let mut wrapper = GraphWrapper::new(
        h.context().with_rng(rng.clone()),
        model.clone() as Arc<dyn Model<B>>,
        vec![symbolic(16)],
    )
    .expect("deferred wrapper");
    assert_eq!(wrapper.mode(), WrapperMode::Deferred);
    assert_eq!(wrapper.state(), CallState::NotCaptured);
    assert_eq!(h.capture.captures(), 0);

    let reference = SharedRng::seed_from_u64(7);
    wrapper.call(&[h.random_tensor(16, 1)]).expect("first call");
    assert_eq!(wrapper.state(), CallState::Captured);
    assert_eq!(h.capture.captures(), 1);
    // One warm-up and one capture run executed the host code; both draws were rolled back.
    assert_eq!(model.forwards(), 2);
    assert_eq!(rng.next_u64(), reference.next_u64());

    wrapper.call(&[h.random_tensor(16, 2)]).expect("second call");
    wrapper.call(&[h.random_tensor(16, 3)]).expect("third call");
    assert_eq!(h.capture.captures(), 1);
    assert_eq!(model.forwards(), 2);
}

/// Each replay reads the values bound for that call.
pub fn replay_observes_rebound_values<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let model = Arc::new(MirrorModel::new(backend, 2));
    let mut wrapper = GraphWrapper::new(
        h.context(),
        model as Arc<dyn Model<B>>,
        vec![h.random_tensor(24, 1).into(), h.random_tensor(5, 2).into()],
    )
    .expect("eager wrapper");

    for seed in 10..13 {
        let inputs = [h.random_tensor(24, seed), h.random_tensor(5, seed + 100)];
        let outputs = wrapper.call(&inputs).expect("replay");
        assert_eq!(outputs.len(), 2);
        assert_eq!(h.read(&outputs[0]), h.read(&inputs[0]));
        assert_eq!(h.read(&outputs[1]), h.read(&inputs[1]));
    }
    assert_eq!(h.capture.captures(), 1);
}

/// Strict mode rejects a call whose size classes differ from the captured ones and leaves
/// the pool untouched.
pub fn changed_signature_is_rejected<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let mut wrapper = GraphWrapper::new(
        h.context(),
        Arc::new(MirrorModel::new(backend, 1)) as Arc<dyn Model<B>>,
        vec![h.random_tensor(64, 1).into()],
    )
    .expect("eager wrapper");
    let before = h.pool.stats();

    let err = wrapper
        .call(&[h.random_tensor(65, 2)])
        .expect_err("size class changed");
    assert!(matches!(err, BackendError::SignatureMismatch { .. }), "{err}");
    assert_eq!(h.pool.stats(), before);

    wrapper
        .call(&[h.random_tensor(33, 3)])
        .expect("same class still replays");
}

/// With signature checks off, a call in a new size class is bound into a freshly grown
/// buffer and the replay refuses the moved static address.
pub fn lenient_signature_rejects_moved_static_inputs<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let context = h
        .context()
        .with_config(ReplayConfig::default().with_strict_signature(false));
    let mut wrapper = GraphWrapper::new(
        context,
        Arc::new(MirrorModel::new(backend, 1)) as Arc<dyn Model<B>>,
        vec![h.random_tensor(64, 1).into()],
    )
    .expect("eager wrapper");
    let captured = PoolKey::new(SizeClass::for_storage_len(64), DType::F32);
    let grown = PoolKey::new(SizeClass::for_storage_len(65), DType::F32);

    let err = wrapper
        .call(&[h.random_tensor(65, 2)])
        .expect_err("static input moved");
    assert!(matches!(err, BackendError::Capture { .. }), "{err}");
    assert_eq!(h.pool.buffer_count(captured), 1);
    assert_eq!(h.pool.buffer_count(grown), 1);
    assert_eq!(h.pool.stats().allocations, 2);
    assert_eq!(h.capture.captures(), 1);

    let input = h.random_tensor(40, 3);
    let outputs = wrapper
        .call(std::slice::from_ref(&input))
        .expect("captured class still replays");
    assert_eq!(h.read(&outputs[0])[..40], h.read(&input)[..]);
}

/// A failing capture surfaces its error and the next call captures from scratch.
pub fn capture_failure_leaves_wrapper_uncaptured<B, C>(backend: &Arc<B>, capture: Arc<C>)
where
    B: DeviceBackend,
    C: GraphCapture<B> + 'static,
{
    let h = Harness::new(backend, capture);
    let mut wrapper = GraphWrapper::new(
        h.context(),
        Arc::new(MirrorModel::new(backend, 1)) as Arc<dyn Model<B>>,
        vec![symbolic(8)],
    )
    .expect("deferred wrapper");

    h.capture.fail_next();
    let err = wrapper
        .call(&[h.random_tensor(8, 1)])
        .expect_err("capture fails");
    assert!(matches!(err, BackendError::Capture { .. }), "{err}");
    assert_eq!(wrapper.state(), CallState::NotCaptured);

    let input = h.random_tensor(8, 2);
    let outputs = wrapper.call(std::slice::from_ref(&input)).expect("retry captures");
    assert_eq!(wrapper.state(), CallState::Captured);
    assert_eq!(h.capture.captures(), 1);
    assert_eq!(h.read(&outputs[0]), h.read(&input));
}
