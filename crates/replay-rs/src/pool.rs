//! Append-only reservoir of address-stable buffers.
//!
//! Buffers are bucketed by [`PoolKey`] (power-of-two element count and dtype) and handed out
//! in registration order. A call works against a [`PoolSnapshot`] so that several inputs
//! sharing a key each receive a distinct buffer, while the master collections keep their
//! order. Buffers are only ever appended; a pool grows to the highest concurrent demand any
//! call has made for each key and keeps that memory until it is dropped.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::spec::{BackendResult, DeviceBackend, DeviceBuffer};
use crate::tensor::{DType, DeviceTensor};

/// Smallest power-of-two element count covering a storage length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SizeClass(usize);

impl SizeClass {
    /// Rounds `storage_len` up to the next power of two. Empty storage maps to class 1.
    pub fn for_storage_len(storage_len: usize) -> Self {
        SizeClass(storage_len.next_power_of_two())
    }

    pub fn elements(self) -> usize {
        self.0
    }
}

/// Bucket identity inside a [`BufferPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub size_class: SizeClass,
    pub dtype: DType,
}

impl PoolKey {
    pub fn new(size_class: SizeClass, dtype: DType) -> Self {
        Self { size_class, dtype }
    }

    /// Key for a tensor, derived from its raw storage length rather than its logical size.
    pub fn for_tensor<B: DeviceBackend>(tensor: &DeviceTensor<B>) -> Self {
        Self::new(SizeClass::for_storage_len(tensor.storage_len()), tensor.dtype())
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.size_class.elements(), self.dtype)
    }
}

/// Ordered pool keys of one call's inputs.
///
/// Two calls with equal signatures bind to buffers at identical addresses, position by position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InputSignature(Vec<PoolKey>);

impl InputSignature {
    pub fn new(keys: Vec<PoolKey>) -> Self {
        Self(keys)
    }

    pub fn keys(&self) -> &[PoolKey] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for InputSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, key) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{key}")?;
        }
        f.write_str("]")
    }
}

/// Reuse and growth counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Requests served from an already registered buffer.
    pub reuse_hits: u64,
    /// Requests that allocated and registered a new buffer.
    pub allocations: u64,
    /// Buffers currently registered across all keys.
    pub buffers: usize,
    /// Bytes held by registered buffers.
    pub bytes: usize,
}

struct PoolInner<B: DeviceBackend> {
    buffers: HashMap<PoolKey, VecDeque<Arc<B::Buffer>>>,
    stats: PoolStats,
}

/// Shared reservoir of fixed-address buffers for one backend.
///
/// Construct one per service and hand it to every wrapper that should share memory. All
/// access goes through [`BufferPool::lock`], which serialises binders across wrappers.
pub struct BufferPool<B: DeviceBackend> {
    backend: Arc<B>,
    inner: Mutex<PoolInner<B>>,
}

impl<B: DeviceBackend> BufferPool<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            inner: Mutex::new(PoolInner {
                buffers: HashMap::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// Acquires exclusive access to the pool for the duration of one call.
    ///
    /// The master collections are append-only, so a panic while the lock was held cannot leave
    /// them half-updated and a poisoned lock is recovered.
    pub fn lock(&self) -> PoolGuard<'_, B> {
        PoolGuard {
            backend: self.backend.as_ref(),
            inner: self.inner.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    pub fn buffer_count(&self, key: PoolKey) -> usize {
        self.lock().buffer_count(key)
    }

    /// Registered keys in sorted order.
    pub fn keys(&self) -> Vec<PoolKey> {
        let guard = self.lock();
        let mut keys: Vec<PoolKey> = guard.inner.buffers.keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> PoolStats {
        self.lock().inner.stats
    }

    /// Drops every registered buffer and zeroes the counters.
    ///
    /// Only for isolating test cases: graphs captured against the dropped buffers keep their
    /// own references, but later binds will no longer land on the captured addresses.
    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.inner.buffers.clear();
        guard.inner.stats = PoolStats::default();
    }
}

impl<B: DeviceBackend> fmt::Debug for BufferPool<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("backend", &self.backend.backend_name())
            .field("stats", &self.stats())
            .finish()
    }
}

/// Exclusive access to a [`BufferPool`], held for a whole bind (and, inside a wrapper, for the
/// replay that consumes the bound buffers).
pub struct PoolGuard<'a, B: DeviceBackend> {
    backend: &'a B,
    inner: MutexGuard<'a, PoolInner<B>>,
}

impl<B: DeviceBackend> PoolGuard<'_, B> {
    pub fn backend(&self) -> &B {
        self.backend
    }

    /// Call-local copy of every master collection. Buffer identities are shared, cursors are not.
    pub fn acquire_borrow_snapshot(&self) -> PoolSnapshot<B> {
        PoolSnapshot {
            queues: self
                .inner
                .buffers
                .iter()
                .map(|(key, queue)| (*key, queue.iter().map(Arc::clone).collect()))
                .collect(),
        }
    }

    /// Pops the head buffer for `key` from the snapshot, or `None` when it is exhausted.
    pub fn take_from_snapshot(
        &mut self,
        snapshot: &mut PoolSnapshot<B>,
        key: PoolKey,
    ) -> Option<Arc<B::Buffer>> {
        let buffer = snapshot.queues.get_mut(&key)?.pop_front()?;
        self.inner.stats.reuse_hits += 1;
        Some(buffer)
    }

    /// Allocates a buffer of exactly `key.size_class` elements and appends it to the master
    /// collection for `key`.
    pub fn allocate_and_register(&mut self, key: PoolKey) -> BackendResult<Arc<B::Buffer>> {
        let buffer = self
            .backend
            .allocate(key.dtype, key.size_class.elements())?;
        let queue = self.inner.buffers.entry(key).or_default();
        queue.push_back(Arc::clone(&buffer));
        let registered = queue.len();
        let stats = &mut self.inner.stats;
        stats.allocations += 1;
        stats.buffers += 1;
        stats.bytes += buffer.byte_len();
        debug!(
            key = %key,
            registered,
            ptr = buffer.device_ptr(),
            "buffer pool grew"
        );
        Ok(buffer)
    }

    /// Takes the next snapshot buffer for `key`, allocating one when the snapshot has run dry.
    pub fn resolve(
        &mut self,
        snapshot: &mut PoolSnapshot<B>,
        key: PoolKey,
    ) -> BackendResult<Arc<B::Buffer>> {
        match self.take_from_snapshot(snapshot, key) {
            Some(buffer) => Ok(buffer),
            None => self.allocate_and_register(key),
        }
    }

    pub fn buffer_count(&self, key: PoolKey) -> usize {
        self.inner.buffers.get(&key).map_or(0, VecDeque::len)
    }
}

/// FIFO cursors over the master collections as they stood when the snapshot was taken.
pub struct PoolSnapshot<B: DeviceBackend> {
    queues: HashMap<PoolKey, VecDeque<Arc<B::Buffer>>>,
}

impl<B: DeviceBackend> PoolSnapshot<B> {
    /// Buffers for `key` not yet taken from this snapshot.
    pub fn remaining(&self, key: PoolKey) -> usize {
        self.queues.get(&key).map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostBackend;

    fn f32_key(elements: usize) -> PoolKey {
        PoolKey::new(SizeClass::for_storage_len(elements), DType::F32)
    }

    fn resolve_n(pool: &BufferPool<HostBackend>, key: PoolKey, n: usize) -> Vec<u64> {
        let mut guard = pool.lock();
        let mut snapshot = guard.acquire_borrow_snapshot();
        (0..n)
            .map(|_| guard.resolve(&mut snapshot, key).expect("resolve").device_ptr())
            .collect()
    }

    #[test]
    fn size_class_rounds_up_to_power_of_two() {
        assert_eq!(SizeClass::for_storage_len(0).elements(), 1);
        assert_eq!(SizeClass::for_storage_len(1).elements(), 1);
        assert_eq!(SizeClass::for_storage_len(100).elements(), 128);
        assert_eq!(SizeClass::for_storage_len(128).elements(), 128);
        assert_eq!(SizeClass::for_storage_len(300).elements(), 512);
    }

    #[test]
    fn snapshot_hands_out_distinct_buffers_in_fifo_order() {
        let pool = BufferPool::new(Arc::new(HostBackend::default()));
        let key = f32_key(100);
        let first = resolve_n(&pool, key, 2);
        assert_ne!(first[0], first[1]);

        assert_eq!(resolve_n(&pool, key, 1), vec![first[0]]);
        assert_eq!(resolve_n(&pool, key, 1), vec![first[0]]);
        assert_eq!(resolve_n(&pool, key, 2), first);
        assert_eq!(pool.buffer_count(key), 2);
    }

    #[test]
    fn growth_is_exactly_the_deficit() {
        let pool = BufferPool::new(Arc::new(HostBackend::default()));
        let key = f32_key(64);
        resolve_n(&pool, key, 1);
        assert_eq!(pool.buffer_count(key), 1);
        resolve_n(&pool, key, 3);
        assert_eq!(pool.buffer_count(key), 3);
        resolve_n(&pool, key, 2);
        assert_eq!(pool.buffer_count(key), 3);

        let stats = pool.stats();
        assert_eq!(stats.allocations, 3);
        assert_eq!(stats.reuse_hits, 3);
        assert_eq!(stats.buffers, 3);
        assert_eq!(stats.bytes, 3 * 64 * 4);
    }

    #[test]
    fn snapshot_is_independent_of_master_growth() {
        let pool = BufferPool::new(Arc::new(HostBackend::default()));
        let key = f32_key(8);
        resolve_n(&pool, key, 1);

        let mut guard = pool.lock();
        let mut snapshot = guard.acquire_borrow_snapshot();
        assert_eq!(snapshot.remaining(key), 1);
        guard.allocate_and_register(key).expect("allocate");
        assert_eq!(snapshot.remaining(key), 1);
        assert!(guard.take_from_snapshot(&mut snapshot, key).is_some());
        assert!(guard.take_from_snapshot(&mut snapshot, key).is_none());
        assert_eq!(guard.buffer_count(key), 2);
    }

    #[test]
    fn dtype_is_part_of_the_key() {
        let pool = BufferPool::new(Arc::new(HostBackend::default()));
        let f32_ptr = resolve_n(&pool, PoolKey::new(SizeClass::for_storage_len(16), DType::F32), 1);
        let i32_ptr = resolve_n(&pool, PoolKey::new(SizeClass::for_storage_len(16), DType::I32), 1);
        assert_ne!(f32_ptr, i32_ptr);
        assert_eq!(pool.keys().len(), 2);
    }

    #[test]
    fn reset_empties_the_pool() {
        let pool = BufferPool::new(Arc::new(HostBackend::default()));
        let key = f32_key(4);
        resolve_n(&pool, key, 2);
        pool.reset();
        assert_eq!(pool.buffer_count(key), 0);
        assert_eq!(pool.stats(), PoolStats::default());
    }

    #[test]
    fn signature_and_stats_render_for_diagnostics() {
        let signature = InputSignature::new(vec![f32_key(100), f32_key(300)]);
        assert_eq!(signature.to_string(), "[(128, f32), (512, f32)]");
        let json = serde_json::to_value(PoolStats {
            reuse_hits: 1,
            allocations: 2,
            buffers: 2,
            bytes: 64,
        })
        .expect("serialize stats");
        assert_eq!(json["allocations"], 2);
    }
}
