//! Scoped save/restore of pseudo-random generator state.
//!
//! The deferred capture path runs the model an extra time before recording it. Any random
//! numbers that run draws must not be observable by the caller, so the run is wrapped in
//! [`preserve_rng_state`].

use std::any::Any;
use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::warn;

/// Opaque generator state produced by [`RngStatePreserver::save`].
pub struct RngSnapshot(Box<dyn Any + Send>);

impl RngSnapshot {
    pub fn new<T: Any + Send>(state: T) -> Self {
        Self(Box::new(state))
    }

    pub fn downcast<T: Any>(self) -> Option<T> {
        self.0.downcast::<T>().ok().map(|state| *state)
    }
}

/// Source of generator state that can be snapshotted and restored.
pub trait RngStatePreserver: Send + Sync {
    fn save(&self) -> RngSnapshot;

    fn restore(&self, snapshot: RngSnapshot);
}

/// Runs `f` and restores the generator state afterwards, including when `f` fails or panics.
pub fn preserve_rng_state<P, T>(preserver: &P, f: impl FnOnce() -> T) -> T
where
    P: RngStatePreserver + ?Sized,
{
    let _restore = RestoreOnDrop {
        preserver,
        snapshot: Some(preserver.save()),
    };
    f()
}

struct RestoreOnDrop<'a, P: RngStatePreserver + ?Sized> {
    preserver: &'a P,
    snapshot: Option<RngSnapshot>,
}

impl<P: RngStatePreserver + ?Sized> Drop for RestoreOnDrop<'_, P> {
    fn drop(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            self.preserver.restore(snapshot);
        }
    }
}

/// Process-visible generator shared between a model and its callers.
pub struct SharedRng {
    rng: Mutex<StdRng>,
}

impl SharedRng {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Runs `f` with exclusive access to the generator.
    pub fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }

    pub fn next_u64(&self) -> u64 {
        self.with_rng(|rng| rng.next_u64())
    }

    pub fn next_f32(&self) -> f32 {
        self.with_rng(|rng| rng.gen::<f32>())
    }
}

impl RngStatePreserver for SharedRng {
    fn save(&self) -> RngSnapshot {
        RngSnapshot::new(self.with_rng(|rng| rng.clone()))
    }

    fn restore(&self, snapshot: RngSnapshot) {
        match snapshot.downcast::<StdRng>() {
            Some(state) => self.with_rng(|rng| *rng = state),
            None => warn!("ignoring rng snapshot that was not produced by SharedRng"),
        }
    }
}

/// Preserver for backends whose models consume no randomness.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRngState;

impl RngStatePreserver for NoRngState {
    fn save(&self) -> RngSnapshot {
        RngSnapshot::new(())
    }

    fn restore(&self, _snapshot: RngSnapshot) {}
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use super::*;

    #[test]
    fn draws_inside_the_scope_are_undone() {
        let rng = SharedRng::seed_from_u64(7);
        let reference = SharedRng::seed_from_u64(7);

        let drawn = preserve_rng_state(&rng, || (rng.next_u64(), rng.next_u64()));
        assert_ne!(drawn.0, drawn.1);
        assert_eq!(rng.next_u64(), reference.next_u64());
    }

    #[test]
    fn state_is_restored_when_the_scope_fails() {
        let rng = SharedRng::seed_from_u64(11);
        let before = rng.save();

        let result: Result<(), &str> = preserve_rng_state(&rng, || {
            rng.next_u64();
            Err("boom")
        });
        assert!(result.is_err());
        let after_error = rng.next_u64();
        rng.restore(before);
        assert_eq!(after_error, rng.next_u64());
    }

    #[test]
    fn state_is_restored_when_the_scope_panics() {
        let rng = SharedRng::seed_from_u64(3);
        let reference = SharedRng::seed_from_u64(3);

        let outcome = catch_unwind(AssertUnwindSafe(|| {
            preserve_rng_state(&rng, || {
                rng.next_f32();
                panic!("warm-up exploded");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(rng.next_u64(), reference.next_u64());
    }

    #[test]
    fn foreign_snapshots_are_ignored() {
        let rng = SharedRng::seed_from_u64(5);
        let reference = SharedRng::seed_from_u64(5);
        rng.restore(NoRngState.save());
        assert_eq!(rng.next_u64(), reference.next_u64());
    }
}
