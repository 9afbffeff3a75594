//! Backend-agnostic conformance suite.
//!
//! Every check is a plain generic function over a backend and its capture primitive, so GPU
//! crates can call them one by one behind an availability check. Backends that are always
//! present instantiate the whole suite with [`define_backend_tests!`].

pub mod harness;
pub mod properties;
pub mod scenarios;

#[macro_export]
macro_rules! define_backend_tests {
    ($module:ident, $backend_ctor:expr, $capture_ctor:expr) => {
        #[cfg(test)]
        mod $module {
            #[allow(unused_imports)]
            use super::*;

            use $crate::{properties, scenarios};

            macro_rules! backend_test {
                ($name:ident, $func:path) => {
                    #[test]
                    fn $name() {
                        let backend = ($backend_ctor)();
                        let capture = ($capture_ctor)(&backend);
                        $func(&backend, capture);
                    }
                };
            }

            backend_test!(
                address_stability_across_identical_signatures,
                properties::address_stability_across_identical_signatures
            );
            backend_test!(
                bound_views_preserve_values_shape_and_strides,
                properties::bound_views_preserve_values_shape_and_strides
            );
            backend_test!(
                pool_grows_by_exact_deficit,
                properties::pool_grows_by_exact_deficit
            );
            backend_test!(fifo_reuse_order, properties::fifo_reuse_order);
            backend_test!(
                dtype_separates_buffers,
                properties::dtype_separates_buffers
            );
            backend_test!(
                eager_two_inputs_rebind_to_same_addresses,
                scenarios::eager_two_inputs_rebind_to_same_addresses
            );
            backend_test!(
                pool_grows_from_one_to_two,
                scenarios::pool_grows_from_one_to_two
            );
            backend_test!(
                deferred_capture_runs_once_and_preserves_rng,
                scenarios::deferred_capture_runs_once_and_preserves_rng
            );
            backend_test!(
                replay_observes_rebound_values,
                scenarios::replay_observes_rebound_values
            );
            backend_test!(
                changed_signature_is_rejected,
                scenarios::changed_signature_is_rejected
            );
            backend_test!(
                lenient_signature_rejects_moved_static_inputs,
                scenarios::lenient_signature_rejects_moved_static_inputs
            );
            backend_test!(
                capture_failure_leaves_wrapper_uncaptured,
                scenarios::capture_failure_leaves_wrapper_uncaptured
            );
        }
    };
}
