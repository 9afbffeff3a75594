//! Backend contract consumed by the pool, the binder and the wrapper.

pub mod spec;
