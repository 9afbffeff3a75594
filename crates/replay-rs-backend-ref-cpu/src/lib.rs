//! Reference host-memory backend for `replay-rs`.
//!
//! Buffers are plain host allocations with stable addresses. Graph capture is emulated by
//! recording the operations submitted while a capture is open and re-executing them on
//! replay, which gives the same contract a device stream capture does.

pub mod capture;
pub mod cpu;

pub use capture::CpuGraphCapture;
pub use cpu::{CpuBackend, CpuBuffer, UnaryF32};
