//! Synchronization primitives with optional loom support.
//!
//! The ring entry fields are the only memory shared with concurrent readers,
//! so they are the only place atomics are used. Under the `loom` feature they
//! are swapped for loom's model-checked versions.

#[cfg(not(feature = "loom"))]
pub use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering, compiler_fence, fence};

#[cfg(feature = "loom")]
pub use loom::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering, fence};

/// Compiler-only barrier.
///
/// loom does not model compiler fences; a full fence is a stronger stand-in
/// that keeps the model honest.
#[cfg(feature = "loom")]
#[inline]
pub fn compiler_fence(order: Ordering) {
    fence(order);
}
