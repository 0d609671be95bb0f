//! Pre-reserved tensor buffers with a single-writer lease protocol.
//!
//! The hot path is a single-threaded per-frame pipeline, so leases are
//! expressed through ownership instead of locks: leasing takes the pooled
//! buffer out of the arena, and a second lease while one is outstanding
//! falls back to a freshly allocated buffer without ever blocking.
//! Capacity grows monotonically; there is no compaction.

use std::ops::{Deref, DerefMut};

use log::warn;

/// A leased `f32` buffer, either pooled (returned to the arena on release)
/// or a heap fallback (dropped on release).
pub struct LeasedF32 {
    buf: Vec<f32>,
    pooled: bool,
}

/// A leased byte buffer for preprocessing scratch space.
pub struct LeasedU8 {
    buf: Vec<u8>,
    pooled: bool,
}

macro_rules! lease_impls {
    ($name:ident, $elem:ty) => {
        impl $name {
            pub fn is_pooled(&self) -> bool {
                self.pooled
            }
        }

        impl Deref for $name {
            type Target = [$elem];
            fn deref(&self) -> &[$elem] {
                &self.buf
            }
        }

        impl DerefMut for $name {
            fn deref_mut(&mut self) -> &mut [$elem] {
                &mut self.buf
            }
        }
    };
}

lease_impls!(LeasedF32, f32);
lease_impls!(LeasedU8, u8);

/// Reusable buffers for the input tensor, raw output tensor, and
/// preprocessing scratch space.
#[derive(Debug, Default)]
pub struct TensorArena {
    input: Option<Vec<f32>>,
    output: Option<Vec<f32>>,
    scratch: Option<Vec<u8>>,
    input_capacity: usize,
    output_capacity: usize,
    scratch_capacity: usize,
}

impl TensorArena {
    pub fn new() -> Self {
        Self {
            input: Some(Vec::new()),
            output: Some(Vec::new()),
            scratch: Some(Vec::new()),
            ..Default::default()
        }
    }

    /// Pre-size all three pools so the steady state never allocates.
    pub fn reserve(&mut self, input_len: usize, output_len: usize, scratch_len: usize) {
        if let Some(buf) = self.input.as_mut() {
            buf.reserve(input_len.saturating_sub(buf.capacity()));
            self.input_capacity = self.input_capacity.max(buf.capacity().max(input_len));
        }
        if let Some(buf) = self.output.as_mut() {
            buf.reserve(output_len.saturating_sub(buf.capacity()));
            self.output_capacity = self.output_capacity.max(buf.capacity().max(output_len));
        }
        if let Some(buf) = self.scratch.as_mut() {
            buf.reserve(scratch_len.saturating_sub(buf.capacity()));
            self.scratch_capacity = self.scratch_capacity.max(buf.capacity().max(scratch_len));
        }
    }

    /// Lease the input tensor buffer, sized to `len` elements.
    pub fn lease_input(&mut self, len: usize) -> LeasedF32 {
        match self.input.take() {
            Some(mut buf) => {
                buf.resize(len, 0.0);
                self.input_capacity = self.input_capacity.max(buf.capacity());
                LeasedF32 { buf, pooled: true }
            }
            None => {
                warn!("input buffer already leased; falling back to heap allocation");
                LeasedF32 {
                    buf: vec![0.0; len],
                    pooled: false,
                }
            }
        }
    }

    /// Lease the raw output buffer, sized to `len` elements.
    pub fn lease_output(&mut self, len: usize) -> LeasedF32 {
        match self.output.take() {
            Some(mut buf) => {
                buf.resize(len, 0.0);
                self.output_capacity = self.output_capacity.max(buf.capacity());
                LeasedF32 { buf, pooled: true }
            }
            None => {
                warn!("output buffer already leased; falling back to heap allocation");
                LeasedF32 {
                    buf: vec![0.0; len],
                    pooled: false,
                }
            }
        }
    }

    /// Lease the preprocessing scratch buffer, sized to `len` bytes.
    pub fn lease_scratch(&mut self, len: usize) -> LeasedU8 {
        match self.scratch.take() {
            Some(mut buf) => {
                buf.resize(len, 0);
                self.scratch_capacity = self.scratch_capacity.max(buf.capacity());
                LeasedU8 { buf, pooled: true }
            }
            None => {
                warn!("scratch buffer already leased; falling back to heap allocation");
                LeasedU8 {
                    buf: vec![0; len],
                    pooled: false,
                }
            }
        }
    }

    /// Return every lease to the arena. Heap fallbacks are dropped.
    pub fn release_all(&mut self, input: LeasedF32, output: LeasedF32, scratch: LeasedU8) {
        if input.pooled {
            self.input = Some(input.buf);
        }
        if output.pooled {
            self.output = Some(output.buf);
        }
        if scratch.pooled {
            self.scratch = Some(scratch.buf);
        }
    }

    /// Bytes reserved across the three pools, including leased-out buffers.
    pub fn reserved_bytes(&self) -> usize {
        (self.input_capacity + self.output_capacity) * std::mem::size_of::<f32>()
            + self.scratch_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_and_release_reuses_capacity() {
        let mut arena = TensorArena::new();
        let input = arena.lease_input(1024);
        assert!(input.is_pooled());
        assert_eq!(input.len(), 1024);
        let output = arena.lease_output(64);
        let scratch = arena.lease_scratch(16);
        arena.release_all(input, output, scratch);

        let input = arena.lease_input(512);
        assert!(input.is_pooled());
        // Capacity from the first lease is retained.
        assert!(arena.reserved_bytes() >= 1024 * 4);
        let output = arena.lease_output(64);
        let scratch = arena.lease_scratch(16);
        arena.release_all(input, output, scratch);
    }

    #[test]
    fn second_lease_falls_back_without_blocking() {
        let mut arena = TensorArena::new();
        let first = arena.lease_input(8);
        let second = arena.lease_input(8);
        assert!(first.is_pooled());
        assert!(!second.is_pooled());

        let output = arena.lease_output(8);
        let scratch = arena.lease_scratch(8);
        arena.release_all(second, output, scratch);
        // The fallback was dropped, not pooled, so the original slot is
        // still empty until the real lease comes back.
        let third = arena.lease_input(8);
        assert!(!third.is_pooled());
        drop(first);
        drop(third);
    }

    #[test]
    fn reserve_grows_monotonically() {
        let mut arena = TensorArena::new();
        arena.reserve(100, 200, 300);
        let bytes = arena.reserved_bytes();
        assert!(bytes >= 100 * 4 + 200 * 4 + 300);
        arena.reserve(10, 20, 30);
        assert!(arena.reserved_bytes() >= bytes);
    }
}
