// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A corruption-detecting heap for small embedded targets.
//!
//! This crate replaces the usual allocate/free pair with a boundary-tagged
//! implementation that notices the common classes of heap abuse at the
//! moment of allocation or release, rather than letting them propagate:
//!
//! - freeing a pointer twice, or one that never came from the heap;
//! - writes past the end of a request, caught either in the alignment
//!   padding (1..3-byte overruns of a sub-word request) or as a damaged
//!   boundary tag;
//! - external corruption of block metadata, caught by the CRC-16 seal on
//!   every header and boundary tag.
//!
//! Detection never turns into repair: a refused operation leaves the arena
//! untouched, returns a typed error, and reports a [`tripwire::Violation`].
//!
//! # Using it
//!
//! Hand [`SecureHeap`] a `static` byte arena at startup and keep the handle
//! wherever your allocation calls live:
//!
//! ```
//! use sheap::SecureHeap;
//!
//! let mut arena = [0u8; 4096];
//! let mut heap: SecureHeap<'_> = SecureHeap::new(&mut arena).unwrap();
//!
//! let p = heap.allocate(96, 0x1001).unwrap();
//! // ... use the 96 bytes at `p` ...
//! heap.free(p.as_ptr(), 0x1002).unwrap();
//! ```
//!
//! `&mut self` on every mutating operation makes overlapped calls a compile
//! error. When the heap genuinely is shared -- several tasks, or task plus
//! interrupt -- wrap it in [`SharedHeap`], which adds a [`oslock::RawMutex`]
//! and maps acquisition failures onto the overlap/timeout violations.
//!
//! The `id` argument threaded through the calls is an opaque caller
//! identifier (call-site address, task id, a symbol hash -- whatever the
//! embedder likes). The last few are kept in a ring for post-mortem reads
//! via [`SecureHeap::latest_ids`], and the `extended-header` feature
//! additionally records the id in the block tag itself, queryable with
//! [`SecureHeap::allocation_id`].

#![cfg_attr(not(test), no_std)]

mod block;
mod heap;
mod idring;
mod shared;

pub use heap::{
    AllocError, AllocStrategy, AuditError, AuditReport, FreeError,
    HeapConfig, HeapStats, InitError, QueryError, SecureHeap, ALIGN_UNIT,
    AUTO_BLOCK_ID,
};
pub use shared::SharedHeap;

/// Tag bytes at each end of every block; a block costs `2 * TAG_BYTES`
/// beyond its payload.
pub const TAG_BYTES: usize = block::TAG_SIZE;
