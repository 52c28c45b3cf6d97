// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Walks the heap through its detection repertoire on the host: a clean
//! round trip, an off-by-one overrun, a double free, and a stomped tag,
//! with the violation hook narrating.
//!
//! Run with `cargo run -p sheap --example detect`.

use sheap::{SecureHeap, TAG_BYTES};
use tripwire::Violation;

fn narrate(kind: Violation, msg: &str) {
    println!("  [tripwire] {kind:?}: {msg}");
}

fn main() {
    tripwire::set_hook(narrate);

    let mut arena = [0u8; 1024];
    let mut heap: SecureHeap<'_> = SecureHeap::new(&mut arena).unwrap();
    println!(
        "heap up: {} bytes, {} of them usable",
        heap.heap_size(),
        heap.heap_size() - 2 * TAG_BYTES
    );

    // A well-behaved caller.
    let p = heap.allocate(100, 0x1001).unwrap();
    println!("allocated 100 bytes, {} in use", heap.allocated_bytes());
    heap.free(p.as_ptr(), 0x1002).unwrap();
    println!("freed cleanly, {} in use", heap.allocated_bytes());

    // Classic off-by-one on a sub-word request.
    println!("writing buf[5] of a 5-byte buffer:");
    let p = heap.allocate(5, 0x2001).unwrap();
    unsafe { p.as_ptr().add(5).write(0) };
    let refused = heap.free(p.as_ptr(), 0x2002).is_err();
    println!("  free refused: {refused}");
    unsafe { p.as_ptr().add(5).write(0xFF) };
    heap.free(p.as_ptr(), 0x2003).unwrap();

    // Freeing twice.
    println!("freeing the same pointer twice:");
    let p = heap.allocate(64, 0x3001).unwrap();
    heap.free(p.as_ptr(), 0x3002).unwrap();
    let refused = heap.free(p.as_ptr(), 0x3003).is_err();
    println!("  second free refused: {refused}");

    // Who was here? Newest first.
    let mut ids = [0u32; 4];
    let n = heap.latest_ids(&mut ids);
    println!("last {n} caller ids: {:08x?}", &ids[..n]);

    let report = heap.audit().unwrap();
    println!(
        "audit: {} block(s), largest free span {} bytes",
        report.blocks, report.largest_free
    );
}
