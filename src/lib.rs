//! This crate implements a general-purpose dynamic memory allocator based on
//! boundary-tagged blocks and an explicit doubly-linked free list.
//!
//!  - **Classic malloc shape.** First-fit placement with block splitting,
//!    constant-time coalescing of freed blocks with both physical neighbors,
//!    and reallocation that grows in place whenever the next block can
//!    absorb the growth.
//!
//!  - **The heap region is provided by an application.** The allocator pulls
//!    memory through the [`HeapSource`] trait, an `sbrk`-like primitive that
//!    grows a contiguous region upward. A fixed buffer ([`ArenaSource`]) and
//!    the actual program break ([`SbrkSource`], Unix only) are built in.
//!
//!  - **This crate supports `#![no_std]`.** Nothing in the core requires an
//!    operating system; only `SbrkSource` is platform-specific.
//!
//!  - **Self-checking.** [`Heap::check`] walks the whole heap and the free
//!    list and cross-verifies every structural invariant, reporting
//!    violations through the [`log`] facade. It doubles as the oracle for
//!    this crate's randomized tests.
//!
//! # Examples
//!
//! ```rust
//! use reflist::{ArenaSource, Heap};
//! use core::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//! let mut heap = Heap::new(ArenaSource::new(&mut pool)).unwrap();
//!
//! unsafe {
//!     let p = heap.allocate(24).unwrap();
//!     p.as_ptr().write_bytes(0xa5, 24);
//!     let q = heap.allocate(100).unwrap();
//!     assert_ne!(p, q);
//!     heap.deallocate(q);
//!     heap.deallocate(p);
//! }
//! assert_eq!(heap.check(false), 0);
//! ```
//!
//! The raw-pointer surface mirrors C `malloc`/`free`/`realloc`, including
//! their null-pointer conventions:
//!
//! ```rust
//! use reflist::{ArenaSource, Heap};
//! use core::{mem::MaybeUninit, ptr};
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//! let mut heap = Heap::new(ArenaSource::new(&mut pool)).unwrap();
//!
//! unsafe {
//!     heap.free(ptr::null_mut()); // no-op
//!     let p = heap.realloc(ptr::null_mut(), 64); // same as malloc(64)
//!     assert!(!p.is_null());
//!     assert!(heap.realloc(p, 0).is_null()); // frees `p`
//! }
//! ```
#![no_std]

mod heap;
mod source;

pub use self::{
    heap::{Heap, OutOfMemory, CHUNK_SIZE, DWORD, MIN_BLOCK_SIZE, WORD},
    source::{ArenaSource, HeapSource},
};

#[cfg(unix)]
pub use self::source::SbrkSource;

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod tests;
