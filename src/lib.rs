//! # **loam**: a generational heap for a dynamic language runtime
//!
//! This is the storage manager underneath an interpreter: a non-moving,
//! generational, mark-sweep collector over cons cells, symbols,
//! environments, promises, and typed vectors. Object addresses are stable
//! for their whole lifetime; what a collection changes is only which
//! intrusive list a node is threaded on.
//!
//! ```rust
//! use loam::{Heap, Tag};
//!
//! fn main() -> Result<(), loam::Error> {
//!     let mut heap = Heap::default();
//!     let v = heap.alloc_vector(Tag::Int, 3)?;
//!     heap.protect(v)?;
//!     unsafe {
//!         let data = loam::atom::int_data(v);
//!         for i in 0..3 {
//!             *data.add(i) = i as i32 * 10;
//!         }
//!     }
//!     heap.gc();
//!     assert_eq!(unsafe { *loam::atom::int_data(v).add(2) }, 20);
//!     heap.unprotect(1)?;
//!     Ok(())
//! }
//! ```
//!
//! Interpreter code holds temporaries across allocations with
//! [`Heap::protect`]/[`Heap::unprotect`], long-lived values with
//! [`Heap::preserve`], and everything else by registering external root
//! slots. Every mutation of a reference field goes through the setter
//! functions on [`Heap`]; they are the write barrier.

#![allow(clippy::missing_safety_doc)]

#[macro_use]
extern crate log;

#[macro_use]
pub mod error;
pub mod atom;
pub mod fin;
pub mod gengc;
pub mod logging;

pub use atom::{Atom, Complex, Tag, NUM_NODE_CLASSES, NUM_OLD_GENERATIONS};
pub use error::{Error, ErrorKind};
pub use fin::NativeFinalizer;
pub use gengc::{EvalHook, GcStats, GcSummary, Heap};
