//! LIFO scratch-memory arenas, used by the filesystem core for short-lived
//! buffers (cluster zero-fill, directory record staging) in contexts where
//! going to the global allocator is undesirable.

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cargo_common_metadata,
    clippy::doc_markdown,
    clippy::implicit_return,
    clippy::len_without_is_empty,
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::redundant_pub_crate,
    clippy::wildcard_imports
)]

extern crate alloc;

mod arena;
mod registry;

pub use arena::*;
pub use registry::*;
