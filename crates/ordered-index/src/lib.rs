//! An ordered index: a red-black tree keyed by `u32`, used by the filesystem
//! core to track open nodes by directory-entry location and freed cluster
//! extents by start cluster.
//!
//! Nodes live in a slot arena and refer to each other by index, so the tree
//! never hands out pointers. Duplicate keys are allowed; a duplicate is
//! inserted after every existing node with the same key.

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(
    clippy::cargo_common_metadata,
    clippy::doc_markdown,
    clippy::implicit_return,
    clippy::len_without_is_empty,
    clippy::missing_const_for_fn,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default
)]

extern crate alloc;

mod tree;

pub use tree::*;
