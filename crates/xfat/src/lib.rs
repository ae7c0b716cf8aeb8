//! A FAT16/FAT32 filesystem core with extended directory entries (XDE):
//! POSIX-style ownership and permissions stored in an extra 32-byte record
//! after each short-name entry, in a form legacy FAT drivers skip.
//!
//! The core sits between a host VFS layer and a block device. Hosts mount a
//! `Volume` over anything implementing `BlockDevice` and drive it through
//! `NodeHandle`s.
//!
//! # Resources
//!
//! - <https://en.wikipedia.org/wiki/Design_of_the_FAT_file_system>
//! - <https://academy.cba.mit.edu/classes/networking_communications/SD/FAT.pdf>
//! - <https://wiki.osdev.org/FAT>

#![cfg_attr(not(test), no_std)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss,
    clippy::cargo_common_metadata,
    clippy::implicit_hasher,
    clippy::implicit_return,
    clippy::missing_const_for_fn,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::multiple_crate_versions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::suboptimal_flops,
    clippy::wildcard_imports
)]

extern crate alloc;

mod allocator;
mod block;
mod boot;
mod ctx;
mod dir;
mod dirent;
mod error;
mod fat;
mod file;
mod format;
mod io;
mod name;
mod node;
mod txlog;
mod vc;
mod volume;
mod xde;

pub use allocator::*;
pub use block::*;
pub use boot::*;
pub use dir::*;
pub use dirent::*;
pub use error::*;
pub use fat::*;
pub use file::*;
pub use format::*;
pub use io::*;
pub use name::*;
pub use node::*;
pub use txlog::*;
pub use vc::*;
pub use volume::*;
pub use xde::*;
