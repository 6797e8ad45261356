#![allow(clippy::len_without_is_empty)]

//! RUM inverted index: an entry B-tree of keys, each pointing to a sorted
//! posting list or posting tree of row pointers that may carry additional
//! information used for ordering.

pub mod datatype;
pub mod error;
pub mod guc;
pub mod index;
pub mod opclass;
pub mod page;
pub mod tree;

#[cfg(any(test, feature = "rum_test"))]
pub mod tests;

#[cfg(not(target_pointer_width = "64"))]
compile_error!("Target is not supported.");
