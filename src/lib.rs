#![doc = include_str!("../README.md")]
#![feature(pointer_is_aligned)]
#![feature(const_option)]
#![feature(strict_provenance)]
#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

extern crate core;

pub mod bucket;
pub mod cli;
pub mod error;
pub mod format;
pub mod msg;
pub mod notify;
pub mod registry;
pub mod rewrite;
pub mod rights;
pub mod spawn;
pub mod trace;
pub mod traits;
pub mod walk;
pub mod wrapper;
