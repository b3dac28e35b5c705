//! A fixed-capacity concurrent hash table for connection state.
//!
//! This crate provides a table mapping connection identifiers (or any other small, copyable key)
//! to small, copyable values, built to be hammered by many packet-handling threads at once. Think
//! per-connection state, or per-address counters for abuse protection.
//!
//! # Design
//!
//! The table is an array of `2^n` buckets, resolving collisions by linear probing. Every bucket
//! has its own reader/writer lock, so there is no global lock: readers snapshot a bucket under its
//! shared lock, and writers go through a compare-and-set primitive, which takes the exclusive lock
//! only for the compare and the write.
//!
//! A bucket is either empty, holds a live entry, or is a tombstone. Tombstones keep their key, so
//! that reinserting the same key reuses the slot. Keys never move once written, which is what
//! allows operations to identify an entry by its bucket alone.
//!
//! Lost races are retried according to the table's `Settings`, either forever (the default) or up
//! to a bound, with a configurable backoff in between.
//!
//! The capacity is fixed for the lifetime of the table, except through `Table::resize`, which
//! requires exclusive access.

extern crate crossbeam_utils;
extern crate parking_lot;
extern crate seahash;
#[macro_use]
extern crate slog;
#[macro_use]
extern crate quick_error;

#[macro_use]
mod fatal;

pub mod backoff;
mod bucket;
mod error;
mod key;
pub mod settings;
mod table;


pub use bucket::Occupancy;
pub use error::Error;
pub use key::ConnectionKey;
pub use settings::Settings;
pub use table::{DefaultHashBuilder, ReadGuard, Table};
