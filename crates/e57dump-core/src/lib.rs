//! # e57dump-core
//!
//! A reader for the ASTM E57 3D imaging data format.
//!
//! An E57 file is a container mixing a small binary header, an embedded
//! XML document describing the data, and one or more binary
//! "CompressedVector" sections holding point-cloud records encoded with
//! per-component bit-packing and checksummed paging. This crate opens
//! such a file from any byte source addressable by absolute offset and
//! provides:
//!
//! - a decoded description of the point sets and their components
//! - a streaming decode of each point set into caller-supplied
//!   interleaved `f32` buffers
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`file`]: file handle, header validation, paged CRC-checked reads
//! - `xml`: the SAX-driven binder turning the embedded document into
//!   point-set prototypes
//! - [`cvector`]: packet reading, bit unpacking, and the record
//!   scheduler
//! - [`error`]: error types and handling
//!
//! ## Example
//!
//! ```no_run
//! use e57dump_core::{E57File, WriteDesc};
//! use std::fs;
//!
//! let data = fs::read("./scan.e57")?;
//! let size = data.len() as u64;
//! let mut e57 = E57File::open(data, size)?;
//!
//! // Inspect the prototype of the first point set
//! for component in &e57.points()[0].components {
//!     println!("{} ({})", component.role.as_str(), component.value.type_name());
//! }
//!
//! // Decode the first component into a flat buffer, 1024 records at a time
//! let mut buffer = vec![0f32; 1024];
//! let write = [WriteDesc { offset: 0, stride: 1, stream: 0 }];
//! e57.read_points(0, &write, &mut buffer, 1024, |values, count| {
//!     println!("got {count} values, first = {}", values[0]);
//!     true
//! })?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Decoding model
//!
//! Records are delivered in batches, in record order, through a consume
//! callback. All component values are down-converted to `f32` in the
//! output buffer regardless of their declared type; this is a
//! deliberate simplification of the format's type surface.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unreachable_pub)]

mod bytes;
pub mod cvector;
pub mod error;
pub mod file;
mod xml;

#[cfg(test)]
mod testsup;

// Re-export primary types for convenience
pub use cvector::WriteDesc;
pub use error::{Error, Result};
pub use file::{
    ByteSource, Component, ComponentValue, E57File, FileHeader, PageLayout, PointSet, Role,
};

/// Crate version for programmatic access
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
