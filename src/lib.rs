//! mph_cascade — BBHash-style minimal perfect hashing.
//!
//! - Build once on a set of **unique** keys (u64 / bytes / strings).
//! - O(1) lookups: key -> unique index in `[0..n)`.
//! - Cascade of atomic bit-arrays with rank directories; keys a level
//!   cannot place fall through to the next, stragglers to an explicit
//!   fallback table.
//! - Parallel fill workers (`parallel` feature), deterministic images for
//!   a fixed seed, compact little-endian serialization.

mod bitarray;
mod build_hasher;
mod builder;
mod cascade;
mod hash;
mod progress;
mod serialize;
mod spill;

pub use bitarray::BitArray;
pub use builder::{BuildConfig, Builder, MphError};
pub use cascade::{Level, Mphf};
pub use hash::MphKey;
pub use progress::{NoProgress, ProgressReporter, StderrProgress};
pub use spill::{SpillConfig, SpillKey};
