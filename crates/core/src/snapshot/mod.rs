//! Structure snapshots of media entry roots.
//!
//! A snapshot records every directory, file and symlink below a root along
//! with file sizes and sampled fingerprints, so the same tree can be rebuilt
//! and verified elsewhere.

mod capture;
mod types;

pub use capture::{capture, capture_blocking, fingerprint_file, SAMPLE_SIZE};
pub use types::*;
